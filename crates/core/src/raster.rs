use crate::error::IngestError;
use image::{DynamicImage, ImageFormat};
use std::path::{Path, PathBuf};
use tempfile::TempPath;

const RASTER_PREFIX: &str = "pdf_chunk_";

/// A PNG crop written under a unique name. The file is deleted when this is
/// dropped, unless [`RasterFile::keep`] hands its path over to a chunk.
#[derive(Debug)]
pub struct RasterFile {
    path: TempPath,
}

impl RasterFile {
    pub fn write(raster: &DynamicImage, dir: &Path) -> Result<Self, IngestError> {
        let path = tempfile::Builder::new()
            .prefix(RASTER_PREFIX)
            .suffix(".png")
            .tempfile_in(dir)?
            .into_temp_path();
        raster.save_with_format(&path, ImageFormat::Png)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn keep(self) -> Result<PathBuf, IngestError> {
        self.path.keep().map_err(|error| IngestError::Io(error.error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use tempfile::tempdir;

    fn sample() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 3, image::Rgb([10, 20, 30])))
    }

    #[test]
    fn dropped_raster_is_removed() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let raster = RasterFile::write(&sample(), dir.path())?;
        let path = raster.path().to_path_buf();
        assert!(path.exists());

        drop(raster);
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn kept_raster_survives() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let kept = RasterFile::write(&sample(), dir.path())?.keep()?;

        assert!(kept.exists());
        let name = kept.file_name().and_then(|name| name.to_str()).unwrap_or_default();
        assert!(name.starts_with(RASTER_PREFIX));
        assert!(name.ends_with(".png"));
        assert_eq!(image::open(&kept)?.to_rgb8().dimensions(), (4, 3));
        Ok(())
    }

    #[test]
    fn names_do_not_collide() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let first = RasterFile::write(&sample(), dir.path())?;
        let second = RasterFile::write(&sample(), dir.path())?;
        assert_ne!(first.path(), second.path());
        Ok(())
    }
}
