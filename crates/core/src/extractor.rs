use crate::error::IngestError;
use crate::traits::{CropBox, PageImage, PageSource, PdfBackend, PdfMetadata};
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use lopdf::content::Content;
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use std::collections::BTreeMap;
use std::path::Path;

const LETTER: (f32, f32) = (612.0, 792.0);
const MAX_TREE_DEPTH: usize = 32;
const IDENTITY: Matrix = [1.0, 0.0, 0.0, 1.0, 0.0, 0.0];
const MAX_IMAGE_SIDE: u32 = 1 << 16;

type Matrix = [f32; 6];

#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfBackend;

impl PdfBackend for LopdfBackend {
    fn open(&self, path: &Path) -> Result<Box<dyn PageSource>, IngestError> {
        let document = Document::load(path).map_err(|error| IngestError::SourceUnavailable {
            path: path.to_path_buf(),
            reason: error.to_string(),
        })?;
        Ok(Box::new(LopdfPages::new(document)))
    }
}

pub struct LopdfPages {
    document: Document,
    page_numbers: BTreeMap<u32, ObjectId>,
}

impl LopdfPages {
    pub fn new(document: Document) -> Self {
        let page_numbers = document.get_pages();
        Self {
            document,
            page_numbers,
        }
    }

    fn page_id(&self, page_no: u32) -> Result<ObjectId, IngestError> {
        self.page_numbers
            .get(&page_no)
            .copied()
            .ok_or_else(|| IngestError::PageExtraction {
                page: page_no,
                reason: "page not found".to_string(),
            })
    }

    fn resolve<'a>(&'a self, object: &'a Object) -> Option<&'a Object> {
        match object {
            Object::Reference(id) => self.document.get_object(*id).ok(),
            other => Some(other),
        }
    }

    fn resolve_dict<'a>(&'a self, object: &'a Object) -> Option<&'a Dictionary> {
        match self.resolve(object)? {
            Object::Dictionary(dict) => Some(dict),
            Object::Stream(stream) => Some(&stream.dict),
            _ => None,
        }
    }

    fn inherited(&self, page_id: ObjectId, key: &[u8]) -> Option<&Object> {
        let mut current = self.document.get_dictionary(page_id).ok()?;
        for _ in 0..MAX_TREE_DEPTH {
            if let Ok(value) = current.get(key) {
                return self.resolve(value);
            }
            let parent = match current.get(b"Parent") {
                Ok(Object::Reference(id)) => *id,
                _ => return None,
            };
            current = self.document.get_dictionary(parent).ok()?;
        }
        None
    }

    fn image_xobjects(&self, page_id: ObjectId) -> BTreeMap<Vec<u8>, &Stream> {
        let mut images = BTreeMap::new();
        let Some(resources) = self
            .inherited(page_id, b"Resources")
            .and_then(|object| self.resolve_dict(object))
        else {
            return images;
        };
        let Some(xobjects) = resources
            .get(b"XObject")
            .ok()
            .and_then(|object| self.resolve_dict(object))
        else {
            return images;
        };

        for (name, value) in xobjects.iter() {
            if let Some(Object::Stream(stream)) = self.resolve(value) {
                if matches!(stream.dict.get(b"Subtype"), Ok(Object::Name(subtype)) if subtype == b"Image")
                {
                    images.insert(name.clone(), stream);
                }
            }
        }
        images
    }

    fn page_content(&self, page_no: u32) -> Result<Content, IngestError> {
        let page_id = self.page_id(page_no)?;
        let data = self
            .document
            .get_page_content(page_id)
            .map_err(|error| page_error(page_no, error))?;
        Content::decode(&data).map_err(|error| page_error(page_no, error))
    }

    fn channels(&self, color_space: Option<&Object>) -> Result<usize, IngestError> {
        let Some(color_space) = color_space.and_then(|object| self.resolve(object)) else {
            return Ok(3);
        };
        match color_space {
            Object::Name(name) => match name.as_slice() {
                b"DeviceGray" | b"CalGray" => Ok(1),
                b"DeviceRGB" | b"CalRGB" => Ok(3),
                b"DeviceCMYK" => Ok(4),
                other => Err(IngestError::ImageRaster(format!(
                    "unsupported color space {}",
                    String::from_utf8_lossy(other)
                ))),
            },
            Object::Array(items) => {
                let is_icc = matches!(items.first(), Some(Object::Name(name)) if name == b"ICCBased");
                let components = items
                    .get(1)
                    .and_then(|object| self.resolve_dict(object))
                    .and_then(|dict| dict.get(b"N").ok())
                    .and_then(number);
                match (is_icc, components) {
                    (true, Some(count)) => Ok(count as usize),
                    _ => Err(IngestError::ImageRaster(
                        "unsupported indexed or special color space".to_string(),
                    )),
                }
            }
            _ => Err(IngestError::ImageRaster("malformed color space".to_string())),
        }
    }

    fn decode_image(&self, stream: &Stream) -> Result<DynamicImage, IngestError> {
        let filters = stream_filters(&stream.dict);
        if filters.iter().any(|filter| filter == b"DCTDecode") {
            return Ok(image::load_from_memory_with_format(
                &stream.content,
                ImageFormat::Jpeg,
            )?);
        }

        let mut raw = if filters.is_empty() {
            stream.content.clone()
        } else if filters.iter().all(|filter| filter == b"FlateDecode") {
            stream
                .decompressed_content()
                .map_err(|error| IngestError::ImageRaster(error.to_string()))?
        } else {
            return Err(IngestError::ImageRaster(format!(
                "unsupported image filter {}",
                filters
                    .iter()
                    .map(|filter| String::from_utf8_lossy(filter).to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            )));
        };

        let width = image_side(&stream.dict, b"Width")?;
        let height = image_side(&stream.dict, b"Height")?;
        let bits = dict_number(&stream.dict, b"BitsPerComponent").unwrap_or(8.0) as u32;
        if bits != 8 {
            return Err(IngestError::ImageRaster(format!(
                "unsupported bits per component {bits}"
            )));
        }

        let channels = self.channels(stream.dict.get(b"ColorSpace").ok())?;
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|pixels| pixels.checked_mul(channels))
            .ok_or_else(|| IngestError::ImageRaster(format!("image {width}x{height} too large")))?;
        if raw.len() < expected {
            return Err(IngestError::ImageRaster(format!(
                "image data has {} bytes, expected {expected}",
                raw.len()
            )));
        }
        raw.truncate(expected);

        let too_small = || IngestError::ImageRaster("image buffer does not fit".to_string());
        match channels {
            1 => GrayImage::from_raw(width, height, raw)
                .map(DynamicImage::ImageLuma8)
                .ok_or_else(too_small),
            3 => RgbImage::from_raw(width, height, raw)
                .map(DynamicImage::ImageRgb8)
                .ok_or_else(too_small),
            4 => RgbImage::from_raw(width, height, cmyk_to_rgb(&raw))
                .map(DynamicImage::ImageRgb8)
                .ok_or_else(too_small),
            other => Err(IngestError::ImageRaster(format!(
                "unsupported component count {other}"
            ))),
        }
    }
}

impl PageSource for LopdfPages {
    fn page_count(&self) -> u32 {
        self.page_numbers.len() as u32
    }

    fn page_size(&self, page_no: u32) -> Result<(f32, f32), IngestError> {
        let page_id = self.page_id(page_no)?;
        let media_box = self
            .inherited(page_id, b"MediaBox")
            .and_then(|object| match object {
                Object::Array(values) if values.len() == 4 => {
                    let values = values.iter().filter_map(number).collect::<Vec<_>>();
                    (values.len() == 4).then(|| {
                        (
                            (values[2] - values[0]).abs(),
                            (values[3] - values[1]).abs(),
                        )
                    })
                }
                _ => None,
            });
        Ok(media_box.unwrap_or(LETTER))
    }

    fn page_text(&self, page_no: u32) -> Result<String, IngestError> {
        self.page_id(page_no)?;
        self.document
            .extract_text(&[page_no])
            .map_err(|error| page_error(page_no, error))
    }

    fn page_images(&self, page_no: u32) -> Result<Vec<PageImage>, IngestError> {
        let page_id = self.page_id(page_no)?;
        let xobjects = self.image_xobjects(page_id);
        if xobjects.is_empty() {
            return Ok(Vec::new());
        }

        let content = self.page_content(page_no)?;
        let mut ctm = IDENTITY;
        let mut saved = Vec::new();
        let mut images = Vec::new();

        for operation in &content.operations {
            match operation.operator.as_str() {
                "q" => saved.push(ctm),
                "Q" => ctm = saved.pop().unwrap_or(IDENTITY),
                "cm" => {
                    let values = operation.operands.iter().filter_map(number).collect::<Vec<_>>();
                    if let [a, b, c, d, e, f] = values[..] {
                        ctm = multiply(&[a, b, c, d, e, f], &ctm);
                    }
                }
                "Do" => {
                    let Some(Object::Name(name)) = operation.operands.first() else {
                        continue;
                    };
                    if xobjects.contains_key(name) {
                        images.push(unit_square_bounds(name, &ctm));
                    }
                }
                _ => {}
            }
        }

        Ok(images)
    }

    fn render_image(
        &self,
        page_no: u32,
        image: &PageImage,
        crop: &CropBox,
        dpi: u32,
    ) -> Result<DynamicImage, IngestError> {
        let page_id = self.page_id(page_no)?;
        let xobjects = self.image_xobjects(page_id);
        let stream = xobjects.get(image.name.as_bytes()).ok_or_else(|| {
            IngestError::ImageRaster(format!("image {} not found on page {page_no}", image.name))
        })?;

        let decoded = self.decode_image(stream)?;
        let (_, page_height) = self.page_size(page_no)?;
        let (x, y, visible_width, visible_height) =
            visible_pixels(image, crop, page_height, decoded.width(), decoded.height());
        let visible = decoded.crop_imm(x, y, visible_width, visible_height);

        let (width, height) = crop.pixel_size(dpi);
        Ok(visible.resize_exact(width, height, FilterType::Triangle))
    }

    fn metadata(&self) -> Result<PdfMetadata, IngestError> {
        let mut metadata = PdfMetadata::new();
        let Some(info) = self
            .document
            .trailer
            .get(b"Info")
            .ok()
            .and_then(|object| self.resolve_dict(object))
        else {
            return Ok(metadata);
        };

        for (key, value) in info.iter() {
            if let Some(Object::String(bytes, _)) = self.resolve(value) {
                metadata.insert(String::from_utf8_lossy(key).to_string(), decode_text_string(bytes));
            }
        }
        Ok(metadata)
    }
}

fn page_error(page: u32, error: impl ToString) -> IngestError {
    IngestError::PageExtraction {
        page,
        reason: error.to_string(),
    }
}

fn number(object: &Object) -> Option<f32> {
    match object {
        Object::Integer(value) => Some(*value as f32),
        Object::Real(value) => Some(*value as f32),
        _ => None,
    }
}

fn dict_number(dict: &Dictionary, key: &[u8]) -> Result<f32, IngestError> {
    dict.get(key).ok().and_then(number).ok_or_else(|| {
        IngestError::ImageRaster(format!("image missing {}", String::from_utf8_lossy(key)))
    })
}

fn image_side(dict: &Dictionary, key: &[u8]) -> Result<u32, IngestError> {
    let value = dict_number(dict, key)?;
    if !(1.0..=MAX_IMAGE_SIDE as f32).contains(&value) {
        return Err(IngestError::ImageRaster(format!(
            "image {} of {value} is out of range",
            String::from_utf8_lossy(key)
        )));
    }
    Ok(value as u32)
}

// Pixel rectangle (x, y, width, height) of the part of the image that lies
// inside the crop. Row 0 of the image is its top edge on the page.
fn visible_pixels(
    image: &PageImage,
    crop: &CropBox,
    page_height: f32,
    width_px: u32,
    height_px: u32,
) -> (u32, u32, u32, u32) {
    let image_width = (image.x1 - image.x0).abs();
    let image_height = (image.y1 - image.y0).abs();
    if image_width <= 0.0 || image_height <= 0.0 {
        return (0, 0, width_px, height_px);
    }

    let image_left = image.x0.min(image.x1);
    let image_top = page_height - image.y1.max(image.y0);
    let span = |start: f32, end: f32, pixels: u32| {
        let from = (start.clamp(0.0, 1.0) * pixels as f32).floor() as u32;
        let to = (end.clamp(0.0, 1.0) * pixels as f32).ceil() as u32;
        let from = from.min(pixels.saturating_sub(1));
        (from, to.min(pixels).saturating_sub(from).max(1))
    };

    let (x, width) = span(
        (crop.left - image_left) / image_width,
        (crop.right - image_left) / image_width,
        width_px,
    );
    let (y, height) = span(
        (crop.top - image_top) / image_height,
        (crop.bottom - image_top) / image_height,
        height_px,
    );
    (x, y, width, height)
}

fn stream_filters(dict: &Dictionary) -> Vec<Vec<u8>> {
    match dict.get(b"Filter") {
        Ok(Object::Name(name)) => vec![name.clone()],
        Ok(Object::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Object::Name(name) => Some(name.clone()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn multiply(m: &Matrix, ctm: &Matrix) -> Matrix {
    [
        m[0] * ctm[0] + m[1] * ctm[2],
        m[0] * ctm[1] + m[1] * ctm[3],
        m[2] * ctm[0] + m[3] * ctm[2],
        m[2] * ctm[1] + m[3] * ctm[3],
        m[4] * ctm[0] + m[5] * ctm[2] + ctm[4],
        m[4] * ctm[1] + m[5] * ctm[3] + ctm[5],
    ]
}

/// Images are drawn into the unit square, so its transformed corners are the bbox.
fn unit_square_bounds(name: &[u8], ctm: &Matrix) -> PageImage {
    let corners = [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0)].map(|(x, y)| {
        (
            ctm[0] * x + ctm[2] * y + ctm[4],
            ctm[1] * x + ctm[3] * y + ctm[5],
        )
    });
    let xs = corners.map(|(x, _)| x);
    let ys = corners.map(|(_, y)| y);

    PageImage {
        name: String::from_utf8_lossy(name).to_string(),
        x0: xs.iter().copied().fold(f32::INFINITY, f32::min),
        y0: ys.iter().copied().fold(f32::INFINITY, f32::min),
        x1: xs.iter().copied().fold(f32::NEG_INFINITY, f32::max),
        y1: ys.iter().copied().fold(f32::NEG_INFINITY, f32::max),
    }
}

fn cmyk_to_rgb(raw: &[u8]) -> Vec<u8> {
    raw.chunks_exact(4)
        .flat_map(|pixel| {
            let k = 255 - pixel[3] as u16;
            [0, 1, 2].map(|index| ((255 - pixel[index] as u16) * k / 255) as u8)
        })
        .collect()
}

fn decode_text_string(bytes: &[u8]) -> String {
    if let Some(utf16) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        let units = utf16
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]));
        return char::decode_utf16(units)
            .map(|unit| unit.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect();
    }
    if let Some(utf8) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return String::from_utf8_lossy(utf8).to_string();
    }
    bytes.iter().map(|&byte| byte as char).collect()
}
