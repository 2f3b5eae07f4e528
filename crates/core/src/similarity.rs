use crate::error::SearchError;
use crate::models::ChunkRef;
use crate::store::ChunkIndex;

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| f64::from(*x) * f64::from(*y))
        .sum();
    let norm_a = norm(a);
    let norm_b = norm(b);
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn norm(vector: &[f32]) -> f64 {
    vector
        .iter()
        .map(|x| f64::from(*x) * f64::from(*x))
        .sum::<f64>()
        .sqrt()
}

#[derive(Debug, Clone, Copy)]
pub struct ScoredChunk<'a> {
    pub position: usize,
    pub score: f32,
    pub chunk: ChunkRef<'a>,
}

/// Ranks embedded chunks by descending cosine similarity to `query`, keeping
/// sequence order among equal scores. Chunks without an embedding are left out.
pub fn rank<'a>(
    query: &[f32],
    chunks: impl IntoIterator<Item = ChunkRef<'a>>,
    k: usize,
) -> Result<Vec<ScoredChunk<'a>>, SearchError> {
    let embedded = chunks
        .into_iter()
        .enumerate()
        .filter_map(|(position, chunk)| chunk.embedding().map(|vector| (position, chunk, vector)))
        .collect::<Vec<_>>();

    if embedded.is_empty() {
        return Err(SearchError::EmptyIndex);
    }
    if norm(query) == 0.0 {
        return Err(SearchError::ZeroQueryVector);
    }

    let mut scored = Vec::with_capacity(embedded.len());
    for (position, chunk, vector) in embedded {
        if vector.len() != query.len() {
            return Err(SearchError::DimensionMismatch {
                chunk_id: chunk.id().to_string(),
                expected: query.len(),
                actual: vector.len(),
            });
        }
        scored.push((cosine_similarity(query, vector), position, chunk));
    }

    // sort_by is stable, so equal scores keep sequence order
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));

    Ok(scored
        .into_iter()
        .take(k)
        .map(|(score, position, chunk)| ScoredChunk {
            position,
            score: score as f32,
            chunk,
        })
        .collect())
}

pub fn search<'a>(
    query: ChunkRef<'_>,
    index: &'a ChunkIndex,
    k: usize,
) -> Result<Vec<ScoredChunk<'a>>, SearchError> {
    let vector = query.embedding().ok_or(SearchError::MissingQueryEmbedding)?;
    rank(vector, index.chunks(), k)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Document, MediaType, TextChunk};
    use proptest::prelude::*;

    fn document_with(vectors: &[Option<Vec<f32>>]) -> Document {
        let mut document = Document::new("vectors.pdf");
        let texts = vectors
            .iter()
            .enumerate()
            .map(|(i, vector)| {
                let mut chunk =
                    TextChunk::new(&document, MediaType::Text, i as u32 + 1, format!("page {}", i + 1));
                chunk.embedding = vector.clone();
                chunk
            })
            .collect();
        document.texts = texts;
        document
    }

    fn query(vector: Vec<f32>) -> TextChunk {
        let mut chunk = TextChunk::query("q");
        chunk.embedding = Some(vector);
        chunk
    }

    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-12);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 3.0]).abs() < 1e-12);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-12);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn ranks_by_descending_similarity() -> Result<(), SearchError> {
        let index = ChunkIndex::new(vec![document_with(&[
            Some(vec![0.0, 1.0]),
            Some(vec![1.0, 0.0]),
            Some(vec![1.0, 1.0]),
        ])]);

        let hits = search(ChunkRef::Text(&query(vec![1.0, 0.1])), &index, 3)?;
        let positions = hits.iter().map(|hit| hit.position).collect::<Vec<_>>();
        assert_eq!(positions, vec![1, 2, 0]);
        assert!(hits.windows(2).all(|pair| pair[0].score >= pair[1].score));
        Ok(())
    }

    #[test]
    fn unembedded_chunks_are_left_out() -> Result<(), SearchError> {
        let index = ChunkIndex::new(vec![document_with(&[
            None,
            Some(vec![1.0, 0.0]),
            None,
        ])]);

        let hits = search(ChunkRef::Text(&query(vec![0.0, 1.0])), &index, 10)?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].position, 1);
        assert_eq!(hits[0].score, 0.0);
        Ok(())
    }

    #[test]
    fn ties_keep_index_order() -> Result<(), SearchError> {
        let index = ChunkIndex::new(vec![
            document_with(&[Some(vec![2.0, 0.0]), Some(vec![0.0, 1.0])]),
            document_with(&[Some(vec![5.0, 0.0])]),
        ]);

        let hits = search(ChunkRef::Text(&query(vec![1.0, 0.0])), &index, 2)?;
        let positions = hits.iter().map(|hit| hit.position).collect::<Vec<_>>();
        assert_eq!(positions, vec![0, 2]);
        assert_eq!(hits[0].chunk.tags().page_no, 1);
        Ok(())
    }

    #[test]
    fn k_beyond_index_returns_everything_once() -> Result<(), SearchError> {
        let index = ChunkIndex::new(vec![document_with(&[
            Some(vec![1.0, 2.0]),
            Some(vec![3.0, -1.0]),
            Some(vec![-2.0, 0.5]),
        ])]);

        let hits = search(ChunkRef::Text(&query(vec![1.0, 1.0])), &index, 50)?;
        let mut positions = hits.iter().map(|hit| hit.position).collect::<Vec<_>>();
        positions.sort_unstable();
        assert_eq!(positions, vec![0, 1, 2]);
        assert!(search(ChunkRef::Text(&query(vec![1.0, 1.0])), &index, 0)?.is_empty());
        Ok(())
    }

    #[test]
    fn search_errors() {
        let empty = ChunkIndex::new(vec![document_with(&[None, None])]);
        let q = query(vec![1.0, 0.0]);
        assert!(matches!(
            search(ChunkRef::Text(&q), &empty, 1),
            Err(SearchError::EmptyIndex)
        ));

        let index = ChunkIndex::new(vec![document_with(&[Some(vec![1.0, 0.0, 0.0])])]);
        assert!(matches!(
            search(ChunkRef::Text(&q), &index, 1),
            Err(SearchError::DimensionMismatch {
                expected: 2,
                actual: 3,
                ..
            })
        ));
        assert!(matches!(
            search(ChunkRef::Text(&TextChunk::query("bare")), &index, 1),
            Err(SearchError::MissingQueryEmbedding)
        ));
        assert!(matches!(
            rank(&[0.0, 0.0, 0.0], index.chunks(), 1),
            Err(SearchError::ZeroQueryVector)
        ));
    }

    fn vector_strategy() -> impl Strategy<Value = Vec<f32>> {
        prop::collection::vec(-100.0f32..100.0, 3)
    }

    proptest! {
        #[test]
        fn ranking_ignores_query_scale(
            vectors in prop::collection::vec(vector_strategy(), 1..12),
            query_vector in vector_strategy().prop_filter("non-zero", |v| v.iter().any(|x| x.abs() > 1e-3)),
            scale in 0.01f32..1000.0,
        ) {
            let document = document_with(&vectors.into_iter().map(Some).collect::<Vec<_>>());
            let index = ChunkIndex::new(vec![document]);
            let scaled = query_vector.iter().map(|x| x * scale).collect::<Vec<_>>();

            let base = rank(&query_vector, index.chunks(), usize::MAX)
                .map_err(|error| TestCaseError::fail(error.to_string()))?;
            let other = rank(&scaled, index.chunks(), usize::MAX)
                .map_err(|error| TestCaseError::fail(error.to_string()))?;

            prop_assert_eq!(base.len(), other.len());
            for (left, right) in base.iter().zip(other.iter()) {
                prop_assert!((left.score - right.score).abs() < 1e-4);
                if left.position != right.position {
                    // only tied chunks may trade places
                    let tied = other
                        .iter()
                        .find(|hit| hit.position == left.position)
                        .map(|hit| (hit.score - left.score).abs() < 1e-4);
                    prop_assert_eq!(tied, Some(true));
                }
            }
        }
    }
}
