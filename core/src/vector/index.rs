//! In-memory vector index (spec §4.5): document-id → vector + metadata,
//! queried by cosine similarity over L2-normalized vectors.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::EngineError;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub vector: Vec<f32>,
    /// Always 1.0 after normalization; kept explicit to document the
    /// invariant rather than recompute it on every query.
    pub norm: f32,
    pub metadata: Option<Value>,
    pub text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewDocument {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: Option<Value>,
    pub text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub id: String,
    pub score: f32,
    pub metadata: Option<Value>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    pub k: usize,
    pub threshold: Option<f32>,
}

/// An in-memory vector index. Dimension is frozen on the first `add` and
/// every subsequent document must match it.
#[derive(Debug, Default)]
pub struct VectorIndex {
    dimension: Option<usize>,
    documents: HashMap<String, StoredDocument>,
}

fn normalize(vector: &[f32]) -> (Vec<f32>, f32) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        (vector.to_vec(), 0.0)
    } else {
        (vector.iter().map(|v| v / norm).collect(), 1.0)
    }
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension: Some(dimension),
            documents: HashMap::new(),
        }
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    /// Freezes the dimension on the first document added. Duplicate ids
    /// overwrite the prior entry.
    pub fn add(&mut self, document: NewDocument) -> Result<()> {
        let dimension = *self.dimension.get_or_insert(document.vector.len());
        if document.vector.len() != dimension {
            return Err(EngineError::InvalidInput(format!(
                "vector dimension {} does not match index dimension {dimension}",
                document.vector.len()
            )));
        }
        let (vector, norm) = normalize(&document.vector);
        self.documents.insert(
            document.id,
            StoredDocument {
                vector,
                norm,
                metadata: document.metadata,
                text: document.text,
            },
        );
        Ok(())
    }

    /// Unknown ids are silently skipped.
    pub fn remove(&mut self, ids: &[String]) {
        for id in ids {
            self.documents.remove(id);
        }
    }

    /// A full copy of the index's documents, for offloading to disk.
    pub fn snapshot_documents(&self) -> Vec<(String, StoredDocument)> {
        self.documents
            .iter()
            .map(|(id, doc)| (id.clone(), doc.clone()))
            .collect()
    }

    pub fn query(&self, query_vector: &[f32], options: QueryOptions) -> Result<Vec<QueryResult>> {
        if let Some(dimension) = self.dimension
            && query_vector.len() != dimension
        {
            return Err(EngineError::InvalidInput(format!(
                "query dimension {} does not match index dimension {dimension}",
                query_vector.len()
            )));
        }
        let (normalized_query, _) = normalize(query_vector);

        let mut scored: Vec<(String, f32)> = self
            .documents
            .iter()
            .map(|(id, doc)| {
                let score = cosine(&normalized_query, &doc.vector);
                (id.clone(), score)
            })
            .filter(|(_, score)| options.threshold.is_none_or(|t| *score >= t))
            .collect();

        // Descending score, ties broken lexicographically by id.
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        if options.k > 0 {
            scored.truncate(options.k);
        }

        Ok(scored
            .into_iter()
            .map(|(id, score)| {
                let doc = &self.documents[&id];
                QueryResult {
                    id,
                    score,
                    metadata: doc.metadata.clone(),
                    text: doc.text.clone(),
                }
            })
            .collect())
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn doc(id: &str, vector: Vec<f32>) -> NewDocument {
        NewDocument {
            id: id.to_string(),
            vector,
            metadata: None,
            text: None,
        }
    }

    #[test]
    fn first_add_freezes_dimension() {
        let mut index = VectorIndex::new();
        index.add(doc("a", vec![1.0, 0.0])).expect("add");
        let err = index.add(doc("b", vec![1.0, 0.0, 0.0])).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn query_sorts_descending_with_lexicographic_tiebreak() {
        let mut index = VectorIndex::new();
        index.add(doc("b", vec![1.0, 0.0])).expect("add");
        index.add(doc("a", vec![1.0, 0.0])).expect("add");
        index.add(doc("c", vec![0.0, 1.0])).expect("add");

        let results = index
            .query(&[1.0, 0.0], QueryOptions { k: 10, threshold: None })
            .expect("query");
        assert_eq!(results[0].id, "a");
        assert_eq!(results[1].id, "b");
        assert_eq!(results[2].id, "c");
    }

    #[test]
    fn threshold_excludes_low_scores() {
        let mut index = VectorIndex::new();
        index.add(doc("a", vec![1.0, 0.0])).expect("add");
        index.add(doc("b", vec![0.0, 1.0])).expect("add");

        let results = index
            .query(
                &[1.0, 0.0],
                QueryOptions {
                    k: 10,
                    threshold: Some(0.5),
                },
            )
            .expect("query");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "a");
    }

    #[test]
    fn duplicate_id_overwrites() {
        let mut index = VectorIndex::new();
        index.add(doc("a", vec![1.0, 0.0])).expect("add");
        index.add(doc("a", vec![0.0, 1.0])).expect("add");
        assert_eq!(index.document_count(), 1);
    }

    #[test]
    fn remove_unknown_id_is_noop() {
        let mut index = VectorIndex::new();
        index.add(doc("a", vec![1.0, 0.0])).expect("add");
        index.remove(&["missing".to_string()]);
        assert_eq!(index.document_count(), 1);
    }
}
