//! Item sources: batch generators over a corpus.

use crate::models::{Item, PipelineError, Result};
use async_trait::async_trait;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::info;

/// A configured source of items, pulled in fixed-size batches by index.
///
/// An empty batch signals exhaustion. Implementations must serve the
/// same batch for the same index across calls, so a resumed run sees
/// the batches it skipped unchanged.
#[async_trait]
pub trait ItemSource: Send + Sync {
    /// Source identifier.
    fn id(&self) -> &str;

    /// Total item count, when known up front (drives progress totals).
    fn total_items(&self) -> Option<usize> {
        None
    }

    /// Fetch batch `index` of at most `batch_size` items.
    async fn fetch_batch(&self, index: u64, batch_size: usize) -> Result<Vec<Item>>;
}

/// In-memory source backed by a pre-loaded item list.
pub struct VecSource {
    id: String,
    items: Vec<Item>,
}

impl VecSource {
    pub fn new(id: impl Into<String>, items: Vec<Item>) -> Self {
        Self {
            id: id.into(),
            items,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
impl ItemSource for VecSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn total_items(&self) -> Option<usize> {
        Some(self.items.len())
    }

    async fn fetch_batch(&self, index: u64, batch_size: usize) -> Result<Vec<Item>> {
        let start = (index as usize).saturating_mul(batch_size);
        if start >= self.items.len() {
            return Ok(Vec::new());
        }
        let end = (start + batch_size).min(self.items.len());
        Ok(self.items[start..end].to_vec())
    }
}

/// Source reading a JSONL corpus file fully into memory.
///
/// Corpus files are produced upstream by the collectors; one JSON item
/// per line, blank lines ignored.
pub struct JsonlSource {
    inner: VecSource,
}

impl JsonlSource {
    pub fn from_path(id: impl Into<String>, path: &Path) -> Result<Self> {
        let id = id.into();
        let file = std::fs::File::open(path)
            .map_err(|e| PipelineError::io(format!("opening corpus {}", path.display()), e))?;
        let reader = BufReader::new(file);

        let mut items = Vec::new();
        for (line_num, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| PipelineError::io("reading corpus", e))?;
            if line.trim().is_empty() {
                continue;
            }
            let item: Item = serde_json::from_str(&line).map_err(|e| {
                PipelineError::ParseError(format!(
                    "{} line {}: {}",
                    path.display(),
                    line_num + 1,
                    e
                ))
            })?;
            items.push(item);
        }

        info!(source = %id, count = items.len(), "Loaded corpus");
        Ok(Self {
            inner: VecSource::new(id, items),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[async_trait]
impl ItemSource for JsonlSource {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn total_items(&self) -> Option<usize> {
        self.inner.total_items()
    }

    async fn fetch_batch(&self, index: u64, batch_size: usize) -> Result<Vec<Item>> {
        self.inner.fetch_batch(index, batch_size).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(n: usize) -> Vec<Item> {
        (0..n)
            .map(|i| Item {
                id: format!("paper-{i}"),
                source: "arxiv".to_string(),
                payload: serde_json::Value::Null,
            })
            .collect()
    }

    #[tokio::test]
    async fn batches_are_stable_by_index() {
        let source = VecSource::new("arxiv", items(12));

        let b0 = source.fetch_batch(0, 5).await.unwrap();
        let b1 = source.fetch_batch(1, 5).await.unwrap();
        let b2 = source.fetch_batch(2, 5).await.unwrap();
        let b3 = source.fetch_batch(3, 5).await.unwrap();

        assert_eq!(b0.len(), 5);
        assert_eq!(b1.len(), 5);
        assert_eq!(b2.len(), 2);
        assert!(b3.is_empty());
        assert_eq!(b0[0].id, "paper-0");
        assert_eq!(b2[1].id, "paper-11");

        // Same index, same batch
        let again = source.fetch_batch(1, 5).await.unwrap();
        assert_eq!(again[0].id, b1[0].id);
    }

    #[tokio::test]
    async fn jsonl_source_parses_lines() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("corpus.jsonl");
        std::fs::write(
            &path,
            concat!(
                "{\"id\": \"p1\", \"source\": \"arxiv\", \"payload\": {\"title\": \"A\"}}\n",
                "\n",
                "{\"id\": \"p2\", \"source\": \"arxiv\"}\n",
            ),
        )
        .unwrap();

        let source = JsonlSource::from_path("arxiv", &path).unwrap();
        assert_eq!(source.len(), 2);
        let batch = source.fetch_batch(0, 10).await.unwrap();
        assert_eq!(batch[1].id, "p2");
    }

    #[tokio::test]
    async fn jsonl_source_reports_bad_line() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("corpus.jsonl");
        std::fs::write(&path, "{\"id\": \"p1\", \"source\": \"arxiv\"}\nnot json\n").unwrap();

        let err = JsonlSource::from_path("arxiv", &path).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }
}
