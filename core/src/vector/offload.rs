//! Offload store (spec §4.6): the on-disk binary format for an idle vector
//! index, written atomically via a temp-file-then-rename in the same
//! directory the teacher's config editor uses for safe file replacement.

use std::path::Path;
use std::path::PathBuf;

use engine_protocol::OffloadMetadata;
use engine_protocol::offload::DocumentRecord;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;

use crate::error::EngineError;
use crate::error::Result;
use crate::vector::index::NewDocument;
use crate::vector::index::StoredDocument;

pub struct OffloadSnapshot {
    pub metadata: OffloadMetadata,
    pub documents: Vec<(String, StoredDocument)>,
}

#[derive(Debug)]
pub struct LoadedSnapshot {
    pub metadata: OffloadMetadata,
    pub documents: Vec<NewDocument>,
}

pub struct OffloadStore {
    directory: PathBuf,
}

fn prefix(namespace: &str, id: &str) -> String {
    format!("{namespace}:{id}")
}

impl OffloadStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn paths(&self, namespace: &str, id: &str) -> (PathBuf, PathBuf, PathBuf) {
        let stem = prefix(namespace, id);
        (
            self.directory.join(format!("{stem}.metadata.json")),
            self.directory.join(format!("{stem}.documents.json")),
            self.directory.join(format!("{stem}.vectors.bin")),
        )
    }

    pub async fn save(&self, namespace: &str, id: &str, snapshot: OffloadSnapshot) -> Result<()> {
        tokio::fs::create_dir_all(&self.directory).await?;
        let (metadata_path, documents_path, vectors_path) = self.paths(namespace, id);

        let metadata_json = serde_json::to_vec_pretty(&snapshot.metadata)?;
        let document_records: Vec<DocumentRecord> = snapshot
            .documents
            .iter()
            .map(|(id, doc)| DocumentRecord {
                id: id.clone(),
                metadata: doc.metadata.clone(),
                text: doc.text.clone(),
            })
            .collect();
        let documents_json = serde_json::to_vec_pretty(&document_records)?;
        let vectors_bin = encode_vectors(&snapshot.documents);

        write_atomic(&self.directory, &metadata_path, &metadata_json).await?;
        write_atomic(&self.directory, &documents_path, &documents_json).await?;
        write_atomic(&self.directory, &vectors_path, &vectors_bin).await?;
        Ok(())
    }

    /// Peeks the metadata sidecar without touching `documents.json`/
    /// `vectors.bin`; `None` if no offloaded index exists at this key.
    pub async fn read_metadata(&self, namespace: &str, id: &str) -> Result<Option<OffloadMetadata>> {
        let (metadata_path, _, _) = self.paths(namespace, id);
        match tokio::fs::read(&metadata_path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn load(&self, namespace: &str, id: &str) -> Result<LoadedSnapshot> {
        let (metadata_path, documents_path, vectors_path) = self.paths(namespace, id);
        let metadata: OffloadMetadata =
            serde_json::from_slice(&tokio::fs::read(&metadata_path).await?)?;
        let document_records: Vec<DocumentRecord> =
            serde_json::from_slice(&tokio::fs::read(&documents_path).await?)?;
        let vectors_bin = tokio::fs::read(&vectors_path).await?;
        let vectors = decode_vectors(&vectors_bin)?;

        if vectors.len() != document_records.len() {
            return Err(EngineError::CorruptOffload(format!(
                "vectors.bin has {} rows but documents.json has {}",
                vectors.len(),
                document_records.len()
            )));
        }
        for (record, (vector_id, _)) in document_records.iter().zip(vectors.iter()) {
            if &record.id != vector_id {
                return Err(EngineError::CorruptOffload(format!(
                    "document id sequence mismatch: {} != {vector_id}",
                    record.id
                )));
            }
        }

        let documents = document_records
            .into_iter()
            .zip(vectors)
            .map(|(record, (id, vector))| NewDocument {
                id,
                vector,
                metadata: record.metadata,
                text: record.text,
            })
            .collect();

        Ok(LoadedSnapshot { metadata, documents })
    }

    pub async fn list(&self, namespace: Option<&str>) -> Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(stem) = name.strip_suffix(".metadata.json") else {
                continue;
            };
            let Some((ns, id)) = stem.split_once(':') else {
                continue;
            };
            if namespace.is_some_and(|n| n != ns) {
                continue;
            }
            out.push((ns.to_string(), id.to_string()));
        }
        Ok(out)
    }

    pub async fn delete(&self, namespace: &str, id: &str) -> Result<()> {
        let (metadata_path, documents_path, vectors_path) = self.paths(namespace, id);
        for path in [metadata_path, documents_path, vectors_path] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

async fn write_atomic(directory: &Path, destination: &Path, content: &[u8]) -> Result<()> {
    let directory = directory.to_path_buf();
    let temp = tokio::task::spawn_blocking(move || NamedTempFile::new_in(directory))
        .await
        .map_err(EngineError::from)??;
    let (file, temp_path) = temp.into_parts();
    let mut file = tokio::fs::File::from_std(file);
    file.write_all(content).await?;
    file.flush().await?;
    let destination = destination.to_path_buf();
    tokio::task::spawn_blocking(move || temp_path.persist(&destination))
        .await
        .map_err(EngineError::from)?
        .map_err(|e| EngineError::Io(e.error))?;
    Ok(())
}

fn encode_vectors(documents: &[(String, StoredDocument)]) -> Vec<u8> {
    let dimension = documents.first().map(|(_, d)| d.vector.len()).unwrap_or(0);
    let mut out = Vec::new();
    out.extend_from_slice(&(documents.len() as u32).to_le_bytes());
    out.extend_from_slice(&(dimension as u32).to_le_bytes());
    for (id, doc) in documents {
        let id_bytes = id.as_bytes();
        out.extend_from_slice(&(id_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(id_bytes);
        for component in &doc.vector {
            out.extend_from_slice(&component.to_le_bytes());
        }
    }
    out
}

fn decode_vectors(bytes: &[u8]) -> Result<Vec<(String, Vec<f32>)>> {
    let corrupt = |msg: &str| EngineError::CorruptOffload(msg.to_string());
    if bytes.len() < 8 {
        return Err(corrupt("vectors.bin too short for header"));
    }
    let count = u32::from_le_bytes(bytes[0..4].try_into().unwrap_or_default()) as usize;
    let dimension = u32::from_le_bytes(bytes[4..8].try_into().unwrap_or_default()) as usize;
    let mut cursor = 8usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        if cursor + 4 > bytes.len() {
            return Err(corrupt("vectors.bin truncated at id length"));
        }
        let id_len =
            u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap_or_default()) as usize;
        cursor += 4;
        if cursor + id_len > bytes.len() {
            return Err(corrupt("vectors.bin truncated at id bytes"));
        }
        let id = String::from_utf8(bytes[cursor..cursor + id_len].to_vec())
            .map_err(|_| corrupt("vectors.bin id bytes are not valid utf-8"))?;
        cursor += id_len;

        let vector_bytes = dimension * 4;
        if cursor + vector_bytes > bytes.len() {
            return Err(corrupt("vectors.bin truncated at vector payload"));
        }
        let mut vector = Vec::with_capacity(dimension);
        for i in 0..dimension {
            let start = cursor + i * 4;
            vector.push(f32::from_le_bytes(
                bytes[start..start + 4].try_into().unwrap_or_default(),
            ));
        }
        cursor += vector_bytes;
        out.push((id, vector));
    }
    if cursor != bytes.len() {
        return Err(corrupt("vectors.bin has trailing bytes past last row"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use engine_protocol::Permission;

    use super::*;

    fn sample_documents() -> Vec<(String, StoredDocument)> {
        vec![
            (
                "a".to_string(),
                StoredDocument {
                    vector: vec![1.0, 0.0, 0.0],
                    norm: 1.0,
                    metadata: None,
                    text: Some("hello".to_string()),
                },
            ),
            (
                "b".to_string(),
                StoredDocument {
                    vector: vec![0.0, 1.0, 0.0],
                    norm: 1.0,
                    metadata: None,
                    text: None,
                },
            ),
        ]
    }

    #[tokio::test]
    async fn round_trips_through_save_and_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = OffloadStore::new(dir.path());
        let documents = sample_documents();
        let now = chrono::Utc::now();
        let metadata = OffloadMetadata::new(
            documents.len(),
            3,
            now,
            now,
            "tenant".to_string(),
            Permission::Private,
        );
        store
            .save("tenant", "idx1", OffloadSnapshot { metadata, documents })
            .await
            .expect("save");

        let loaded = store.load("tenant", "idx1").await.expect("load");
        assert_eq!(loaded.documents.len(), 2);
        assert_eq!(loaded.metadata.document_count, 2);
        let a = loaded.documents.iter().find(|d| d.id == "a").expect("a present");
        assert_eq!(a.vector, vec![1.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn list_filters_by_namespace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = OffloadStore::new(dir.path());
        let now = chrono::Utc::now();
        let metadata = OffloadMetadata::new(0, 3, now, now, "t1".to_string(), Permission::Private);
        store
            .save(
                "t1",
                "idx1",
                OffloadSnapshot {
                    metadata: metadata.clone(),
                    documents: Vec::new(),
                },
            )
            .await
            .expect("save");
        store
            .save(
                "t2",
                "idx2",
                OffloadSnapshot {
                    metadata,
                    documents: Vec::new(),
                },
            )
            .await
            .expect("save");

        let all = store.list(None).await.expect("list");
        assert_eq!(all.len(), 2);
        let t1_only = store.list(Some("t1")).await.expect("list");
        assert_eq!(t1_only, vec![("t1".to_string(), "idx1".to_string())]);
    }

    #[tokio::test]
    async fn corrupt_id_sequence_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = OffloadStore::new(dir.path());
        let documents = sample_documents();
        let now = chrono::Utc::now();
        let metadata = OffloadMetadata::new(
            documents.len(),
            3,
            now,
            now,
            "tenant".to_string(),
            Permission::Private,
        );
        store
            .save("tenant", "idx1", OffloadSnapshot { metadata, documents })
            .await
            .expect("save");

        // Corrupt documents.json so its id sequence no longer matches vectors.bin.
        let (_, documents_path, _) = store.paths("tenant", "idx1");
        let mut records: Vec<DocumentRecord> =
            serde_json::from_slice(&tokio::fs::read(&documents_path).await.expect("read")).expect("parse");
        records.reverse();
        tokio::fs::write(&documents_path, serde_json::to_vec(&records).expect("encode"))
            .await
            .expect("write");

        let err = store.load("tenant", "idx1").await.unwrap_err();
        assert!(matches!(err, EngineError::CorruptOffload(_)));
    }

    #[tokio::test]
    async fn read_metadata_is_none_when_absent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = OffloadStore::new(dir.path());
        assert_eq!(store.read_metadata("tenant", "missing").await.expect("read"), None);
    }

    #[tokio::test]
    async fn read_metadata_finds_sidecar_without_loading_vectors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = OffloadStore::new(dir.path());
        let now = chrono::Utc::now();
        let metadata = OffloadMetadata::new(0, 3, now, now, "tenant".to_string(), Permission::Private);
        store
            .save(
                "tenant",
                "idx1",
                OffloadSnapshot { metadata: metadata.clone(), documents: Vec::new() },
            )
            .await
            .expect("save");

        let found = store.read_metadata("tenant", "idx1").await.expect("read");
        assert_eq!(found, Some(metadata));
    }

    #[tokio::test]
    async fn delete_is_idempotent_on_missing_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = OffloadStore::new(dir.path());
        store.delete("tenant", "missing").await.expect("delete missing is ok");
    }
}
