//! Vector DB manager (spec §4.8): namespaced registry of indices,
//! integrating the embedding registry, activity controller, and offload
//! store, with permission enforcement and auto-offload/auto-resume.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use engine_protocol::Operation;
use engine_protocol::Permission;
use engine_protocol::ResourceId;
use tokio::sync::Mutex;
use tracing::info;

use crate::activity::ActivityController;
use crate::error::EngineError;
use crate::error::Result;
use crate::vector::embedding::EmbeddingProviderRegistry;
use crate::vector::index::NewDocument;
use crate::vector::index::QueryOptions;
use crate::vector::index::QueryResult;
use crate::vector::index::VectorIndex;
use crate::vector::offload::OffloadSnapshot;
use crate::vector::offload::OffloadStore;

pub struct DocumentInput {
    pub id: String,
    pub text: Option<String>,
    pub vector: Option<Vec<f32>>,
    pub metadata: Option<serde_json::Value>,
}

enum LiveOrOffloaded {
    Live(VectorIndex),
    Offloaded,
}

struct IndexRecord {
    namespace: String,
    provider_name: String,
    permission: Permission,
    created_at: chrono::DateTime<Utc>,
    state: LiveOrOffloaded,
    /// Guards the single-load guarantee: concurrent resumers share one load.
    resume_lock: Arc<Mutex<()>>,
}

pub struct VectorDbManagerConfig {
    pub max_instances: usize,
    pub default_inactivity_timeout: Duration,
}

impl Default for VectorDbManagerConfig {
    fn default() -> Self {
        Self {
            max_instances: 10,
            default_inactivity_timeout: Duration::from_secs(1_800),
        }
    }
}

pub struct VectorDbManager {
    config: VectorDbManagerConfig,
    embeddings: Arc<EmbeddingProviderRegistry>,
    offload: Arc<OffloadStore>,
    records: Mutex<HashMap<String, IndexRecord>>,
    activity: Arc<ActivityController<Box<dyn Fn(&str) + Send + Sync>>>,
}

impl VectorDbManager {
    pub fn new(
        config: VectorDbManagerConfig,
        embeddings: Arc<EmbeddingProviderRegistry>,
        offload: Arc<OffloadStore>,
    ) -> Arc<Self> {
        let manager = Arc::new_cyclic(|weak: &std::sync::Weak<Self>| {
            let weak = weak.clone();
            let on_expire: Box<dyn Fn(&str) + Send + Sync> = Box::new(move |id: &str| {
                if let Some(manager) = weak.upgrade() {
                    let id = id.to_string();
                    tokio::spawn(async move {
                        let _ = manager.offload_index(&id).await;
                    });
                }
            });
            Self {
                config,
                embeddings,
                offload,
                records: Mutex::new(HashMap::new()),
                activity: ActivityController::new(on_expire),
            }
        });
        manager.activity.spawn_sweeper();
        manager
    }

    fn check_permission(
        record: &IndexRecord,
        caller_namespace: &str,
        operation: Operation,
    ) -> Result<()> {
        if record.namespace == caller_namespace {
            return Ok(());
        }
        if record.permission.admits_cross_namespace(operation) {
            return Ok(());
        }
        Err(EngineError::PermissionDenied(format!(
            "namespace {caller_namespace} cannot {operation:?} index owned by {}",
            record.namespace
        )))
    }

    /// Creates a new live index, or — when `resume` is set — reattaches an
    /// existing `Offloaded` record (in-memory, or found on disk via its
    /// metadata sidecar) without forcing the disk load; the first live
    /// operation performs that load through [`Self::with_live_index`].
    /// Returns `(indexId, isFromOffload)`.
    pub async fn create_index(
        &self,
        namespace: &str,
        id: Option<String>,
        provider_name: &str,
        permission: Permission,
        inactivity_timeout: Option<Duration>,
        resume: bool,
    ) -> Result<(String, bool)> {
        if self.embeddings.get(provider_name).is_none() {
            return Err(EngineError::NotFound(format!(
                "embedding provider {provider_name} not found"
            )));
        }
        let local_id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let resource_id = ResourceId::new(namespace.to_string(), local_id.clone());
        let key = resource_id.to_string();

        let mut records = self.records.lock().await;
        if let Some(record) = records.get(&key) {
            if resume && matches!(record.state, LiveOrOffloaded::Offloaded) {
                return Ok((key, true));
            }
            return Err(EngineError::Conflict(format!("index {key} already exists")));
        }

        if resume
            && let Some(metadata) = self.offload.read_metadata(namespace, &local_id).await?
        {
            if records.len() >= self.config.max_instances {
                return Err(EngineError::QuotaExceeded(
                    "maximum number of vector indices reached".to_string(),
                ));
            }
            self.embeddings.acquire(provider_name)?;
            records.insert(
                key.clone(),
                IndexRecord {
                    namespace: namespace.to_string(),
                    provider_name: provider_name.to_string(),
                    permission: metadata.permission,
                    created_at: metadata.created_at,
                    state: LiveOrOffloaded::Offloaded,
                    resume_lock: Arc::new(Mutex::new(())),
                },
            );
            info!(index = %key, "registered offloaded index for resume");
            return Ok((key, true));
        }

        if records.len() >= self.config.max_instances {
            return Err(EngineError::QuotaExceeded(
                "maximum number of vector indices reached".to_string(),
            ));
        }

        self.embeddings.acquire(provider_name)?;
        records.insert(
            key.clone(),
            IndexRecord {
                namespace: namespace.to_string(),
                provider_name: provider_name.to_string(),
                permission,
                created_at: Utc::now(),
                state: LiveOrOffloaded::Live(VectorIndex::new()),
                resume_lock: Arc::new(Mutex::new(())),
            },
        );
        drop(records);

        let timeout = inactivity_timeout.unwrap_or(self.config.default_inactivity_timeout);
        self.activity.register(key.clone(), timeout);
        info!(index = %key, "created vector index");
        Ok((key, false))
    }

    pub async fn destroy_index(&self, caller_namespace: &str, id: &str) -> Result<()> {
        let mut records = self.records.lock().await;
        let record = records
            .get(id)
            .ok_or_else(|| EngineError::NotFound(format!("index {id} not found")))?;
        Self::check_permission(record, caller_namespace, Operation::Manage)?;
        let record = records.remove(id).ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        drop(records);
        self.activity.unregister(id);
        self.embeddings.release(&record.provider_name);
        let resource_id = ResourceId::parse(id);
        let _ = self.offload.delete(resource_id.namespace(), resource_id.local_id()).await;
        Ok(())
    }

    /// Auto-resumes an offloaded index before running `f`, guaranteeing
    /// only one concurrent caller performs the disk load.
    async fn with_live_index<T>(
        &self,
        caller_namespace: &str,
        id: &str,
        operation: Operation,
        f: impl FnOnce(&mut VectorIndex) -> Result<T>,
    ) -> Result<T> {
        let resume_lock = {
            let records = self.records.lock().await;
            let record = records
                .get(id)
                .ok_or_else(|| EngineError::NotFound(format!("index {id} not found")))?;
            Self::check_permission(record, caller_namespace, operation)?;
            Arc::clone(&record.resume_lock)
        };

        let _resume_guard = resume_lock.lock().await;
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("index {id} not found")))?;

        if matches!(record.state, LiveOrOffloaded::Offloaded) {
            let resource_id = ResourceId::parse(id);
            let loaded = self
                .offload
                .load(resource_id.namespace(), resource_id.local_id())
                .await?;
            let mut index = VectorIndex::with_dimension(loaded.metadata.embedding_dimension);
            for doc in loaded.documents {
                index.add(doc)?;
            }
            record.state = LiveOrOffloaded::Live(index);
            self.activity.register(id.to_string(), self.config.default_inactivity_timeout);
            info!(index = %id, "auto-resumed offloaded index");
        }

        let LiveOrOffloaded::Live(index) = &mut record.state else {
            unreachable!("index was just resumed to live state");
        };
        let result = f(index);
        self.activity.ping(id);
        result
    }

    pub async fn add_documents(
        &self,
        caller_namespace: &str,
        id: &str,
        documents: Vec<DocumentInput>,
    ) -> Result<usize> {
        let provider = {
            let records = self.records.lock().await;
            let record = records
                .get(id)
                .ok_or_else(|| EngineError::NotFound(format!("index {id} not found")))?;
            self.embeddings.get(&record.provider_name)
        };
        let mut resolved = Vec::with_capacity(documents.len());
        for doc in documents {
            let vector = match (doc.vector, &doc.text, &provider) {
                (Some(v), _, _) => v,
                (None, Some(text), Some(provider)) => provider.embed(text).await?,
                (None, Some(_), None) => {
                    return Err(EngineError::EmbeddingProviderError(
                        "index has no embedding provider bound".to_string(),
                    ));
                }
                (None, None, _) => {
                    return Err(EngineError::InvalidInput(
                        "document needs text or vector".to_string(),
                    ));
                }
            };
            resolved.push(NewDocument {
                id: doc.id,
                vector,
                metadata: doc.metadata,
                text: doc.text,
            });
        }

        self.with_live_index(caller_namespace, id, Operation::Add, move |index| {
            for doc in resolved {
                index.add(doc)?;
            }
            Ok(index.document_count())
        })
        .await
    }

    pub async fn remove_documents(
        &self,
        caller_namespace: &str,
        id: &str,
        ids: Vec<String>,
    ) -> Result<usize> {
        self.with_live_index(caller_namespace, id, Operation::Manage, move |index| {
            index.remove(&ids);
            Ok(index.document_count())
        })
        .await
    }

    pub async fn query_index(
        &self,
        caller_namespace: &str,
        id: &str,
        query_text: Option<String>,
        query_vector: Option<Vec<f32>>,
        options: QueryOptions,
    ) -> Result<Vec<QueryResult>> {
        let provider = {
            let records = self.records.lock().await;
            let record = records
                .get(id)
                .ok_or_else(|| EngineError::NotFound(format!("index {id} not found")))?;
            self.embeddings.get(&record.provider_name)
        };
        let vector = match (query_vector, query_text, provider) {
            (Some(v), _, _) => v,
            (None, Some(text), Some(provider)) => provider.embed(&text).await?,
            _ => {
                return Err(EngineError::InvalidInput(
                    "query needs text or vector".to_string(),
                ));
            }
        };

        self.with_live_index(caller_namespace, id, Operation::Read, move |index| {
            index.query(&vector, options)
        })
        .await
    }

    pub async fn ping_instance(&self, caller_namespace: &str, id: &str) -> Result<()> {
        self.with_live_index(caller_namespace, id, Operation::Read, |_| Ok(()))
            .await
    }

    pub async fn set_inactivity_timeout(
        &self,
        caller_namespace: &str,
        id: &str,
        timeout: Duration,
    ) -> Result<()> {
        let records = self.records.lock().await;
        let record = records
            .get(id)
            .ok_or_else(|| EngineError::NotFound(format!("index {id} not found")))?;
        Self::check_permission(record, caller_namespace, Operation::Manage)?;
        drop(records);
        self.activity.set_timeout(id, timeout);
        Ok(())
    }

    /// User-facing offload entrypoint (spec §4.8 permission table: `offload`
    /// is owner-only except on a `public_read_write` index).
    pub async fn manual_offload(&self, caller_namespace: &str, id: &str) -> Result<()> {
        {
            let records = self.records.lock().await;
            let record = records
                .get(id)
                .ok_or_else(|| EngineError::NotFound(format!("index {id} not found")))?;
            Self::check_permission(record, caller_namespace, Operation::Manage)?;
        }
        self.offload_index(id).await
    }

    /// Expiry-driven offload with no caller to authorize against; only
    /// reachable from inside the manager (activity-controller callback).
    async fn offload_index(&self, id: &str) -> Result<()> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("index {id} not found")))?;
        let LiveOrOffloaded::Live(index) = &record.state else {
            return Ok(());
        };

        let documents = index
            .snapshot_documents()
            .into_iter()
            .map(|(id, doc)| (id, doc))
            .collect::<Vec<_>>();
        let metadata = engine_protocol::OffloadMetadata::new(
            index.document_count(),
            index.dimension().unwrap_or(0),
            record.created_at,
            Utc::now(),
            record.namespace.clone(),
            record.permission,
        );
        let resource_id = ResourceId::parse(id);
        self.offload
            .save(
                resource_id.namespace(),
                resource_id.local_id(),
                OffloadSnapshot { metadata, documents },
            )
            .await?;
        record.state = LiveOrOffloaded::Offloaded;
        drop(records);
        self.activity.unregister(id);
        info!(index = %id, "offloaded vector index");
        Ok(())
    }

    pub async fn list_offloaded_indices(&self, namespace: Option<&str>) -> Result<Vec<(String, String)>> {
        self.offload.list(namespace).await
    }

    pub async fn delete_offloaded_index(&self, namespace: &str, id: &str) -> Result<()> {
        self.offload.delete(namespace, id).await
    }

    pub async fn change_index_embedding_provider(
        &self,
        caller_namespace: &str,
        id: &str,
        new_provider_name: &str,
    ) -> Result<()> {
        let new_provider = self
            .embeddings
            .get(new_provider_name)
            .ok_or_else(|| EngineError::NotFound(format!("embedding provider {new_provider_name} not found")))?;

        let mut records = self.records.lock().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("index {id} not found")))?;
        Self::check_permission(record, caller_namespace, Operation::Manage)?;

        let current_dimension = match &record.state {
            LiveOrOffloaded::Live(index) => index.dimension(),
            LiveOrOffloaded::Offloaded => None,
        };
        if let Some(dimension) = current_dimension
            && dimension != new_provider.dimension()
        {
            return Err(EngineError::InvalidInput(
                "new embedding provider dimension does not match the index's existing dimension"
                    .to_string(),
            ));
        }

        self.embeddings.acquire(new_provider_name)?;
        self.embeddings.release(&record.provider_name);
        record.provider_name = new_provider_name.to_string();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::vector::embedding::EmbeddingProviderRegistry;

    fn manager(dir: &std::path::Path) -> Arc<VectorDbManager> {
        VectorDbManager::new(
            VectorDbManagerConfig::default(),
            Arc::new(EmbeddingProviderRegistry::default()),
            Arc::new(OffloadStore::new(dir)),
        )
    }

    #[tokio::test]
    async fn resume_after_offload_reattaches_existing_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(dir.path());
        let (id, first_is_resume) = manager
            .create_index("t", Some("v1".to_string()), "mock-model", Permission::Private, None, false)
            .await
            .expect("create");
        assert!(!first_is_resume);

        manager
            .add_documents(
                "t",
                &id,
                vec![DocumentInput {
                    id: "d1".to_string(),
                    text: Some("hello".to_string()),
                    vector: None,
                    metadata: None,
                }],
            )
            .await
            .expect("add");

        manager.manual_offload("t", &id).await.expect("offload");

        let (resumed_id, is_from_offload) = manager
            .create_index("t", Some("v1".to_string()), "mock-model", Permission::Private, None, true)
            .await
            .expect("resume");
        assert_eq!(resumed_id, id);
        assert!(is_from_offload);

        let results = manager
            .query_index("t", &id, None, Some(vec![0.0; 32]), QueryOptions { k: 10, threshold: None })
            .await
            .expect("query after resume");
        let _ = results;
    }

    #[tokio::test]
    async fn create_without_resume_conflicts_on_offloaded_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(dir.path());
        let (id, _) = manager
            .create_index("t", Some("v1".to_string()), "mock-model", Permission::Private, None, false)
            .await
            .expect("create");
        manager.manual_offload("t", &id).await.expect("offload");

        let err = manager
            .create_index("t", Some("v1".to_string()), "mock-model", Permission::Private, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn resume_reconstructs_disk_only_record_after_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = manager(dir.path());
        let (id, _) = first
            .create_index("t", Some("v1".to_string()), "mock-model", Permission::Private, None, false)
            .await
            .expect("create");
        first.manual_offload("t", &id).await.expect("offload");

        // Simulate a fresh process: a brand new manager with no in-memory record.
        let second = manager(dir.path());
        let (resumed_id, is_from_offload) = second
            .create_index("t", Some("v1".to_string()), "mock-model", Permission::Private, None, true)
            .await
            .expect("resume across process boundary");
        assert_eq!(resumed_id, id);
        assert!(is_from_offload);
    }

    #[tokio::test]
    async fn manual_offload_rejects_cross_namespace_without_permission() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(dir.path());
        let (id, _) = manager
            .create_index("owner", Some("v1".to_string()), "mock-model", Permission::PublicReadWrite, None, false)
            .await
            .expect("create");

        let err = manager.manual_offload("intruder", &id).await.unwrap_err();
        assert!(matches!(err, EngineError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn manual_offload_admits_owner_with_private_permission() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(dir.path());
        let (id, _) = manager
            .create_index("owner", Some("v1".to_string()), "mock-model", Permission::Private, None, false)
            .await
            .expect("create");
        manager.manual_offload("owner", &id).await.expect("owner may offload");
    }

    #[tokio::test]
    async fn manual_offload_admits_cross_namespace_on_public_read_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(dir.path());
        let (id, _) = manager
            .create_index("owner", Some("v1".to_string()), "mock-model", Permission::PublicReadWrite, None, false)
            .await
            .expect("create");
        manager
            .manual_offload("other", &id)
            .await
            .expect("public_read_write admits cross-namespace manage");
    }
}
