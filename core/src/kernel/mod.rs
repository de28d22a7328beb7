//! Kernel manager (spec §4.3): the namespaced registry of live kernels,
//! each backed by an [`Executor`](crate::executor::Executor) drawn from the
//! pool or cold-started, with activity tracking and a bounded execution
//! history per kernel.

pub mod session;

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use engine_protocol::Event;
use engine_protocol::KernelMode;
use engine_protocol::KernelStatus;
use engine_protocol::Language;
use engine_protocol::ResourceId;
use tokio::sync::Mutex;
use tracing::info;
use tracing::instrument;
use uuid::Uuid;

use crate::activity::ActivityController;
use crate::error::EngineError;
use crate::error::Result;
use crate::executor::Executor;
use crate::executor::spawn_executor;
use crate::pool::KernelPool;
use session::Session;

/// Bounds `inbound-history` memory per kernel (spec §3.1 supplemental detail).
pub const KERNEL_HISTORY_LIMIT: usize = 256;

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub session_id: String,
    pub code: String,
    pub outputs: Vec<Event>,
}

#[derive(Debug, Clone)]
pub struct KernelInfo {
    pub id: ResourceId,
    pub mode: KernelMode,
    pub language: Language,
    pub status: KernelStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

struct KernelRecord {
    executor: Arc<dyn Executor>,
    mode: KernelMode,
    language: Language,
    created_at: chrono::DateTime<chrono::Utc>,
    history: VecDeque<HistoryEntry>,
    sessions: HashMap<String, Arc<Session>>,
}

pub struct KernelManagerConfig {
    pub allowed_kernel_types: Vec<(KernelMode, Language)>,
    pub max_kernels_per_namespace: usize,
    pub default_inactivity_timeout: Duration,
}

impl Default for KernelManagerConfig {
    fn default() -> Self {
        Self {
            allowed_kernel_types: vec![
                (KernelMode::Worker, Language::Python),
                (KernelMode::Worker, Language::Typescript),
                (KernelMode::Worker, Language::Javascript),
            ],
            max_kernels_per_namespace: 64,
            default_inactivity_timeout: Duration::from_secs(1_800),
        }
    }
}

pub struct KernelManager {
    config: KernelManagerConfig,
    pool: Arc<KernelPool>,
    records: Mutex<HashMap<String, KernelRecord>>,
    activity: Arc<ActivityController<Box<dyn Fn(&str) + Send + Sync>>>,
}

pub struct CreateKernelOptions {
    pub id: Option<String>,
    pub namespace: String,
    pub mode: KernelMode,
    pub language: Language,
    pub inactivity_timeout: Option<Duration>,
    pub enable_activity_monitoring: bool,
}

impl Default for CreateKernelOptions {
    fn default() -> Self {
        Self {
            id: None,
            namespace: String::new(),
            mode: KernelMode::Worker,
            language: Language::Python,
            inactivity_timeout: None,
            enable_activity_monitoring: true,
        }
    }
}

impl KernelManager {
    pub fn new(config: KernelManagerConfig, pool: Arc<KernelPool>) -> Arc<Self> {
        let manager = Arc::new_cyclic(|weak: &std::sync::Weak<Self>| {
            let weak = weak.clone();
            let on_expire: Box<dyn Fn(&str) + Send + Sync> = Box::new(move |id: &str| {
                if let Some(manager) = weak.upgrade() {
                    let id = id.to_string();
                    tokio::spawn(async move {
                        let _ = manager.destroy_kernel(&id).await;
                    });
                }
            });
            Self {
                config,
                pool,
                records: Mutex::new(HashMap::new()),
                activity: ActivityController::new(on_expire),
            }
        });
        manager.activity.spawn_sweeper();
        manager
    }
}

fn count_in_namespace(records: &HashMap<String, KernelRecord>, namespace: &str) -> usize {
    records
        .keys()
        .filter(|key| ResourceId::parse(key).matches_namespace(namespace))
        .count()
}

impl KernelManager {
    fn is_allowed(&self, mode: KernelMode, language: Language) -> bool {
        self.config.allowed_kernel_types.contains(&(mode, language))
    }

    #[instrument(skip(self, options))]
    pub async fn create_kernel(&self, options: CreateKernelOptions) -> Result<String> {
        let CreateKernelOptions {
            id,
            namespace,
            mode,
            language,
            inactivity_timeout,
            enable_activity_monitoring,
        } = options;

        if !self.is_allowed(mode, language) {
            return Err(EngineError::InvalidInput(format!(
                "kernel type {mode}-{language} is not in the allow-list"
            )));
        }

        let local_id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let resource_id = ResourceId::new(namespace.clone(), local_id);
        let key = resource_id.to_string();

        let mut records = self.records.lock().await;
        if records.contains_key(&key) {
            return Err(EngineError::Conflict(format!("kernel {key} already exists")));
        }

        let namespace_count = count_in_namespace(&records, &namespace);
        if namespace_count >= self.config.max_kernels_per_namespace {
            return Err(EngineError::QuotaExceeded(format!(
                "namespace {namespace} has reached its kernel cap"
            )));
        }

        let executor: Arc<dyn Executor> = match self.pool.take(mode, language) {
            Some(executor) => Arc::from(executor),
            None => {
                let executor = spawn_executor(language);
                executor.start().await?;
                Arc::from(executor)
            }
        };

        records.insert(
            key.clone(),
            KernelRecord {
                executor,
                mode,
                language,
                created_at: chrono::Utc::now(),
                history: VecDeque::new(),
                sessions: HashMap::new(),
            },
        );
        drop(records);

        if enable_activity_monitoring {
            let timeout = inactivity_timeout.unwrap_or(self.config.default_inactivity_timeout);
            self.activity.register(key.clone(), timeout);
        }

        let pool = Arc::clone(&self.pool);
        tokio::spawn(async move { pool.refill().await });

        info!(kernel = %key, "created kernel");
        Ok(key)
    }

    pub async fn destroy_kernel(&self, id: &str) -> Result<()> {
        let mut records = self.records.lock().await;
        let record = records
            .remove(id)
            .ok_or_else(|| EngineError::NotFound(format!("kernel {id} not found")))?;
        drop(records);
        self.activity.unregister(id);
        record.executor.shutdown().await?;
        info!(kernel = %id, "destroyed kernel");
        Ok(())
    }

    pub async fn list_kernels(&self, namespace: &str) -> Vec<KernelInfo> {
        let records = self.records.lock().await;
        records
            .iter()
            .filter_map(|(key, record)| {
                let resource_id = ResourceId::parse(key);
                if !resource_id.matches_namespace(namespace) {
                    return None;
                }
                Some(KernelInfo {
                    id: resource_id,
                    mode: record.mode,
                    language: record.language,
                    status: record.executor.status(),
                    created_at: record.created_at,
                })
            })
            .collect()
    }

    pub async fn get_info(&self, id: &str) -> Result<(KernelInfo, Vec<HistoryEntry>)> {
        let records = self.records.lock().await;
        let record = records
            .get(id)
            .ok_or_else(|| EngineError::NotFound(format!("kernel {id} not found")))?;
        let resource_id = ResourceId::parse(id);
        Ok((
            KernelInfo {
                id: resource_id,
                mode: record.mode,
                language: record.language,
                status: record.executor.status(),
                created_at: record.created_at,
            },
            record.history.iter().cloned().collect(),
        ))
    }

    pub async fn ping_kernel(&self, id: &str) -> Result<()> {
        let records = self.records.lock().await;
        if !records.contains_key(id) {
            return Err(EngineError::NotFound(format!("kernel {id} not found")));
        }
        self.activity.ping(id);
        Ok(())
    }

    pub async fn interrupt_kernel(&self, id: &str) -> Result<()> {
        let records = self.records.lock().await;
        let record = records
            .get(id)
            .ok_or_else(|| EngineError::NotFound(format!("kernel {id} not found")))?;
        record.executor.interrupt().await
    }

    pub async fn restart_kernel(&self, id: &str) -> Result<()> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("kernel {id} not found")))?;
        record.executor.shutdown().await?;
        let executor = spawn_executor(record.language);
        executor.start().await?;
        record.executor = Arc::from(executor);
        record.history.clear();
        record.sessions.clear();
        Ok(())
    }

    /// Allocates a session, drives the executor, and multiplexes events
    /// into the session buffer (and thereby to its subscribers), appending
    /// the finished transcript to the kernel's bounded history.
    pub async fn execute_stream(&self, id: &str, code: String) -> Result<Arc<Session>> {
        let executor = {
            let records = self.records.lock().await;
            let record = records
                .get(id)
                .ok_or_else(|| EngineError::NotFound(format!("kernel {id} not found")))?;
            Arc::clone(&record.executor)
        };

        let session_id = Uuid::new_v4().to_string();
        let session = Arc::new(Session::new(session_id.clone(), id.to_string(), code.clone()));

        {
            let mut records = self.records.lock().await;
            if let Some(record) = records.get_mut(id) {
                record.sessions.insert(session_id.clone(), Arc::clone(&session));
            }
        }

        self.activity.ping(id);
        let mut events_rx = executor.execute(code.clone()).await?;

        let mut outputs = Vec::new();
        while let Some(event) = events_rx.recv().await {
            outputs.push(event.clone());
            let terminal = event.is_terminal();
            session.push(event);
            if terminal {
                break;
            }
        }

        let mut records = self.records.lock().await;
        if let Some(record) = records.get_mut(id) {
            record.history.push_back(HistoryEntry {
                session_id,
                code,
                outputs,
            });
            while record.history.len() > KERNEL_HISTORY_LIMIT {
                record.history.pop_front();
            }
        }

        Ok(session)
    }
}
