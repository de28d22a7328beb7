//! Engine configuration, sourced entirely from the environment variables
//! enumerated in spec §6. Unlike the teacher's TOML-file + overrides layering
//! (`codex-rs/core/src/config.rs`), this engine has no on-disk config file in
//! scope, so `Config::from_env` plays the role of the teacher's
//! `Config::load_from_base_config_with_overrides`: defaults first, then
//! environment overrides, with invalid values rejected rather than silently
//! ignored.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use engine_protocol::KernelMode;
use engine_protocol::Language;
use serde::Deserialize;
use serde::Serialize;

use crate::error::EngineError;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub enabled: bool,
    pub pool_size: usize,
    pub auto_refill: bool,
    pub preload_configs: Vec<(KernelMode, Language)>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pool_size: 2,
            auto_refill: true,
            preload_configs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentModelSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
}

impl Default for AgentModelSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub allowed_kernel_types: Vec<(KernelMode, Language)>,
    pub pool: PoolConfig,
    pub embedding_model: String,
    pub max_vector_db_instances: usize,
    pub vectordb_offload_directory: PathBuf,
    pub vectordb_default_inactivity_timeout: Duration,
    pub vectordb_activity_monitoring: bool,
    pub ollama_host: Option<String>,
    pub agent_model: AgentModelSettings,
    pub agent_data_directory: Option<PathBuf>,
    pub max_agents: usize,
    pub auto_save_conversations: bool,
    pub agent_max_steps_cap: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            allowed_kernel_types: vec![
                (KernelMode::Worker, Language::Python),
                (KernelMode::Worker, Language::Typescript),
                (KernelMode::Worker, Language::Javascript),
            ],
            pool: PoolConfig::default(),
            embedding_model: "mock-model".to_string(),
            max_vector_db_instances: 10,
            vectordb_offload_directory: PathBuf::from("./vectordb_offload"),
            vectordb_default_inactivity_timeout: Duration::from_millis(1_800_000),
            vectordb_activity_monitoring: true,
            ollama_host: None,
            agent_model: AgentModelSettings::default(),
            agent_data_directory: None,
            max_agents: 50,
            auto_save_conversations: false,
            agent_max_steps_cap: 10,
        }
    }
}

impl Config {
    /// Build a config from defaults overridden by the variables in `env`,
    /// matching the names in spec §6. Unknown variables are ignored;
    /// malformed values for a recognized variable are an [`EngineError::InvalidInput`].
    pub fn from_env(env: &HashMap<String, String>) -> Result<Self> {
        let mut config = Config::default();

        if let Some(raw) = env.get("ALLOWED_KERNEL_TYPES") {
            config.allowed_kernel_types = parse_kernel_type_list(raw)?;
        }
        if let Some(raw) = env.get("KERNEL_POOL_ENABLED") {
            config.pool.enabled = !is_false(raw);
        }
        if let Some(raw) = env.get("KERNEL_POOL_SIZE") {
            config.pool.pool_size = parse_usize("KERNEL_POOL_SIZE", raw)?;
        }
        if let Some(raw) = env.get("KERNEL_POOL_AUTO_REFILL") {
            config.pool.auto_refill = !is_false(raw);
        }
        if let Some(raw) = env.get("KERNEL_POOL_PRELOAD_CONFIGS") {
            config.pool.preload_configs = parse_kernel_type_list(raw)?;
        }
        if let Some(raw) = env.get("EMBEDDING_MODEL") {
            config.embedding_model = raw.clone();
        }
        if let Some(raw) = env.get("MAX_VECTOR_DB_INSTANCES") {
            config.max_vector_db_instances = parse_usize("MAX_VECTOR_DB_INSTANCES", raw)?;
        }
        if let Some(raw) = env.get("VECTORDB_OFFLOAD_DIRECTORY") {
            config.vectordb_offload_directory = PathBuf::from(raw);
        }
        if let Some(raw) = env.get("VECTORDB_DEFAULT_INACTIVITY_TIMEOUT") {
            let millis = parse_usize("VECTORDB_DEFAULT_INACTIVITY_TIMEOUT", raw)?;
            config.vectordb_default_inactivity_timeout = Duration::from_millis(millis as u64);
        }
        if let Some(raw) = env.get("VECTORDB_ACTIVITY_MONITORING") {
            config.vectordb_activity_monitoring = !is_false(raw);
        }
        if let Some(raw) = env.get("OLLAMA_HOST") {
            config.ollama_host = Some(raw.clone());
        }
        if let Some(raw) = env.get("AGENT_MODEL_BASE_URL") {
            config.agent_model.base_url = raw.clone();
        }
        if let Some(raw) = env.get("AGENT_MODEL_API_KEY") {
            config.agent_model.api_key = Some(raw.clone());
        }
        if let Some(raw) = env.get("AGENT_MODEL_NAME") {
            config.agent_model.model = raw.clone();
        }
        if let Some(raw) = env.get("AGENT_MODEL_TEMPERATURE") {
            config.agent_model.temperature = raw.parse().map_err(|_| {
                EngineError::InvalidInput(format!("AGENT_MODEL_TEMPERATURE not a float: {raw}"))
            })?;
        }
        if let Some(raw) = env.get("AGENT_DATA_DIRECTORY") {
            config.agent_data_directory = Some(PathBuf::from(raw));
        }
        if let Some(raw) = env.get("MAX_AGENTS") {
            config.max_agents = parse_usize("MAX_AGENTS", raw)?;
        }
        if let Some(raw) = env.get("AUTO_SAVE_CONVERSATIONS") {
            config.auto_save_conversations = !is_false(raw);
        }
        if let Some(raw) = env.get("AGENT_MAX_STEPS_CAP") {
            config.agent_max_steps_cap = parse_usize("AGENT_MAX_STEPS_CAP", raw)?;
        }

        Ok(config)
    }
}

fn is_false(raw: &str) -> bool {
    raw.eq_ignore_ascii_case("false")
}

fn parse_usize(var: &str, raw: &str) -> Result<usize> {
    raw.parse()
        .map_err(|_| EngineError::InvalidInput(format!("{var} not a non-negative integer: {raw}")))
}

/// Parses `"worker-python,worker-typescript"` into `[(Worker, Python), (Worker, Typescript)]`,
/// the shape spec.md §6 shows for `ALLOWED_KERNEL_TYPES` / `KERNEL_POOL_PRELOAD_CONFIGS`.
fn parse_kernel_type_list(raw: &str) -> Result<Vec<(KernelMode, Language)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_kernel_type)
        .collect()
}

fn parse_kernel_type(entry: &str) -> Result<(KernelMode, Language)> {
    let (mode_str, lang_str) = entry.split_once('-').ok_or_else(|| {
        EngineError::InvalidInput(format!("kernel type must be '<mode>-<language>': {entry}"))
    })?;
    let mode: KernelMode = mode_str
        .parse()
        .map_err(EngineError::InvalidInput)?;
    let language: Language = lang_str
        .parse()
        .map_err(EngineError::InvalidInput)?;
    Ok((mode, language))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_when_env_empty() {
        let config = Config::from_env(&HashMap::new()).expect("default config");
        assert_eq!(config.pool.pool_size, 2);
        assert!(config.pool.enabled);
        assert_eq!(config.max_vector_db_instances, 10);
        assert_eq!(config.embedding_model, "mock-model");
    }

    #[test]
    fn parses_allowed_kernel_types() {
        let config = Config::from_env(&env(&[(
            "ALLOWED_KERNEL_TYPES",
            "worker-python,worker-typescript",
        )]))
        .expect("valid kernel type list");
        assert_eq!(
            config.allowed_kernel_types,
            vec![
                (KernelMode::Worker, Language::Python),
                (KernelMode::Worker, Language::Typescript),
            ]
        );
    }

    #[test]
    fn false_string_disables_pool() {
        let config =
            Config::from_env(&env(&[("KERNEL_POOL_ENABLED", "false")])).expect("valid config");
        assert!(!config.pool.enabled);
    }

    #[test]
    fn rejects_non_numeric_pool_size() {
        let err = Config::from_env(&env(&[("KERNEL_POOL_SIZE", "two")])).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn rejects_malformed_kernel_type_entry() {
        let err = Config::from_env(&env(&[("ALLOWED_KERNEL_TYPES", "python")])).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }
}
