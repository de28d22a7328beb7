//! Root of the `engine-core` library: kernels, vector indices, and agents,
//! each a manager over a namespaced resource pool, sharing one error type
//! and one activity/expiry mechanism.

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod activity;
pub mod agent;
pub mod config;
pub mod error;
pub mod executor;
pub mod kernel;
pub mod pool;
pub mod vector;

pub use agent::Agent;
pub use agent::AgentConfig;
pub use agent::AgentManager;
pub use agent::AgentManagerConfig;
pub use config::Config;
pub use error::EngineError;
pub use error::Result;
pub use kernel::CreateKernelOptions;
pub use kernel::KernelManager;
pub use kernel::KernelManagerConfig;
pub use pool::KernelPool;
pub use vector::VectorDbManager;
