//! Shared wire types for the compute-and-retrieval engine.
//!
//! This crate has no behavior of its own: it defines the resource identity
//! scheme, the kernel event stream, the chat-stream chunks an agent emits,
//! and the on-disk shapes used by the vector index offload format. Every
//! manager crate (`engine-core`, `engine-ollama`) depends on this crate so
//! that the wire shapes used across kernel/vectordb/agent boundaries stay in
//! one place.

pub mod event;
pub mod identity;
pub mod kernel_types;
pub mod offload;
pub mod permission;

pub use event::ChatChunk;
pub use event::Event;
pub use identity::ResourceId;
pub use kernel_types::KernelMode;
pub use kernel_types::KernelStatus;
pub use kernel_types::Language;
pub use offload::OffloadMetadata;
pub use permission::Operation;
pub use permission::Permission;
