#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! In-process scheduling engine for `simfleet` (dispatch queues, resource workers,
//! remote launch and archive replication).

/// Public API for the engine crate.
pub mod api;
/// Remote execution channel and the node probes built on it.
pub mod remote;
/// `ssh`-backed implementation of the remote execution channel.
pub mod ssh;
/// Durable catalog storage.
pub mod store;

mod archive;
mod catalog;
mod engine;
mod links;
mod protocol;
mod queue;
mod template;
mod worker;

#[cfg(test)]
mod testing;

pub use api::{
    start_engine, EngineConfig, EngineEvent, EngineHandle, InstanceOutcome, InstanceSummary,
    ResourceSnapshot, StatusSnapshot, WorkerStage,
};
pub use remote::{Connector, RemoteChannel, RemoteError};
pub use ssh::SshConnector;
pub use store::{CatalogStore, JsonCatalogStore, MemoryCatalogStore};
