//! Catalog records, remote layout and configuration shared by the `simfleet` crates.

pub mod catalog;
pub mod config;
pub mod layout;
pub mod model;

pub use catalog::{CatalogError, CatalogSnapshot};
pub use config::{FleetConfig, SshSettings};
pub use model::{
    Archive, ArchiveId, Credentials, Endpoint, InstanceId, Job, JobId, JobInstance, Model,
    ModelId, Resource, ResourceKey, Server, ServerId, Template, TemplateId, TemplateKind,
};
