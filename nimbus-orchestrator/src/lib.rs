//! Cluster orchestration on top of a virtualization control plane.
//!
//! `ClusterBootstrapper` is the entry point; everything else is a building
//! block it composes.

pub mod addresses;
pub mod bootstrap;
pub mod cluster_config;
pub mod connection;
pub mod directory;
pub mod license;
pub mod lifecycle;
pub mod logger;
pub mod poller;
pub mod provider_manager;
pub mod provisioner;
pub mod scaler;
pub mod settings;
pub mod template;

pub use bootstrap::{ClusterBootstrapper, CreateClusterRequest};
pub use connection::{ConnectionPool, PooledConnection};
pub use scaler::{ParallelNodeScaler, ScaleOptions};
pub use settings::Settings;
