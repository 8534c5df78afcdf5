//! `lxcore` is the container lifecycle and state-reconciliation engine for LXC hosts.
//!
//! # Overview
//!
//! lxcore drives the `lxc-*` tools and the host filesystem to manage containers. It handles:
//! - Lifecycle transitions (start, stop, freeze, create, destroy)
//! - Compressed backups and restores
//! - Snapshots, snapshot rollback and cloning
//! - BTRFS conversion of directory-backed containers
//! - CPU and memory accounting from cgroup v2
//! - The catalog of downloadable images
//!
//! # Key Features
//!
//! - **Mutual Exclusion**: At most one long-running job per container, enforced before any
//!   external tool runs
//! - **Detached Jobs**: Backups, restores, conversions and snapshot jobs return as soon as they
//!   are accepted and report completion through a notification sink and an event channel
//! - **Crash-Safe Cleanup**: A failed or aborted backup never leaves a partial archive, a stray
//!   snapshot or a stopped container behind
//! - **Disk As Source Of Truth**: Container metadata lives in sentinel lines of the native LXC
//!   config files, caches are only ever an optimization
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use lxcore::{
//!     config::FileSettings,
//!     management::{BackupOptions, ContainerManager},
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = ContainerManager::from_host(Arc::new(FileSettings::from_env())).await?;
//!
//!     for container in manager.list_containers().await? {
//!         println!("{} {}", container.name, container.state);
//!     }
//!
//!     let started = manager
//!         .backup_container("web1", &BackupOptions::default())
//!         .await?;
//!     println!("writing {}", started.backup_file);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`cli`] - Command-line argument parsing
//! - [`config`] - Settings and defaults
//! - [`host`] - The external tools lxcore drives
//! - [`management`] - The container engine
//! - [`models`] - Data returned to callers
//! - [`notify`] - Job notifications
//! - [`utils`] - Paths, validation and small helpers

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod cli;
pub mod config;
pub mod host;
pub mod management;
pub mod models;
pub mod notify;
pub mod utils;

pub use error::*;
