//! The container lifecycle engine.
//!
//! [`ContainerManager`] is the entry point. Its operations are spread across the submodules by
//! concern, each adding an `impl ContainerManager` block.

mod backup;
mod cgroup;
mod config_lines;
mod convert;
mod images;
mod lifecycle;
mod manager;
mod registry;
mod restore;
mod snapshot;
mod tracker;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use backup::*;
pub use cgroup::*;
pub use config_lines::*;
pub use images::*;
pub use lifecycle::*;
pub use manager::*;
pub use registry::*;
pub use snapshot::*;
pub use tracker::*;
