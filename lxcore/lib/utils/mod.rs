//! Utility functions and types.

mod command;
mod format;
mod host;
mod path;
mod validate;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use command::*;
pub use format::*;
pub use host::*;
pub use path::*;
pub use validate::*;
