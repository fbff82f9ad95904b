//! Config file sources layered over the merge policy defaults.

pub mod global_file;
pub mod workspace_file;
