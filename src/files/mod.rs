//! The managed download tree: path confinement, listings and archives.

pub mod archive;
pub mod catalog;
pub mod guard;

pub use catalog::{FileCatalog, FsError, Listing};
pub use guard::{PathGuard, SecurityError};
