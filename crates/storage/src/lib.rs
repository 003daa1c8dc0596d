//! Backend adapters that workspaces are synchronised to.
//!
//! Every adapter implements [`StorageBackend`]: a push/pull/delete/list
//! contract over logical workspace paths, plus [`Capabilities`] describing
//! which optional behaviour (versions, renames, directories) it supports.
//! The sync core only ever talks to a [`BackendHandle`], so adapters are
//! interchangeable, including in tests.

pub mod backend;
pub mod error;
mod models;
pub mod path;

pub use crate::backend::StorageBackend;
pub use crate::models::{Capabilities, FileDescriptor, RemoteEntry};
pub use crate::path::validate as validate_path;
use std::sync::Arc;

pub type BackendHandle = Arc<dyn StorageBackend + Send + Sync>;
