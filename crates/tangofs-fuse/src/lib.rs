#![warn(missing_docs)]

//! TangoFS: a Tango control system presented as a filesystem.
//!
//! Servers, devices, properties, attributes and commands become a tree of
//! directories and files. Children are enumerated lazily and cached for a
//! configurable time; writes that span several filesystem calls are staged
//! in an [`overlay::Overlay`] until they can be committed.

pub mod attr;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod filesystem;
pub mod inode;
pub mod leaf;
pub mod mutation;
pub mod namespace;
pub mod node;
pub mod ops;
pub mod overlay;
pub mod script;

pub use config::TangoFsConfig;
pub use error::{Result, TangoFsError};
pub use filesystem::TangoFsFilesystem;
pub use namespace::Namespace;
pub use node::{Node, NodeKind};
pub use ops::{DirEntry, Target, TangoFs};
pub use overlay::{Overlay, PendingOp};
