//! TangoFS backing store.
//!
//! Everything the filesystem knows about the control system goes through the
//! [`TangoDatabase`] trait. [`MemoryDatabase`] implements it in memory and is
//! used by the test suites and by the binary when mounting a snapshot file.

pub mod convert;
pub mod database;
pub mod error;
pub mod memory;
pub mod types;

pub use database::TangoDatabase;
pub use error::{DbError, DbResult};
pub use memory::{MemoryDatabase, Snapshot};
pub use types::{
    AttrDataFormat, AttrValue, AttrWriteType, AttributeConfig, AttributeReading, CommandInfo,
    DataType, DeviceInfo, DeviceSpec, DispLevel, PropertyHistoryEntry, Scalar,
};
