//! The control-system client interface.
//!
//! All calls are blocking and may fail with [`DbError`]. Implementations are
//! expected to bound every call with their own request timeout and report
//! expiry as [`DbError::Timeout`].
//!
//! [`DbError`]: crate::DbError
//! [`DbError::Timeout`]: crate::DbError::Timeout

use crate::error::DbResult;
use crate::types::{
    AttrValue, AttributeConfig, AttributeReading, CommandInfo, DeviceInfo, DeviceSpec,
    PropertyHistoryEntry,
};
use std::time::Duration;

pub trait TangoDatabase: Send + Sync {
    /// Server executable names (the part before the slash).
    fn server_names(&self) -> DbResult<Vec<String>>;
    /// Instance names of one executable.
    fn instance_names(&self, server: &str) -> DbResult<Vec<String>>;
    /// Device classes served by `executable/instance`.
    fn server_class_names(&self, server_instance: &str) -> DbResult<Vec<String>>;
    /// Devices of one class in `executable/instance`.
    fn device_names(&self, server_instance: &str, class_name: &str) -> DbResult<Vec<String>>;

    fn domain_names(&self) -> DbResult<Vec<String>>;
    fn family_names(&self, domain: &str) -> DbResult<Vec<String>>;
    fn member_names(&self, domain: &str, family: &str) -> DbResult<Vec<String>>;

    fn device_info(&self, device: &str) -> DbResult<DeviceInfo>;

    /// Registers a new `executable/instance` together with its devices.
    fn add_server(&self, server_instance: &str, devices: &[DeviceSpec]) -> DbResult<()>;
    /// Registers a device, moving it if it already belongs to another server.
    fn add_device(&self, device: &DeviceSpec) -> DbResult<()>;
    /// Removes `executable/instance` and every device still registered to it.
    fn delete_server(&self, server_instance: &str) -> DbResult<()>;
    fn delete_device(&self, device: &str) -> DbResult<()>;

    fn property_names(&self, device: &str) -> DbResult<Vec<String>>;
    fn get_property(&self, device: &str, name: &str) -> DbResult<Vec<String>>;
    fn put_property(&self, device: &str, name: &str, value: &[String]) -> DbResult<()>;
    fn delete_property(&self, device: &str, name: &str) -> DbResult<()>;
    fn property_history(&self, device: &str, name: &str) -> DbResult<Vec<PropertyHistoryEntry>>;

    /// Round trip to the device itself. Fails if the device is not running.
    fn ping(&self, device: &str) -> DbResult<Duration>;

    fn attribute_names(&self, device: &str) -> DbResult<Vec<String>>;
    /// Fetches several configurations in one call.
    fn attribute_configs(&self, device: &str, names: &[String]) -> DbResult<Vec<AttributeConfig>>;
    fn attribute_config(&self, device: &str, name: &str) -> DbResult<AttributeConfig>;
    fn set_attribute_config(&self, device: &str, config: &AttributeConfig) -> DbResult<()>;
    fn read_attribute(&self, device: &str, name: &str) -> DbResult<AttributeReading>;
    fn write_attribute(&self, device: &str, name: &str, value: AttrValue) -> DbResult<()>;

    fn command_list(&self, device: &str) -> DbResult<Vec<CommandInfo>>;
    fn command_info(&self, device: &str, command: &str) -> DbResult<CommandInfo>;
    fn command_inout(
        &self,
        device: &str,
        command: &str,
        argument: Option<AttrValue>,
    ) -> DbResult<Option<AttrValue>>;
}
