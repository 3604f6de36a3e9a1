//! In-memory control-system database.
//!
//! Holds servers, devices and their properties/attributes/commands in a
//! [`Snapshot`] behind a `RwLock`. Every trait call is recorded so tests can
//! assert on the exact traffic that reached the backing store, and faults
//! (timeouts, stopped devices) can be injected per operation.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::database::TangoDatabase;
use crate::error::{DbError, DbResult};
use crate::types::{
    AttrValue, AttrWriteType, AttributeConfig, AttributeReading, CommandInfo, DataType,
    DeviceInfo, DeviceSpec, PropertyHistoryEntry,
};

const HISTORY_DATE_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeRecord {
    #[serde(default)]
    pub config: AttributeConfig,
    pub value: AttrValue,
    #[serde(default)]
    pub w_value: Option<AttrValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    pub info: CommandInfo,
    /// Fixed result; when absent the argument is echoed back.
    #[serde(default)]
    pub result: Option<AttrValue>,
}

fn default_exported() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub class_name: String,
    pub server: String,
    #[serde(default = "default_exported")]
    pub exported: bool,
    #[serde(default)]
    pub started_date: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeRecord>,
    #[serde(default)]
    pub commands: BTreeMap<String, CommandRecord>,
}

impl DeviceRecord {
    pub fn new(class_name: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            server: server.into(),
            exported: true,
            started_date: None,
            properties: BTreeMap::new(),
            attributes: BTreeMap::new(),
            commands: BTreeMap::new(),
        }
    }
}

/// Serializable content of a [`MemoryDatabase`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    /// Registered `executable/instance` names.
    pub servers: BTreeSet<String>,
    /// Devices keyed by lowercase name.
    pub devices: BTreeMap<String, DeviceRecord>,
}

impl Snapshot {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        let mut snapshot: Snapshot = serde_json::from_str(json)?;
        snapshot.normalize();
        Ok(snapshot)
    }

    /// Lowercases device keys, registers their servers and fills in
    /// attribute/command names omitted from the file.
    fn normalize(&mut self) {
        let devices = std::mem::take(&mut self.devices);
        for (name, mut record) in devices {
            for (attr, rec) in record.attributes.iter_mut() {
                if rec.config.name.is_empty() {
                    rec.config.name = attr.clone();
                }
                if rec.config.label.is_empty() {
                    rec.config.label = attr.clone();
                }
            }
            for (cmd, rec) in record.commands.iter_mut() {
                if rec.info.name.is_empty() {
                    rec.info.name = cmd.clone();
                }
            }
            self.servers.insert(record.server.clone());
            self.devices.insert(name.to_lowercase(), record);
        }
    }
}

#[derive(Default)]
struct MemoryState {
    snapshot: Snapshot,
    history: BTreeMap<(String, String), Vec<PropertyHistoryEntry>>,
}

pub struct MemoryDatabase {
    state: RwLock<MemoryState>,
    calls: Mutex<Vec<String>>,
    timeouts: RwLock<HashSet<String>>,
    timeout_ms: u64,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::from_snapshot(Snapshot::default())
    }

    pub fn from_snapshot(mut snapshot: Snapshot) -> Self {
        snapshot.normalize();
        Self {
            state: RwLock::new(MemoryState {
                snapshot,
                history: BTreeMap::new(),
            }),
            calls: Mutex::new(Vec::new()),
            timeouts: RwLock::new(HashSet::new()),
            timeout_ms: 3000,
        }
    }

    /// Timeout reported by injected [`DbError::Timeout`] failures.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn snapshot(&self) -> Snapshot {
        match self.state.read() {
            Ok(state) => state.snapshot.clone(),
            Err(e) => e.into_inner().snapshot.clone(),
        }
    }

    // Fixture setup. These bypass call recording.

    pub fn insert_device(&self, spec: &DeviceSpec) {
        if let Ok(mut state) = self.state.write() {
            state.snapshot.servers.insert(spec.server.clone());
            state.snapshot.devices.insert(
                spec.name.to_lowercase(),
                DeviceRecord::new(&spec.class_name, &spec.server),
            );
        }
    }

    pub fn insert_property(&self, device: &str, name: &str, value: &[&str]) {
        if let Ok(mut state) = self.state.write() {
            if let Some(dev) = state.snapshot.devices.get_mut(&device.to_lowercase()) {
                dev.properties
                    .insert(name.to_string(), value.iter().map(|s| s.to_string()).collect());
            }
        }
    }

    pub fn insert_attribute(
        &self,
        device: &str,
        config: AttributeConfig,
        value: AttrValue,
        w_value: Option<AttrValue>,
    ) {
        if let Ok(mut state) = self.state.write() {
            if let Some(dev) = state.snapshot.devices.get_mut(&device.to_lowercase()) {
                dev.attributes.insert(
                    config.name.clone(),
                    AttributeRecord {
                        config,
                        value,
                        w_value,
                    },
                );
            }
        }
    }

    pub fn insert_command(&self, device: &str, info: CommandInfo, result: Option<AttrValue>) {
        if let Ok(mut state) = self.state.write() {
            if let Some(dev) = state.snapshot.devices.get_mut(&device.to_lowercase()) {
                dev.commands
                    .insert(info.name.clone(), CommandRecord { info, result });
            }
        }
    }

    /// Marks a device as running or stopped. Stopped devices fail `ping` and
    /// every attribute/command call.
    pub fn set_exported(&self, device: &str, exported: bool) {
        if let Ok(mut state) = self.state.write() {
            if let Some(dev) = state.snapshot.devices.get_mut(&device.to_lowercase()) {
                dev.exported = exported;
            }
        }
    }

    /// Makes every subsequent call of `op` fail with [`DbError::Timeout`].
    pub fn inject_timeout(&self, op: &str) {
        if let Ok(mut timeouts) = self.timeouts.write() {
            timeouts.insert(op.to_string());
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut timeouts) = self.timeouts.write() {
            timeouts.clear();
        }
    }

    /// Names of the trait methods called so far, in order.
    pub fn calls(&self) -> Vec<String> {
        match self.calls.lock() {
            Ok(calls) => calls.clone(),
            Err(e) => e.into_inner().clone(),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls().len()
    }

    /// Number of calls of one method.
    pub fn count_of(&self, op: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == op).count()
    }

    pub fn reset_calls(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }

    fn begin(&self, op: &str) -> DbResult<()> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(op.to_string());
        }
        let timed_out = self
            .timeouts
            .read()
            .map(|t| t.contains(op))
            .unwrap_or(false);
        if timed_out {
            debug!("memory db: injected timeout for {}", op);
            return Err(DbError::Timeout {
                op: op.to_string(),
                timeout_ms: self.timeout_ms,
            });
        }
        Ok(())
    }

    fn read(&self, op: &str) -> DbResult<RwLockReadGuard<'_, MemoryState>> {
        self.begin(op)?;
        self.state
            .read()
            .map_err(|e| DbError::dev_failed("API_InternalError", e.to_string()))
    }

    fn write(&self, op: &str) -> DbResult<RwLockWriteGuard<'_, MemoryState>> {
        self.begin(op)?;
        self.state
            .write()
            .map_err(|e| DbError::dev_failed("API_InternalError", e.to_string()))
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

fn not_defined(device: &str) -> DbError {
    DbError::dev_failed(
        "DB_DeviceNotDefined",
        format!("device {} not defined in the database", device),
    )
}

fn device<'a>(state: &'a MemoryState, name: &str) -> DbResult<&'a DeviceRecord> {
    state
        .snapshot
        .devices
        .get(&name.to_lowercase())
        .ok_or_else(|| not_defined(name))
}

fn device_mut<'a>(state: &'a mut MemoryState, name: &str) -> DbResult<&'a mut DeviceRecord> {
    state
        .snapshot
        .devices
        .get_mut(&name.to_lowercase())
        .ok_or_else(|| not_defined(name))
}

fn running<'a>(state: &'a MemoryState, name: &str) -> DbResult<&'a DeviceRecord> {
    let dev = device(state, name)?;
    if !dev.exported {
        return Err(DbError::dev_failed(
            "API_DeviceNotExported",
            format!("device {} is not exported", name),
        ));
    }
    Ok(dev)
}

fn find_ci<'a, V>(map: &'a BTreeMap<String, V>, key: &str) -> Option<(&'a String, &'a V)> {
    map.get_key_value(key)
        .or_else(|| map.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)))
}

fn attribute<'a>(dev: &'a DeviceRecord, name: &str) -> DbResult<&'a AttributeRecord> {
    find_ci(&dev.attributes, name)
        .map(|(_, rec)| rec)
        .ok_or_else(|| {
            DbError::dev_failed("API_AttrNotFound", format!("attribute {} not found", name))
        })
}

fn segments(name: &str) -> Option<(&str, &str, &str)> {
    let mut parts = name.splitn(3, '/');
    Some((parts.next()?, parts.next()?, parts.next()?))
}

fn now_date() -> String {
    chrono::Local::now().format(HISTORY_DATE_FORMAT).to_string()
}

impl TangoDatabase for MemoryDatabase {
    fn server_names(&self) -> DbResult<Vec<String>> {
        let state = self.read("server_names")?;
        let names: BTreeSet<String> = state
            .snapshot
            .servers
            .iter()
            .filter_map(|s| s.split_once('/').map(|(exe, _)| exe.to_string()))
            .collect();
        Ok(names.into_iter().collect())
    }

    fn instance_names(&self, server: &str) -> DbResult<Vec<String>> {
        let state = self.read("instance_names")?;
        Ok(state
            .snapshot
            .servers
            .iter()
            .filter_map(|s| s.split_once('/'))
            .filter(|(exe, _)| *exe == server)
            .map(|(_, inst)| inst.to_string())
            .collect())
    }

    fn server_class_names(&self, server_instance: &str) -> DbResult<Vec<String>> {
        let state = self.read("server_class_names")?;
        let classes: BTreeSet<String> = state
            .snapshot
            .devices
            .values()
            .filter(|d| d.server == server_instance)
            .map(|d| d.class_name.clone())
            .collect();
        Ok(classes.into_iter().collect())
    }

    fn device_names(&self, server_instance: &str, class_name: &str) -> DbResult<Vec<String>> {
        let state = self.read("device_names")?;
        Ok(state
            .snapshot
            .devices
            .iter()
            .filter(|(_, d)| d.server == server_instance && d.class_name == class_name)
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn domain_names(&self) -> DbResult<Vec<String>> {
        let state = self.read("domain_names")?;
        let domains: BTreeSet<String> = state
            .snapshot
            .devices
            .keys()
            .filter_map(|n| segments(n).map(|(d, _, _)| d.to_string()))
            .collect();
        Ok(domains.into_iter().collect())
    }

    fn family_names(&self, domain: &str) -> DbResult<Vec<String>> {
        let state = self.read("family_names")?;
        let domain = domain.to_lowercase();
        let families: BTreeSet<String> = state
            .snapshot
            .devices
            .keys()
            .filter_map(|n| segments(n))
            .filter(|(d, _, _)| *d == domain)
            .map(|(_, f, _)| f.to_string())
            .collect();
        Ok(families.into_iter().collect())
    }

    fn member_names(&self, domain: &str, family: &str) -> DbResult<Vec<String>> {
        let state = self.read("member_names")?;
        let (domain, family) = (domain.to_lowercase(), family.to_lowercase());
        Ok(state
            .snapshot
            .devices
            .keys()
            .filter_map(|n| segments(n))
            .filter(|(d, f, _)| *d == domain && *f == family)
            .map(|(_, _, m)| m.to_string())
            .collect())
    }

    fn device_info(&self, name: &str) -> DbResult<DeviceInfo> {
        let state = self.read("device_info")?;
        let dev = device(&state, name)?;
        Ok(DeviceInfo {
            name: name.to_lowercase(),
            class_name: dev.class_name.clone(),
            server: dev.server.clone(),
            exported: dev.exported,
            started_date: dev.started_date.clone(),
        })
    }

    fn add_server(&self, server_instance: &str, devices: &[DeviceSpec]) -> DbResult<()> {
        let mut state = self.write("add_server")?;
        if !server_instance.contains('/') {
            return Err(DbError::dev_failed(
                "DB_IncorrectServerName",
                format!("{} is not of the form executable/instance", server_instance),
            ));
        }
        state.snapshot.servers.insert(server_instance.to_string());
        for spec in devices {
            let key = spec.name.to_lowercase();
            match state.snapshot.devices.get_mut(&key) {
                Some(existing) => {
                    existing.server = server_instance.to_string();
                    existing.class_name = spec.class_name.clone();
                }
                None => {
                    state
                        .snapshot
                        .devices
                        .insert(key, DeviceRecord::new(&spec.class_name, server_instance));
                }
            }
        }
        Ok(())
    }

    fn add_device(&self, spec: &DeviceSpec) -> DbResult<()> {
        let mut state = self.write("add_device")?;
        if segments(&spec.name).is_none() {
            return Err(DbError::dev_failed(
                "DB_IncorrectDeviceName",
                format!("{} is not of the form domain/family/member", spec.name),
            ));
        }
        state.snapshot.servers.insert(spec.server.clone());
        let key = spec.name.to_lowercase();
        match state.snapshot.devices.get_mut(&key) {
            Some(existing) => {
                existing.server = spec.server.clone();
                existing.class_name = spec.class_name.clone();
            }
            None => {
                state
                    .snapshot
                    .devices
                    .insert(key, DeviceRecord::new(&spec.class_name, &spec.server));
            }
        }
        Ok(())
    }

    fn delete_server(&self, server_instance: &str) -> DbResult<()> {
        let mut state = self.write("delete_server")?;
        if !state.snapshot.servers.remove(server_instance) {
            return Err(DbError::dev_failed(
                "DB_DeviceNotDefined",
                format!("server {} not defined in the database", server_instance),
            ));
        }
        state
            .snapshot
            .devices
            .retain(|_, d| d.server != server_instance);
        Ok(())
    }

    fn delete_device(&self, name: &str) -> DbResult<()> {
        let mut state = self.write("delete_device")?;
        state
            .snapshot
            .devices
            .remove(&name.to_lowercase())
            .map(|_| ())
            .ok_or_else(|| not_defined(name))
    }

    fn property_names(&self, name: &str) -> DbResult<Vec<String>> {
        let state = self.read("property_names")?;
        Ok(device(&state, name)?.properties.keys().cloned().collect())
    }

    fn get_property(&self, name: &str, property: &str) -> DbResult<Vec<String>> {
        let state = self.read("get_property")?;
        let dev = device(&state, name)?;
        Ok(find_ci(&dev.properties, property)
            .map(|(_, v)| v.clone())
            .unwrap_or_default())
    }

    fn put_property(&self, name: &str, property: &str, value: &[String]) -> DbResult<()> {
        let mut state = self.write("put_property")?;
        let dev = device_mut(&mut state, name)?;
        dev.properties.insert(property.to_string(), value.to_vec());
        state
            .history
            .entry((name.to_lowercase(), property.to_string()))
            .or_default()
            .push(PropertyHistoryEntry {
                date: now_date(),
                value: value.to_vec(),
                deleted: false,
            });
        Ok(())
    }

    fn delete_property(&self, name: &str, property: &str) -> DbResult<()> {
        let mut state = self.write("delete_property")?;
        let dev = device_mut(&mut state, name)?;
        if dev.properties.remove(property).is_some() {
            state
                .history
                .entry((name.to_lowercase(), property.to_string()))
                .or_default()
                .push(PropertyHistoryEntry {
                    date: now_date(),
                    value: Vec::new(),
                    deleted: true,
                });
        }
        Ok(())
    }

    fn property_history(&self, name: &str, property: &str) -> DbResult<Vec<PropertyHistoryEntry>> {
        let state = self.read("property_history")?;
        Ok(state
            .history
            .get(&(name.to_lowercase(), property.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    fn ping(&self, name: &str) -> DbResult<Duration> {
        let state = self.read("ping")?;
        running(&state, name)?;
        Ok(Duration::from_micros(50))
    }

    fn attribute_names(&self, name: &str) -> DbResult<Vec<String>> {
        let state = self.read("attribute_names")?;
        Ok(running(&state, name)?.attributes.keys().cloned().collect())
    }

    fn attribute_configs(&self, name: &str, names: &[String]) -> DbResult<Vec<AttributeConfig>> {
        let state = self.read("attribute_configs")?;
        let dev = running(&state, name)?;
        names
            .iter()
            .map(|attr| attribute(dev, attr).map(|rec| rec.config.clone()))
            .collect()
    }

    fn attribute_config(&self, name: &str, attr: &str) -> DbResult<AttributeConfig> {
        let state = self.read("attribute_config")?;
        let dev = running(&state, name)?;
        Ok(attribute(dev, attr)?.config.clone())
    }

    fn set_attribute_config(&self, name: &str, config: &AttributeConfig) -> DbResult<()> {
        let mut state = self.write("set_attribute_config")?;
        running(&state, name)?;
        let dev = device_mut(&mut state, name)?;
        let key = find_ci(&dev.attributes, &config.name)
            .map(|(k, _)| k.clone())
            .ok_or_else(|| {
                DbError::dev_failed(
                    "API_AttrNotFound",
                    format!("attribute {} not found", config.name),
                )
            })?;
        if let Some(rec) = dev.attributes.get_mut(&key) {
            let mut updated = config.clone();
            // name and shape are not configurable
            updated.name = rec.config.name.clone();
            updated.data_type = rec.config.data_type;
            updated.data_format = rec.config.data_format;
            updated.writable = rec.config.writable;
            rec.config = updated;
        }
        Ok(())
    }

    fn read_attribute(&self, name: &str, attr: &str) -> DbResult<AttributeReading> {
        let state = self.read("read_attribute")?;
        let rec = attribute(running(&state, name)?, attr)?;
        Ok(AttributeReading {
            value: rec.value.clone(),
            w_value: rec.w_value.clone(),
        })
    }

    fn write_attribute(&self, name: &str, attr: &str, value: AttrValue) -> DbResult<()> {
        let mut state = self.write("write_attribute")?;
        running(&state, name)?;
        let dev = device_mut(&mut state, name)?;
        let key = find_ci(&dev.attributes, attr)
            .map(|(k, _)| k.clone())
            .ok_or_else(|| {
                DbError::dev_failed("API_AttrNotFound", format!("attribute {} not found", attr))
            })?;
        if let Some(rec) = dev.attributes.get_mut(&key) {
            if !rec.config.writable.is_writable() {
                return Err(DbError::dev_failed(
                    "API_AttrNotWritable",
                    format!("attribute {} is not writable", attr),
                ));
            }
            if value.format() != rec.config.data_format {
                return Err(DbError::dev_failed(
                    "API_IncompatibleAttrDataType",
                    format!(
                        "attribute {} expects {} data",
                        attr, rec.config.data_format
                    ),
                ));
            }
            if rec.config.writable != AttrWriteType::ReadWithWrite {
                rec.value = value.clone();
            }
            rec.w_value = Some(value);
        }
        Ok(())
    }

    fn command_list(&self, name: &str) -> DbResult<Vec<CommandInfo>> {
        let state = self.read("command_list")?;
        Ok(running(&state, name)?
            .commands
            .values()
            .map(|c| c.info.clone())
            .collect())
    }

    fn command_info(&self, name: &str, command: &str) -> DbResult<CommandInfo> {
        let state = self.read("command_info")?;
        find_ci(&running(&state, name)?.commands, command)
            .map(|(_, c)| c.info.clone())
            .ok_or_else(|| {
                DbError::dev_failed(
                    "API_CommandNotFound",
                    format!("command {} not found", command),
                )
            })
    }

    fn command_inout(
        &self,
        name: &str,
        command: &str,
        argument: Option<AttrValue>,
    ) -> DbResult<Option<AttrValue>> {
        let state = self.read("command_inout")?;
        let (_, cmd) = find_ci(&running(&state, name)?.commands, command).ok_or_else(|| {
            DbError::dev_failed(
                "API_CommandNotFound",
                format!("command {} not found", command),
            )
        })?;
        let expects_arg = cmd.info.in_type != DataType::Void;
        if expects_arg != argument.is_some() {
            return Err(DbError::dev_failed(
                "API_IncompatibleCmdArgumentType",
                format!("command {} takes a {} argument", command, cmd.info.in_type),
            ));
        }
        if cmd.result.is_some() {
            return Ok(cmd.result.clone());
        }
        if cmd.info.out_type == DataType::Void {
            return Ok(None);
        }
        Ok(argument)
    }
}
