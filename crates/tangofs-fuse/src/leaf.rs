//! Terminal nodes: properties, attributes and commands.
//!
//! The `*Leaf` structs hold the cached state and live inside a [`Node`]. The
//! borrowed views ([`Property`], [`Attribute`], [`Command`]) pair a leaf with
//! its node so operations can reach the backing store and the freshness
//! settings.

use std::sync::Mutex;
use std::time::Instant;

use chrono::NaiveDateTime;
use tangofs_db::convert::{format_value, parse_scalar, parse_value, property_to_text, text_to_property};
use tangofs_db::{
    AttrValue, AttrWriteType, AttributeConfig, AttributeReading, CommandInfo,
    DataType, DbError, PropertyHistoryEntry,
};
use tracing::debug;

use crate::error::{Result, TangoFsError};
use crate::node::{lock, Node, Scope};
use crate::script;

const HISTORY_DATE_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

/// Attribute files backed by the reading rather than the configuration.
pub const VALUE_FIELD: &str = "value";
pub const W_VALUE_FIELD: &str = "w_value";

const CONFIG_FIELDS: &[&str] = &[
    "data_format",
    "data_type",
    "description",
    "disp_level",
    "display_unit",
    "format",
    "label",
    "max_alarm",
    "max_dim_x",
    "max_dim_y",
    "max_value",
    "min_alarm",
    "min_value",
    "standard_unit",
    "unit",
    "writable",
];

const SETTABLE_FIELDS: &[&str] = &[
    "min_value",
    "max_value",
    "min_alarm",
    "max_alarm",
    "description",
    "label",
    "unit",
    "standard_unit",
    "display_unit",
    "format",
];

#[derive(Debug)]
pub struct PropertyLeaf {
    device: String,
    /// Value with the time and generation it was fetched at.
    value: Mutex<Option<(Instant, u64, Vec<String>)>>,
    history: Mutex<Option<(u64, Vec<PropertyHistoryEntry>)>>,
}

impl PropertyLeaf {
    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            value: Mutex::new(None),
            history: Mutex::new(None),
        }
    }

    pub(crate) fn invalidate(&self) {
        *lock(&self.value) = None;
        *lock(&self.history) = None;
    }
}

#[derive(Debug)]
pub struct AttributeLeaf {
    device: String,
    /// Attribute name without the expert-level dot prefix.
    name: String,
    reading: Mutex<Option<(Instant, AttributeReading)>>,
    config: Mutex<Option<AttributeConfig>>,
}

impl AttributeLeaf {
    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn new(
        device: impl Into<String>,
        name: impl Into<String>,
        config: Option<AttributeConfig>,
    ) -> Self {
        Self {
            device: device.into(),
            name: name.into(),
            reading: Mutex::new(None),
            config: Mutex::new(config),
        }
    }

    pub(crate) fn invalidate(&self) {
        *lock(&self.reading) = None;
        *lock(&self.config) = None;
    }
}

#[derive(Debug)]
pub struct CommandLeaf {
    device: String,
    info: Mutex<Option<CommandInfo>>,
}

impl CommandLeaf {
    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn new(device: impl Into<String>, info: Option<CommandInfo>) -> Self {
        Self {
            device: device.into(),
            info: Mutex::new(info),
        }
    }

    pub(crate) fn invalidate(&self) {
        *lock(&self.info) = None;
    }
}

pub struct Property<'a> {
    pub(crate) node: &'a Node,
    pub(crate) leaf: &'a PropertyLeaf,
}

impl<'a> Property<'a> {
    pub fn name(&self) -> &str {
        self.node.name()
    }

    pub fn device(&self) -> &str {
        &self.leaf.device
    }

    fn scope(&self) -> Scope<'_> {
        Scope::Property(&self.leaf.device, self.name())
    }

    fn is_fresh(&self, at: Instant) -> bool {
        match self.node.context().ttl {
            Some(ttl) => at.elapsed() <= ttl,
            None => true,
        }
    }

    pub fn value(&self) -> Result<Vec<String>> {
        let generation = self.node.context().generation(self.scope());
        if let Some((at, seen, value)) = lock(&self.leaf.value).as_ref() {
            if *seen == generation && self.is_fresh(*at) {
                return Ok(value.clone());
            }
        }
        let value = self
            .node
            .context()
            .db
            .get_property(&self.leaf.device, self.name())?;
        debug!("property {}/{}: fetched {} line(s)", self.leaf.device, self.name(), value.len());
        *lock(&self.leaf.value) = Some((Instant::now(), generation, value.clone()));
        Ok(value)
    }

    /// The value as file content, one line per element.
    pub fn text(&self) -> Result<String> {
        self.value().map(|v| property_to_text(&v))
    }

    pub fn history(&self) -> Result<Vec<PropertyHistoryEntry>> {
        let generation = self.node.context().generation(self.scope());
        if let Some((seen, history)) = lock(&self.leaf.history).as_ref() {
            if *seen == generation {
                return Ok(history.clone());
            }
        }
        let history = self
            .node
            .context()
            .db
            .property_history(&self.leaf.device, self.name())?;
        *lock(&self.leaf.history) = Some((generation, history.clone()));
        Ok(history)
    }

    /// Date of the most recent history entry, if it parses.
    pub fn last_modified(&self) -> Result<Option<NaiveDateTime>> {
        Ok(self
            .history()?
            .last()
            .and_then(|h| NaiveDateTime::parse_from_str(&h.date, HISTORY_DATE_FORMAT).ok()))
    }

    /// Replaces the whole value and drops everything cached about it.
    pub fn set_value(&self, value: &[String]) -> Result<()> {
        self.node
            .context()
            .db
            .put_property(&self.leaf.device, self.name(), value)?;
        self.node.context().bump(self.scope());
        self.leaf.invalidate();
        Ok(())
    }

    pub fn set_text(&self, text: &str) -> Result<()> {
        self.set_value(&text_to_property(text))
    }

    pub fn invalidate(&self) {
        self.leaf.invalidate();
    }
}

pub struct Attribute<'a> {
    pub(crate) node: &'a Node,
    pub(crate) leaf: &'a AttributeLeaf,
}

impl<'a> Attribute<'a> {
    pub fn name(&self) -> &str {
        &self.leaf.name
    }

    pub fn device(&self) -> &str {
        &self.leaf.device
    }

    pub fn config(&self) -> Result<AttributeConfig> {
        if let Some(config) = lock(&self.leaf.config).as_ref() {
            return Ok(config.clone());
        }
        let config = self
            .node
            .context()
            .db
            .attribute_config(&self.leaf.device, &self.leaf.name)?;
        *lock(&self.leaf.config) = Some(config.clone());
        Ok(config)
    }

    pub fn is_writable(&self) -> Result<bool> {
        Ok(self.config()?.writable.is_writable())
    }

    /// Current reading; two calls closer than the debounce interval share one
    /// backing-store read.
    pub fn reading(&self) -> Result<AttributeReading> {
        let debounce = self.node.context().attribute_debounce;
        if let Some((at, reading)) = lock(&self.leaf.reading).as_ref() {
            if at.elapsed() < debounce {
                return Ok(reading.clone());
            }
        }
        let reading = self
            .node
            .context()
            .db
            .read_attribute(&self.leaf.device, &self.leaf.name)?;
        *lock(&self.leaf.reading) = Some((Instant::now(), reading.clone()));
        Ok(reading)
    }

    /// Files listed inside the attribute directory.
    pub fn field_names(&self) -> Result<Vec<String>> {
        let config = self.config()?;
        let mut names = vec![VALUE_FIELD.to_string()];
        if config.writable != AttrWriteType::Read {
            names.push(W_VALUE_FIELD.to_string());
        }
        names.extend(CONFIG_FIELDS.iter().map(|f| f.to_string()));
        Ok(names)
    }

    pub fn has_field(&self, field: &str) -> Result<bool> {
        Ok(self.field_names()?.iter().any(|f| f == field))
    }

    pub fn is_field_writable(&self, field: &str) -> Result<bool> {
        match field {
            VALUE_FIELD | W_VALUE_FIELD => self.is_writable(),
            f => Ok(SETTABLE_FIELDS.contains(&f)),
        }
    }

    pub fn field_text(&self, field: &str) -> Result<String> {
        match field {
            VALUE_FIELD => Ok(format_value(&self.reading()?.value)),
            W_VALUE_FIELD => Ok(self
                .reading()?
                .w_value
                .as_ref()
                .map(format_value)
                .unwrap_or_default()),
            f => {
                let config = self.config()?;
                let text = config_field(&config, f).ok_or_else(|| TangoFsError::NotFound {
                    path: format!("{}/{}", self.leaf.name, f),
                })?;
                Ok(format!("{}\n", text))
            }
        }
    }

    /// Writes one field. `value` and `w_value` write the attribute itself;
    /// configuration fields update the stored configuration.
    pub fn write_field(&self, field: &str, text: &str) -> Result<()> {
        let db = &self.node.context().db;
        match field {
            VALUE_FIELD | W_VALUE_FIELD => {
                let config = self.config()?;
                let value = parse_value(config.data_type, config.data_format, text)
                    .map_err(invalid_argument)?;
                db.write_attribute(&self.leaf.device, &self.leaf.name, value)?;
                *lock(&self.leaf.reading) = None;
            }
            f if SETTABLE_FIELDS.contains(&f) => {
                let mut config = self.config()?;
                set_config_field(&mut config, f, text.trim());
                db.set_attribute_config(&self.leaf.device, &config)?;
                *lock(&self.leaf.config) = None;
            }
            f => {
                return Err(TangoFsError::invalid_operation(
                    "write",
                    format!("{}/{}", self.leaf.name, f),
                ))
            }
        }
        debug!("attribute {}/{}: wrote {}", self.leaf.device, self.leaf.name, field);
        Ok(())
    }

    pub fn invalidate(&self) {
        self.leaf.invalidate();
    }
}

fn invalid_argument(err: DbError) -> TangoFsError {
    match err {
        DbError::InvalidValue { msg } => TangoFsError::InvalidArgument { msg },
        other => TangoFsError::Remote(other),
    }
}

fn config_field(config: &AttributeConfig, field: &str) -> Option<String> {
    let text = match field {
        "data_format" => config.data_format.to_string(),
        "data_type" => config.data_type.to_string(),
        "description" => config.description.clone(),
        "disp_level" => config.disp_level.to_string(),
        "display_unit" => config.display_unit.clone(),
        "format" => config.format.clone(),
        "label" => config.label.clone(),
        "max_alarm" => config.max_alarm.clone(),
        "max_dim_x" => config.max_dim_x.to_string(),
        "max_dim_y" => config.max_dim_y.to_string(),
        "max_value" => config.max_value.clone(),
        "min_alarm" => config.min_alarm.clone(),
        "min_value" => config.min_value.clone(),
        "standard_unit" => config.standard_unit.clone(),
        "unit" => config.unit.clone(),
        "writable" => config.writable.to_string(),
        _ => return None,
    };
    Some(text)
}

fn set_config_field(config: &mut AttributeConfig, field: &str, text: &str) {
    let slot = match field {
        "min_value" => &mut config.min_value,
        "max_value" => &mut config.max_value,
        "min_alarm" => &mut config.min_alarm,
        "max_alarm" => &mut config.max_alarm,
        "description" => &mut config.description,
        "label" => &mut config.label,
        "unit" => &mut config.unit,
        "standard_unit" => &mut config.standard_unit,
        "display_unit" => &mut config.display_unit,
        "format" => &mut config.format,
        _ => return,
    };
    *slot = text.to_string();
}

pub struct Command<'a> {
    pub(crate) node: &'a Node,
    pub(crate) leaf: &'a CommandLeaf,
}

impl<'a> Command<'a> {
    pub fn name(&self) -> &str {
        self.node.name()
    }

    pub fn device(&self) -> &str {
        &self.leaf.device
    }

    pub fn info(&self) -> Result<CommandInfo> {
        if let Some(info) = lock(&self.leaf.info).as_ref() {
            return Ok(info.clone());
        }
        let info = self
            .node
            .context()
            .db
            .command_info(&self.leaf.device, self.name())?;
        *lock(&self.leaf.info) = Some(info.clone());
        Ok(info)
    }

    /// The executable descriptor served when the command file is read.
    pub fn script(&self, runner: &str) -> Result<String> {
        Ok(script::render(runner, &self.leaf.device, &self.info()?))
    }

    /// Runs the command. `argument` is parsed according to the input type and
    /// must be absent for commands that take none.
    pub fn invoke(&self, argument: Option<&str>) -> Result<Option<AttrValue>> {
        let info = self.info()?;
        let argument = match (info.in_type, argument) {
            (DataType::Void, None) => None,
            (DataType::Void, Some(_)) => {
                return Err(TangoFsError::InvalidArgument {
                    msg: format!("command {} takes no argument", info.name),
                })
            }
            (in_type, Some(text)) => Some(AttrValue::Scalar(
                parse_scalar(in_type, text).map_err(invalid_argument)?,
            )),
            (in_type, None) => {
                return Err(TangoFsError::InvalidArgument {
                    msg: format!("command {} expects a {} argument", info.name, in_type),
                })
            }
        };
        debug!("command {}/{}: invoking", self.leaf.device, info.name);
        Ok(self
            .node
            .context()
            .db
            .command_inout(&self.leaf.device, &info.name, argument)?)
    }

    pub fn invoke_text(&self, argument: Option<&str>) -> Result<String> {
        Ok(self.invoke(argument)?.map(|v| format_value(&v)).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::Namespace;
    use std::sync::Arc;
    use std::time::Duration;
    use tangofs_db::{DeviceSpec, MemoryDatabase, Scalar};

    const DEV: &str = "sys/tg_test/1";

    fn fixture(debounce: Duration) -> (Arc<MemoryDatabase>, Namespace) {
        let db = Arc::new(MemoryDatabase::new());
        db.insert_device(&DeviceSpec::new(DEV, "TangoTest", "TangoTest/test"));
        db.insert_property(DEV, "Host", &["localhost"]);
        let mut cfg = AttributeConfig::new("ampli");
        cfg.writable = AttrWriteType::ReadWrite;
        db.insert_attribute(
            DEV,
            cfg,
            AttrValue::Scalar(Scalar::Float(1.5)),
            Some(AttrValue::Scalar(Scalar::Float(1.5))),
        );
        db.insert_attribute(
            DEV,
            AttributeConfig::new("state_ro"),
            AttrValue::Spectrum(vec![Scalar::Int(1), Scalar::Int(2)]),
            None,
        );
        db.insert_command(
            DEV,
            CommandInfo::new("DevLong", DataType::Long, DataType::Long),
            None,
        );
        let ns = Namespace::with_options(db.clone(), Some(Duration::from_secs(60)), debounce, '%');
        (db, ns)
    }

    fn device_path(tail: &[&str]) -> Vec<String> {
        let mut path: Vec<String> = ["devices", "sys", "tg_test", "1"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        path.extend(tail.iter().map(|s| s.to_string()));
        path
    }

    #[test]
    fn test_property_value_is_cached_within_ttl() {
        let (db, ns) = fixture(Duration::from_millis(500));
        let node = ns.resolve(&device_path(&["properties", "Host"])).unwrap();
        let prop = node.as_property().unwrap();
        assert_eq!(prop.text().unwrap(), "localhost\n");
        assert_eq!(prop.text().unwrap(), "localhost\n");
        assert_eq!(db.count_of("get_property"), 1);
    }

    #[test]
    fn test_property_set_value_drops_cache() {
        let (db, ns) = fixture(Duration::from_millis(500));
        let node = ns.resolve(&device_path(&["properties", "Host"])).unwrap();
        let prop = node.as_property().unwrap();
        prop.text().unwrap();
        prop.set_text("newhost\n").unwrap();
        assert_eq!(prop.text().unwrap(), "newhost\n");
        assert_eq!(db.count_of("get_property"), 2);
        assert!(prop.last_modified().unwrap().is_some());
    }

    #[test]
    fn test_attribute_reading_debounced() {
        let (db, ns) = fixture(Duration::from_secs(60));
        let node = ns.resolve(&device_path(&["attributes", "ampli"])).unwrap();
        let attr = node.as_attribute().unwrap();
        assert_eq!(attr.field_text("value").unwrap(), "1.5\n");
        assert_eq!(attr.field_text("w_value").unwrap(), "1.5\n");
        assert_eq!(db.count_of("read_attribute"), 1);
    }

    #[test]
    fn test_attribute_reading_without_debounce_rereads() {
        let (db, ns) = fixture(Duration::ZERO);
        let node = ns.resolve(&device_path(&["attributes", "ampli"])).unwrap();
        let attr = node.as_attribute().unwrap();
        attr.reading().unwrap();
        attr.reading().unwrap();
        assert_eq!(db.count_of("read_attribute"), 2);
    }

    #[test]
    fn test_attribute_fields_depend_on_writability() {
        let (_db, ns) = fixture(Duration::ZERO);
        let rw = ns.resolve(&device_path(&["attributes", "ampli"])).unwrap();
        let ro = ns.resolve(&device_path(&["attributes", "state_ro"])).unwrap();
        assert!(rw.as_attribute().unwrap().has_field("w_value").unwrap());
        assert!(!ro.as_attribute().unwrap().has_field("w_value").unwrap());
        assert!(!ro.as_attribute().unwrap().is_field_writable("value").unwrap());
        assert!(ro.as_attribute().unwrap().is_field_writable("unit").unwrap());
        assert!(!ro.as_attribute().unwrap().is_field_writable("data_type").unwrap());
    }

    #[test]
    fn test_attribute_write_value_parses_text() {
        let (db, ns) = fixture(Duration::from_secs(60));
        let node = ns.resolve(&device_path(&["attributes", "ampli"])).unwrap();
        let attr = node.as_attribute().unwrap();
        attr.field_text("value").unwrap();
        attr.write_field("value", "4.25\n").unwrap();
        assert_eq!(attr.field_text("value").unwrap(), "4.25\n");
        assert_eq!(db.count_of("read_attribute"), 2);
    }

    #[test]
    fn test_attribute_write_garbage_is_invalid_argument() {
        let (_db, ns) = fixture(Duration::ZERO);
        let node = ns.resolve(&device_path(&["attributes", "ampli"])).unwrap();
        let err = node
            .as_attribute()
            .unwrap()
            .write_field("value", "not a number")
            .unwrap_err();
        assert_eq!(err.to_errno(), libc::EINVAL);
    }

    #[test]
    fn test_attribute_config_field_roundtrip() {
        let (_db, ns) = fixture(Duration::ZERO);
        let node = ns.resolve(&device_path(&["attributes", "ampli"])).unwrap();
        let attr = node.as_attribute().unwrap();
        attr.write_field("unit", "mm\n").unwrap();
        assert_eq!(attr.field_text("unit").unwrap(), "mm\n");
        assert_eq!(attr.field_text("writable").unwrap(), "READ_WRITE\n");
        assert!(attr.write_field("data_type", "DevLong").is_err());
    }

    #[test]
    fn test_spectrum_value_one_per_line() {
        let (_db, ns) = fixture(Duration::ZERO);
        let node = ns.resolve(&device_path(&["attributes", "state_ro"])).unwrap();
        assert_eq!(node.as_attribute().unwrap().field_text("value").unwrap(), "1\n2\n");
    }

    #[test]
    fn test_command_invoke_parses_argument() {
        let (_db, ns) = fixture(Duration::ZERO);
        let node = ns.resolve(&device_path(&["commands", "DevLong"])).unwrap();
        let cmd = node.as_command().unwrap();
        assert_eq!(cmd.invoke_text(Some("12")).unwrap(), "12\n");
        assert!(cmd.invoke(None).is_err());
        assert_eq!(cmd.invoke(Some("x")).unwrap_err().to_errno(), libc::EINVAL);
    }

    #[test]
    fn test_command_script_names_device() {
        let (_db, ns) = fixture(Duration::ZERO);
        let node = ns.resolve(&device_path(&["commands", "devlong"])).unwrap();
        let script = node.as_command().unwrap().script("tangofs").unwrap();
        assert!(script.contains("sys/tg_test/1"));
        assert!(script.contains("DevLong"));
    }
}
