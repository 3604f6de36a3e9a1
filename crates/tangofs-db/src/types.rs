//! Data types exchanged with the control system.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Registration data of one device as stored in the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub class_name: String,
    /// Full server name, `executable/instance`.
    pub server: String,
    pub exported: bool,
    /// Start date as reported by the database, free-form.
    pub started_date: Option<String>,
}

impl DeviceInfo {
    /// Splits the full server name into executable and instance.
    pub fn server_parts(&self) -> Option<(&str, &str)> {
        self.server.split_once('/')
    }
}

/// A device to register with `add_server` / `add_device`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub name: String,
    pub class_name: String,
    pub server: String,
}

impl DeviceSpec {
    pub fn new(
        name: impl Into<String>,
        class_name: impl Into<String>,
        server: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            class_name: class_name.into(),
            server: server.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyHistoryEntry {
    /// `dd/mm/YYYY HH:MM:SS`
    pub date: String,
    pub value: Vec<String>,
    pub deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AttrWriteType {
    #[default]
    Read,
    ReadWithWrite,
    Write,
    ReadWrite,
}

impl AttrWriteType {
    pub fn is_writable(&self) -> bool {
        !matches!(self, AttrWriteType::Read)
    }
}

impl fmt::Display for AttrWriteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttrWriteType::Read => "READ",
            AttrWriteType::ReadWithWrite => "READ_WITH_WRITE",
            AttrWriteType::Write => "WRITE",
            AttrWriteType::ReadWrite => "READ_WRITE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AttrDataFormat {
    #[default]
    Scalar,
    Spectrum,
    Image,
}

impl fmt::Display for AttrDataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttrDataFormat::Scalar => "SCALAR",
            AttrDataFormat::Spectrum => "SPECTRUM",
            AttrDataFormat::Image => "IMAGE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DispLevel {
    #[default]
    Operator,
    Expert,
}

impl fmt::Display for DispLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispLevel::Operator => f.write_str("OPERATOR"),
            DispLevel::Expert => f.write_str("EXPERT"),
        }
    }
}

/// Tango argument types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DataType {
    Void,
    Boolean,
    Short,
    Long,
    Long64,
    UChar,
    UShort,
    ULong,
    ULong64,
    Float,
    #[default]
    Double,
    String,
    State,
}

impl DataType {
    pub fn is_int(&self) -> bool {
        matches!(self, DataType::Short | DataType::Long | DataType::Long64) || self.is_unsigned()
    }

    pub fn is_unsigned(&self) -> bool {
        matches!(
            self,
            DataType::UChar | DataType::UShort | DataType::ULong | DataType::ULong64
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::Float | DataType::Double)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::Void => "DevVoid",
            DataType::Boolean => "DevBoolean",
            DataType::Short => "DevShort",
            DataType::Long => "DevLong",
            DataType::Long64 => "DevLong64",
            DataType::UChar => "DevUChar",
            DataType::UShort => "DevUShort",
            DataType::ULong => "DevULong",
            DataType::ULong64 => "DevULong64",
            DataType::Float => "DevFloat",
            DataType::Double => "DevDouble",
            DataType::String => "DevString",
            DataType::State => "DevState",
        };
        f.write_str(s)
    }
}

/// Static description of an attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributeConfig {
    pub name: String,
    pub writable: AttrWriteType,
    pub data_type: DataType,
    pub data_format: AttrDataFormat,
    pub disp_level: DispLevel,
    pub max_dim_x: u32,
    pub max_dim_y: u32,
    pub min_value: String,
    pub max_value: String,
    pub min_alarm: String,
    pub max_alarm: String,
    pub description: String,
    pub label: String,
    pub unit: String,
    pub standard_unit: String,
    pub display_unit: String,
    pub format: String,
}

impl Default for AttributeConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            writable: AttrWriteType::Read,
            data_type: DataType::Double,
            data_format: AttrDataFormat::Scalar,
            disp_level: DispLevel::Operator,
            max_dim_x: 1,
            max_dim_y: 0,
            min_value: "Not specified".to_string(),
            max_value: "Not specified".to_string(),
            min_alarm: "Not specified".to_string(),
            max_alarm: "Not specified".to_string(),
            description: "No description".to_string(),
            label: String::new(),
            unit: String::new(),
            standard_unit: "No standard unit".to_string(),
            display_unit: "No display unit".to_string(),
            format: "%6.2f".to_string(),
        }
    }
}

impl AttributeConfig {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            ..Default::default()
        }
    }
}

/// A single element of an attribute or command value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(true) => f.write_str("True"),
            Scalar::Bool(false) => f.write_str("False"),
            Scalar::Int(i) => write!(f, "{}", i),
            Scalar::Float(x) => write!(f, "{:?}", x),
            Scalar::Str(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Scalar(Scalar),
    Spectrum(Vec<Scalar>),
    Image(Vec<Vec<Scalar>>),
}

impl AttrValue {
    pub fn format(&self) -> AttrDataFormat {
        match self {
            AttrValue::Scalar(_) => AttrDataFormat::Scalar,
            AttrValue::Spectrum(_) => AttrDataFormat::Spectrum,
            AttrValue::Image(_) => AttrDataFormat::Image,
        }
    }
}

/// Result of one `read_attribute` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeReading {
    pub value: AttrValue,
    pub w_value: Option<AttrValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInfo {
    pub name: String,
    pub in_type: DataType,
    pub out_type: DataType,
    #[serde(default)]
    pub in_desc: String,
    #[serde(default)]
    pub out_desc: String,
}

impl CommandInfo {
    pub fn new(name: impl Into<String>, in_type: DataType, out_type: DataType) -> Self {
        Self {
            name: name.into(),
            in_type,
            out_type,
            in_desc: "Uninitialised".to_string(),
            out_desc: "Uninitialised".to_string(),
        }
    }
}
