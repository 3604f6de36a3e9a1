//! Text conversion of attribute values.
//!
//! Values are rendered one element per line: a scalar is a single line, a
//! spectrum has one line per element, and an image has one line per row with
//! elements separated by spaces. Parsing accepts the same layout back.

use crate::error::{DbError, DbResult};
use crate::types::{AttrDataFormat, AttrValue, DataType, Scalar};

pub fn format_value(value: &AttrValue) -> String {
    let mut out = String::new();
    match value {
        AttrValue::Scalar(s) => {
            out.push_str(&s.to_string());
            out.push('\n');
        }
        AttrValue::Spectrum(items) => {
            for item in items {
                out.push_str(&item.to_string());
                out.push('\n');
            }
        }
        AttrValue::Image(rows) => {
            for row in rows {
                let line: Vec<String> = row.iter().map(|s| s.to_string()).collect();
                out.push_str(&line.join(" "));
                out.push('\n');
            }
        }
    }
    out
}

pub fn parse_scalar(data_type: DataType, text: &str) -> DbResult<Scalar> {
    let text = text.trim();
    match data_type {
        DataType::String => Ok(Scalar::Str(text.to_string())),
        DataType::Boolean => match text.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Scalar::Bool(true)),
            "0" | "false" | "no" | "off" => Ok(Scalar::Bool(false)),
            _ => Err(DbError::invalid_value(format!(
                "'{}' is not a boolean",
                text
            ))),
        },
        t if t.is_unsigned() => text
            .parse::<u64>()
            .ok()
            .and_then(|v| i64::try_from(v).ok())
            .map(Scalar::Int)
            .ok_or_else(|| DbError::invalid_value(format!("'{}' is not a valid {}", text, t))),
        t if t.is_int() => text
            .parse::<i64>()
            .map(Scalar::Int)
            .map_err(|e| DbError::invalid_value(format!("'{}' is not a valid {}: {}", text, t, e))),
        t if t.is_float() => text
            .parse::<f64>()
            .map(Scalar::Float)
            .map_err(|e| DbError::invalid_value(format!("'{}' is not a valid {}: {}", text, t, e))),
        t => Err(DbError::invalid_value(format!(
            "values of type {} cannot be written",
            t
        ))),
    }
}

/// Parses text written to an attribute file into a value of the given shape.
pub fn parse_value(data_type: DataType, format: AttrDataFormat, text: &str) -> DbResult<AttrValue> {
    match format {
        AttrDataFormat::Scalar => parse_scalar(data_type, text).map(AttrValue::Scalar),
        AttrDataFormat::Spectrum => {
            let items = if data_type == DataType::String {
                text.lines()
                    .filter(|l| !l.is_empty())
                    .map(|l| Scalar::Str(l.to_string()))
                    .collect()
            } else {
                text.split_whitespace()
                    .map(|tok| parse_scalar(data_type, tok))
                    .collect::<DbResult<Vec<_>>>()?
            };
            Ok(AttrValue::Spectrum(items))
        }
        AttrDataFormat::Image => {
            let rows = text
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(|line| {
                    line.split_whitespace()
                        .map(|tok| parse_scalar(data_type, tok))
                        .collect::<DbResult<Vec<_>>>()
                })
                .collect::<DbResult<Vec<_>>>()?;
            Ok(AttrValue::Image(rows))
        }
    }
}

/// Property values are stored as a list of lines.
pub fn property_to_text(value: &[String]) -> String {
    let mut text = value.join("\n");
    text.push('\n');
    text
}

pub fn text_to_property(text: &str) -> Vec<String> {
    text.trim().split('\n').map(|l| l.to_string()).collect()
}
