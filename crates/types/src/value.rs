//! Typed scalar values carried by fields, sheet cells and input rows.
//!
//! Values deserialize from plain YAML/JSON scalars (`null`, booleans, integers,
//! decimals, strings). Dates never come from untagged scalars; they are produced
//! by parsing text against a declared [`ValueType::Date`].

use std::{cmp::Ordering, fmt};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Declared type of a column or field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    #[default]
    Text,
    Integer,
    Decimal,
    Boolean,
    /// ISO-8601 calendar date (`YYYY-MM-DD`).
    Date,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ValueType::Text => "text",
            ValueType::Integer => "integer",
            ValueType::Decimal => "decimal",
            ValueType::Boolean => "boolean",
            ValueType::Date => "date",
        };
        f.write_str(label)
    }
}

/// Raised when raw text cannot be converted into the declared type.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("'{raw}' is not a valid {value_type}")]
pub struct ValueParseError {
    pub raw: String,
    pub value_type: ValueType,
}

/// A single typed scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Boolean(bool),
    Integer(i64),
    Decimal(f64),
    Text(String),
    Date(NaiveDate),
}

impl Value {
    /// Parses raw text into a value of the given type. Blank text is `Null`.
    pub fn parse(raw: &str, value_type: ValueType) -> Result<Value, ValueParseError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(Value::Null);
        }
        let error = || ValueParseError {
            raw: raw.to_string(),
            value_type,
        };
        match value_type {
            ValueType::Text => Ok(Value::Text(raw.to_string())),
            ValueType::Integer => trimmed.parse::<i64>().map(Value::Integer).map_err(|_| error()),
            ValueType::Decimal => trimmed.parse::<f64>().map(Value::Decimal).map_err(|_| error()),
            ValueType::Boolean => match trimmed.to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(Value::Boolean(true)),
                "false" | "no" | "0" => Ok(Value::Boolean(false)),
                _ => Err(error()),
            },
            ValueType::Date => NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
                .map(Value::Date)
                .map_err(|_| error()),
        }
    }

    /// Type of this value, `None` for `Null`.
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(ValueType::Boolean),
            Value::Integer(_) => Some(ValueType::Integer),
            Value::Decimal(_) => Some(ValueType::Decimal),
            Value::Text(_) => Some(ValueType::Text),
            Value::Date(_) => Some(ValueType::Date),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Boolean interpretation used for step results and conditions.
    ///
    /// Null is false, numbers are true when positive, dates are always true and
    /// text is true when non-empty.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Boolean(flag) => *flag,
            Value::Integer(number) => *number > 0,
            Value::Decimal(number) => *number > 0.0,
            Value::Date(_) => true,
            Value::Text(text) => !text.is_empty(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(number) => Some(*number),
            _ => None,
        }
    }

    /// Numeric view of integer and decimal values.
    pub fn as_decimal(&self) -> Option<f64> {
        match self {
            Value::Integer(number) => Some(*number as f64),
            Value::Decimal(number) => Some(*number),
            _ => None,
        }
    }

    /// Orders two values of compatible types. Integers and decimals compare
    /// numerically; anything else must have the same type. `None` means the
    /// pair is not comparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Integer(left), Value::Integer(right)) => Some(left.cmp(right)),
            (Value::Text(left), Value::Text(right)) => Some(left.cmp(right)),
            (Value::Boolean(left), Value::Boolean(right)) => Some(left.cmp(right)),
            (Value::Date(left), Value::Date(right)) => Some(left.cmp(right)),
            (left, right) => {
                let left = left.as_decimal()?;
                let right = right.as_decimal()?;
                left.partial_cmp(&right)
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Boolean(flag) => write!(f, "{flag}"),
            Value::Integer(number) => write!(f, "{number}"),
            Value::Decimal(number) => write!(f, "{number}"),
            Value::Text(text) => f.write_str(text),
            Value::Date(date) => write!(f, "{}", date.format("%Y-%m-%d")),
        }
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::Text(text.to_string())
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Value::Text(text)
    }
}

impl From<i64> for Value {
    fn from(number: i64) -> Self {
        Value::Integer(number)
    }
}

impl From<f64> for Value {
    fn from(number: f64) -> Self {
        Value::Decimal(number)
    }
}

impl From<bool> for Value {
    fn from(flag: bool) -> Self {
        Value::Boolean(flag)
    }
}

impl From<NaiveDate> for Value {
    fn from(date: NaiveDate) -> Self {
        Value::Date(date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_respects_declared_type() {
        assert_eq!(Value::parse("42", ValueType::Integer).unwrap(), Value::Integer(42));
        assert_eq!(Value::parse(" 2.5 ", ValueType::Decimal).unwrap(), Value::Decimal(2.5));
        assert_eq!(Value::parse("yes", ValueType::Boolean).unwrap(), Value::Boolean(true));
        assert_eq!(Value::parse("", ValueType::Integer).unwrap(), Value::Null);
        assert_eq!(
            Value::parse("2024-02-29", ValueType::Date).unwrap(),
            Value::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap())
        );

        let error = Value::parse("abc", ValueType::Integer).unwrap_err();
        assert_eq!(error.to_string(), "'abc' is not a valid integer");
    }

    #[test]
    fn truthiness_follows_value_kind() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Integer(0).is_truthy());
        assert!(!Value::Integer(-3).is_truthy());
        assert!(Value::Integer(1).is_truthy());
        assert!(Value::from("x").is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(Value::Date(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()).is_truthy());
    }

    #[test]
    fn compare_mixes_integers_and_decimals_only() {
        assert_eq!(Value::Integer(2).compare(&Value::Decimal(2.5)), Some(Ordering::Less));
        assert_eq!(Value::from("b").compare(&Value::from("a")), Some(Ordering::Greater));
        assert_eq!(Value::from("1").compare(&Value::Integer(1)), None);
        assert_eq!(Value::Null.compare(&Value::Integer(1)), None);
    }

    #[test]
    fn untagged_scalars_deserialize_to_expected_variants() {
        let values: Vec<Value> = serde_yaml::from_str("[null, true, 7, 1.5, hello]").unwrap();
        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::Boolean(true),
                Value::Integer(7),
                Value::Decimal(1.5),
                Value::from("hello")
            ]
        );
    }
}
