//! Dynamic values carried by event parameters and rule expectations.

use std::borrow::Cow;
use std::collections::BTreeMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

/// A dynamic JSON-shaped value.
///
/// Rule expectations and event parameters may be strings, numbers, booleans,
/// arrays, or nested maps. The exact type is kept until comparison time so
/// that numeric comparisons stay precise; projection to string form happens
/// inside the comparator.
///
/// Conveniently implements `From` conversions for `String`, `&str`, `f64`,
/// and `bool`:
/// ```
/// # use flipkit::DynValue;
/// let s: DynValue = "example".into();
/// let n: DynValue = 42.0.into();
/// let b: DynValue = true.into();
/// ```
#[derive(Debug, Serialize, Deserialize, PartialEq, From, Clone)]
#[serde(untagged)]
pub enum DynValue {
    /// A string value.
    #[from(ignore)]
    String(String),
    /// A numerical value.
    #[from(ignore)]
    Number(f64),
    /// A boolean value.
    #[from(ignore)]
    Boolean(bool),
    /// A homogeneous or mixed list.
    #[from(ignore)]
    Array(Vec<DynValue>),
    /// A nested map. Never produced by the comparator; accepted so that a
    /// host logging structured parameters does not fail document parsing.
    #[from(ignore)]
    Object(BTreeMap<String, DynValue>),
    /// A null value or absence of value.
    Null,
}

impl From<&str> for DynValue {
    fn from(value: &str) -> DynValue {
        DynValue::String(value.to_owned())
    }
}

impl From<String> for DynValue {
    fn from(value: String) -> DynValue {
        DynValue::String(value)
    }
}

impl From<Vec<DynValue>> for DynValue {
    fn from(value: Vec<DynValue>) -> DynValue {
        DynValue::Array(value)
    }
}

impl From<f64> for DynValue {
    fn from(value: f64) -> DynValue {
        DynValue::Number(value)
    }
}

impl From<bool> for DynValue {
    fn from(value: bool) -> DynValue {
        DynValue::Boolean(value)
    }
}

impl DynValue {
    /// The scalar string form of this value, if it has one.
    ///
    /// Numbers with zero fractional part render without a decimal point, so
    /// `3` and `"3"` are indistinguishable under string equality. Arrays,
    /// objects and null have no scalar form.
    pub fn string_form(&self) -> Option<Cow<'_, str>> {
        match self {
            DynValue::String(s) => Some(Cow::Borrowed(s)),
            DynValue::Number(n) => Some(Cow::Owned(number_form(*n))),
            DynValue::Boolean(b) => Some(Cow::Borrowed(if *b { "true" } else { "false" })),
            DynValue::Array(_) | DynValue::Object(_) | DynValue::Null => None,
        }
    }

    /// Numeric projection: numbers directly, strings via parsing.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DynValue::Number(n) => Some(*n),
            DynValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[DynValue]> {
        match self {
            DynValue::Array(items) => Some(items),
            _ => None,
        }
    }
}

/// Canonical string rendering of a JSON number.
pub(crate) fn number_form(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}
