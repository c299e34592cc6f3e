//! Remote device access.
//!
//! The detector and the acquisition server are remote device servers reached by name.
//! Everything this crate does with them goes through three primitive operations:
//! read an attribute, write an attribute, invoke a command. Those primitives are the
//! capability traits in [`capabilities`]; the typed drivers in [`lima`] and [`xspress3`]
//! are built on top of them, and [`mock`] provides an in-process simulation of both
//! servers for tests and dry runs.

pub mod capabilities;
pub mod lima;
pub mod mock;
pub mod xspress3;

pub use capabilities::{
    AcquisitionControl, AttributeRead, AttributeWrite, CallTimeout, ChannelReadout, CommandInvoke,
    DeviceProxy,
};
pub use lima::LimaCcd;
pub use xspress3::{DetectorInfo, Xspress3};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Value carried by a remote attribute read/write or a command argument/result.
///
/// Mirrors the scalar and one-dimensional array types the device servers use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    /// No value (commands without argument or result)
    Void,
    Boolean(bool),
    Long(i64),
    Double(f64),
    String(String),
    BooleanArray(Vec<bool>),
    LongArray(Vec<i64>),
    DoubleArray(Vec<f64>),
    StringArray(Vec<String>),
}

impl AttrValue {
    /// Name of the value type, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            AttrValue::Void => "void",
            AttrValue::Boolean(_) => "boolean",
            AttrValue::Long(_) => "long",
            AttrValue::Double(_) => "double",
            AttrValue::String(_) => "string",
            AttrValue::BooleanArray(_) => "boolean array",
            AttrValue::LongArray(_) => "long array",
            AttrValue::DoubleArray(_) => "double array",
            AttrValue::StringArray(_) => "string array",
        }
    }

    /// Interpret as a boolean. Single-element boolean arrays are accepted.
    pub fn as_bool(&self) -> Result<bool> {
        match self {
            AttrValue::Boolean(b) => Ok(*b),
            AttrValue::BooleanArray(v) if v.len() == 1 => Ok(v[0]),
            other => Err(anyhow!("expected boolean, got {}", other.type_name())),
        }
    }

    /// Interpret as an integer.
    pub fn as_i64(&self) -> Result<i64> {
        match self {
            AttrValue::Long(v) => Ok(*v),
            AttrValue::LongArray(v) if v.len() == 1 => Ok(v[0]),
            other => Err(anyhow!("expected long, got {}", other.type_name())),
        }
    }

    /// Interpret as a real number. Integers widen.
    pub fn as_f64(&self) -> Result<f64> {
        match self {
            AttrValue::Double(v) => Ok(*v),
            AttrValue::Long(v) => Ok(*v as f64),
            other => Err(anyhow!("expected double, got {}", other.type_name())),
        }
    }

    /// Interpret as a string.
    pub fn as_str(&self) -> Result<&str> {
        match self {
            AttrValue::String(s) => Ok(s),
            other => Err(anyhow!("expected string, got {}", other.type_name())),
        }
    }

    /// Interpret a numeric array as `f64` values. Long arrays widen.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        match self {
            AttrValue::DoubleArray(v) => Ok(v.clone()),
            AttrValue::LongArray(v) => Ok(v.iter().map(|x| *x as f64).collect()),
            other => Err(anyhow!("expected numeric array, got {}", other.type_name())),
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Void => write!(f, "<void>"),
            AttrValue::Boolean(v) => write!(f, "{v}"),
            AttrValue::Long(v) => write!(f, "{v}"),
            AttrValue::Double(v) => write!(f, "{v}"),
            AttrValue::String(v) => write!(f, "{v:?}"),
            AttrValue::BooleanArray(v) => write!(f, "{v:?}"),
            AttrValue::LongArray(v) => write!(f, "{v:?}"),
            AttrValue::DoubleArray(v) => write!(f, "{v:?}"),
            AttrValue::StringArray(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Boolean(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Long(v)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Double(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::String(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::String(v)
    }
}

impl From<Vec<i64>> for AttrValue {
    fn from(v: Vec<i64>) -> Self {
        AttrValue::LongArray(v)
    }
}

impl From<Vec<f64>> for AttrValue {
    fn from(v: Vec<f64>) -> Self {
        AttrValue::DoubleArray(v)
    }
}
