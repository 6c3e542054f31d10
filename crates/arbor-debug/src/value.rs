//! Guest values exposed to the debugger.

use std::fmt;
use std::sync::Arc;

use smol_str::SmolStr;

use crate::source::SourceSection;

/// Guest value as seen through the marshalling boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(SmolStr),
    /// Opaque guest heap object identified by the host.
    Object { id: u64, display: SmolStr },
}

impl Value {
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Render the value the way a debugger UI would show it.
    #[must_use]
    pub fn to_display_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Bool(value) => write!(f, "{value}"),
            Value::Int(value) => write!(f, "{value}"),
            Value::Float(value) => write!(f, "{value}"),
            Value::String(value) => f.write_str(value),
            Value::Object { display, .. } => f.write_str(display),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.into())
    }
}

/// An in-flight guest exception.
///
/// Exceptions are shared as `Arc<GuestException>`; the allocation identity is
/// the exception identity used for de-duplicating exception breakpoints.
#[derive(Debug)]
pub struct GuestException {
    value: Value,
    message: SmolStr,
    throw_location: Option<SourceSection>,
}

impl GuestException {
    #[must_use]
    pub fn new(value: Value, message: impl Into<SmolStr>) -> Arc<Self> {
        Arc::new(Self {
            value,
            message: message.into(),
            throw_location: None,
        })
    }

    #[must_use]
    pub fn thrown_at(value: Value, message: impl Into<SmolStr>, location: SourceSection) -> Arc<Self> {
        Arc::new(Self {
            value,
            message: message.into(),
            throw_location: Some(location),
        })
    }

    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn throw_location(&self) -> Option<&SourceSection> {
        self.throw_location.as_ref()
    }
}

impl fmt::Display for GuestException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}
