use std::{fmt, str::FromStr};

use crate::{error::ValueError, time::Timestamp};

/// Type of a resource's value
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RcType {
    Bool,
    Int,
    Float,
    String,
    Time,
}

impl RcType {
    pub fn name(&self) -> &'static str {
        match self {
            RcType::Bool => "bool",
            RcType::Int => "int",
            RcType::Float => "float",
            RcType::String => "string",
            RcType::Time => "time",
        }
    }
}

impl fmt::Display for RcType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RcType {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bool" => Ok(RcType::Bool),
            "int" => Ok(RcType::Int),
            "float" => Ok(RcType::Float),
            "string" => Ok(RcType::String),
            "time" => Ok(RcType::Time),
            _ => Err(ValueError::UnknownType {
                name: s.to_string(),
            }),
        }
    }
}

/// Freshness of a resource's value
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RcState {
    /// Never seen, or contact to the owning host was lost
    Unknown,
    Valid,
    /// A value is present but the driver is still working towards a request
    Busy,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Time(Timestamp),
}

impl Value {
    pub fn rc_type(&self) -> RcType {
        match self {
            Value::Bool(_) => RcType::Bool,
            Value::Int(_) => RcType::Int,
            Value::Float(_) => RcType::Float,
            Value::String(_) => RcType::String,
            Value::Time(_) => RcType::Time,
        }
    }

    pub fn parse(rc_type: RcType, text: &str) -> Result<Self, ValueError> {
        let invalid = || ValueError::InvalidValue {
            rc_type,
            text: text.to_string(),
        };
        match rc_type {
            RcType::Bool => match text {
                "1" | "true" => Ok(Value::Bool(true)),
                "0" | "false" => Ok(Value::Bool(false)),
                _ => Err(invalid()),
            },
            RcType::Int => text.parse().map(Value::Int).map_err(|_| invalid()),
            RcType::Float => text.parse().map(Value::Float).map_err(|_| invalid()),
            RcType::String => Ok(Value::String(text.to_string())),
            RcType::Time => text.parse().map(Value::Time).map_err(|_| invalid()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => f.write_str(if *b { "1" } else { "0" }),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => f.write_str(s),
            Value::Time(t) => write!(f, "{}", t),
        }
    }
}

/// A value together with its state, as stored on resources and delivered
/// to subscribers.
///
/// The string encoding is `?` (unknown), `=<value>` (valid) or `!<value>`
/// (busy). The fan-out layer and the wire protocol only ever handle this
/// encoding; decoding needs the resource type.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueState {
    rc_type: RcType,
    state: RcState,
    value: Option<Value>,
}

impl ValueState {
    pub fn unknown(rc_type: RcType) -> Self {
        Self {
            rc_type,
            state: RcState::Unknown,
            value: None,
        }
    }

    pub fn valid(value: Value) -> Self {
        Self {
            rc_type: value.rc_type(),
            state: RcState::Valid,
            value: Some(value),
        }
    }

    pub fn busy(value: Value) -> Self {
        Self {
            rc_type: value.rc_type(),
            state: RcState::Busy,
            value: Some(value),
        }
    }

    pub fn rc_type(&self) -> RcType {
        self.rc_type
    }

    pub fn state(&self) -> RcState {
        self.state
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn is_known(&self) -> bool {
        self.state != RcState::Unknown
    }

    /// Same type, state `Unknown`.
    pub fn to_unknown(&self) -> Self {
        Self::unknown(self.rc_type)
    }

    pub fn encode(&self) -> String {
        match (&self.state, &self.value) {
            (RcState::Valid, Some(value)) => format!("={}", value),
            (RcState::Busy, Some(value)) => format!("!{}", value),
            _ => "?".to_string(),
        }
    }

    pub fn decode(rc_type: RcType, text: &str) -> Result<Self, ValueError> {
        let mut chars = text.chars();
        match chars.next() {
            Some('?') if text.len() == 1 => Ok(Self::unknown(rc_type)),
            Some('=') => Ok(Self::valid(Value::parse(rc_type, chars.as_str())?)),
            Some('!') => Ok(Self::busy(Value::parse(rc_type, chars.as_str())?)),
            _ => Err(ValueError::InvalidState {
                text: text.to_string(),
            }),
        }
    }
}

impl fmt::Display for ValueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
