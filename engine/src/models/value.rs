//! Dynamically-typed cell values.
//!
//! [`Value`] is the tagged union stored in every row column. Equality is
//! type-homogeneous: `Int(1)` and `Long(1)` are different values and
//! comparing them never fails, it simply answers "not equal".
//!
//! Failed conversions do not raise errors. They produce the
//! [`Value::Error`] variant which carries the stage name, a message and the
//! offending original value, so one bad cell never aborts the pipeline.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde_json::json;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A value in a row column.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Missing value
    Null,
    /// Boolean value
    Boolean(bool),
    /// 32-bit signed integer
    Int(i32),
    /// 64-bit signed integer
    Long(i64),
    /// 32-bit floating point number
    Float(f32),
    /// 64-bit floating point number
    Double(f64),
    /// Arbitrary-precision decimal
    Decimal(Decimal),
    /// UTF-8 string
    String(String),
    /// Date and time without offset
    DateTime(NaiveDateTime),
    /// Date and time with a fixed UTC offset
    DateTimeOffset(DateTime<FixedOffset>),
    /// Time span
    Duration(Duration),
    /// Recoverable per-cell failure
    Error(Box<RowError>),
}

/// A per-cell failure carried inline instead of being thrown.
#[derive(Debug, Clone, PartialEq)]
pub struct RowError {
    /// Name of the stage that produced the error.
    pub stage: String,
    /// Human readable message.
    pub message: String,
    /// The value that could not be processed.
    pub original: Value,
}

impl RowError {
    pub fn new(stage: impl Into<String>, message: impl Into<String>, original: Value) -> Self {
        Self {
            stage: stage.into(),
            message: message.into(),
            original,
        }
    }
}

impl fmt::Display for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} (value: ({}) {})",
            self.stage,
            self.message,
            self.original.type_name(),
            self.original
        )
    }
}

/// The kind of a [`Value`], without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Boolean,
    Int,
    Long,
    Float,
    Double,
    Decimal,
    String,
    DateTime,
    DateTimeOffset,
    Duration,
    Error,
}

impl ValueKind {
    /// Display name used in debug dumps and error messages.
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Null => "Null",
            ValueKind::Boolean => "Boolean",
            ValueKind::Int => "Int",
            ValueKind::Long => "Long",
            ValueKind::Float => "Float",
            ValueKind::Double => "Double",
            ValueKind::Decimal => "Decimal",
            ValueKind::String => "String",
            ValueKind::DateTime => "DateTime",
            ValueKind::DateTimeOffset => "DateTimeOffset",
            ValueKind::Duration => "Duration",
            ValueKind::Error => "RowError",
        }
    }
}

impl FromStr for ValueKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bool" | "boolean" => Ok(ValueKind::Boolean),
            "int" | "int32" => Ok(ValueKind::Int),
            "long" | "int64" => Ok(ValueKind::Long),
            "float" | "float32" => Ok(ValueKind::Float),
            "double" | "float64" => Ok(ValueKind::Double),
            "decimal" | "numeric" => Ok(ValueKind::Decimal),
            "string" | "text" => Ok(ValueKind::String),
            "datetime" | "timestamp" => Ok(ValueKind::DateTime),
            "datetimeoffset" => Ok(ValueKind::DateTimeOffset),
            "duration" => Ok(ValueKind::Duration),
            other => Err(format!("unknown value kind '{}'", other)),
        }
    }
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
    "%Y.%m.%d %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y.%m.%d", "%d.%m.%Y"];

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Boolean(_) => ValueKind::Boolean,
            Value::Int(_) => ValueKind::Int,
            Value::Long(_) => ValueKind::Long,
            Value::Float(_) => ValueKind::Float,
            Value::Double(_) => ValueKind::Double,
            Value::Decimal(_) => ValueKind::Decimal,
            Value::String(_) => ValueKind::String,
            Value::DateTime(_) => ValueKind::DateTime,
            Value::DateTimeOffset(_) => ValueKind::DateTimeOffset,
            Value::Duration(_) => ValueKind::Duration,
            Value::Error(_) => ValueKind::Error,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.kind().name()
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True for null and for the empty string.
    pub fn is_null_or_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            _ => false,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    pub fn as_error(&self) -> Option<&RowError> {
        match self {
            Value::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Value::Int(_) | Value::Long(_) | Value::Float(_) | Value::Double(_) | Value::Decimal(_)
        )
    }

    fn is_integral(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Long(_))
    }

    /// Numeric value as `f64`, `None` for non-numeric kinds.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(f64::from(*i)),
            Value::Long(l) => Some(*l as f64),
            Value::Float(f) => Some(f64::from(*f)),
            Value::Double(d) => Some(*d),
            Value::Decimal(d) => d.to_f64(),
            _ => None,
        }
    }

    /// Integral value as `i64`, `None` for anything but `Int`/`Long`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(i64::from(*i)),
            Value::Long(l) => Some(*l),
            _ => None,
        }
    }

    /// Numeric value as a decimal, `None` for non-numeric or non-finite values.
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Value::Int(i) => Some(Decimal::from(*i)),
            Value::Long(l) => Some(Decimal::from(*l)),
            Value::Float(f) => Decimal::from_f32(*f),
            Value::Double(d) => Decimal::from_f64(*d),
            Value::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    /// Orders two values.
    ///
    /// Values of the same kind compare naturally; numeric kinds also compare
    /// across each other. Everything else (including null) is unordered.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
            (Value::DateTimeOffset(a), Value::DateTimeOffset(b)) => Some(a.cmp(b)),
            (Value::Duration(a), Value::Duration(b)) => Some(a.cmp(b)),
            (a, b) if a.is_integral() && b.is_integral() => {
                Some(a.as_i64()?.cmp(&b.as_i64()?))
            }
            (a, b) if a.is_numeric() && b.is_numeric() => {
                let float_involved = matches!(a, Value::Float(_) | Value::Double(_))
                    || matches!(b, Value::Float(_) | Value::Double(_));
                if float_involved {
                    a.as_f64()?.partial_cmp(&b.as_f64()?)
                } else {
                    Some(a.as_decimal()?.cmp(&b.as_decimal()?))
                }
            }
            _ => None,
        }
    }

    /// Casts the value to another kind.
    ///
    /// Null stays null, empty strings become null for every non-string
    /// target. Error values never cast.
    pub fn cast(&self, kind: ValueKind) -> Result<Value, String> {
        if self.kind() == kind {
            return Ok(self.clone());
        }
        match self {
            Value::Null => return Ok(Value::Null),
            Value::Error(e) => return Err(format!("cannot cast an error value ({})", e.message)),
            _ => {}
        }
        if kind == ValueKind::String {
            return Ok(Value::String(self.to_string()));
        }
        if let Value::String(s) = self {
            return parse_str(s.trim(), kind);
        }

        let fail = || format!("cannot cast {} {} to {}", self.type_name(), self, kind.name());
        match kind {
            ValueKind::Boolean => match self {
                Value::Decimal(d) => Ok(Value::Boolean(!d.is_zero())),
                v if v.is_numeric() => Ok(Value::Boolean(v.as_f64().ok_or_else(fail)? != 0.0)),
                _ => Err(fail()),
            },
            ValueKind::Int => {
                let wide = self.to_i64_lossy().ok_or_else(fail)?;
                i32::try_from(wide).map(Value::Int).map_err(|_| fail())
            }
            ValueKind::Long => self.to_i64_lossy().map(Value::Long).ok_or_else(fail),
            ValueKind::Float => self.to_f64_lossy().map(|f| Value::Float(f as f32)).ok_or_else(fail),
            ValueKind::Double => self.to_f64_lossy().map(Value::Double).ok_or_else(fail),
            ValueKind::Decimal => match self {
                Value::Boolean(b) => Ok(Value::Decimal(Decimal::from(u8::from(*b)))),
                v => v.as_decimal().map(Value::Decimal).ok_or_else(fail),
            },
            ValueKind::DateTime => match self {
                Value::DateTimeOffset(dt) => Ok(Value::DateTime(dt.naive_local())),
                Value::Int(_) | Value::Long(_) => {
                    let secs = self.as_i64().ok_or_else(fail)?;
                    DateTime::from_timestamp(secs, 0)
                        .map(|dt| Value::DateTime(dt.naive_utc()))
                        .ok_or_else(fail)
                }
                _ => Err(fail()),
            },
            ValueKind::DateTimeOffset => match self {
                Value::DateTime(dt) => Ok(Value::DateTimeOffset(dt.and_utc().fixed_offset())),
                _ => Err(fail()),
            },
            ValueKind::Duration => match self {
                Value::Int(_) | Value::Long(_) => {
                    let ms = self.as_i64().ok_or_else(fail)?;
                    Ok(Value::Duration(Duration::try_milliseconds(ms).ok_or_else(fail)?))
                }
                Value::Float(_) | Value::Double(_) => {
                    let ms = self.as_f64().ok_or_else(fail)?.round();
                    // `as` saturates; out-of-range values must fail instead
                    if !ms.is_finite() || ms < i64::MIN as f64 || ms >= i64::MAX as f64 {
                        return Err(fail());
                    }
                    Ok(Value::Duration(Duration::try_milliseconds(ms as i64).ok_or_else(fail)?))
                }
                _ => Err(fail()),
            },
            ValueKind::Null | ValueKind::Error | ValueKind::String => Err(fail()),
        }
    }

    /// Casts the value, turning a failure into a [`Value::Error`] attributed to `stage`.
    pub fn convert(&self, kind: ValueKind, stage: &str) -> Value {
        match self.cast(kind) {
            Ok(v) => v,
            Err(message) => Value::Error(Box::new(RowError::new(stage, message, self.clone()))),
        }
    }

    fn to_i64_lossy(&self) -> Option<i64> {
        match self {
            Value::Boolean(b) => Some(i64::from(*b)),
            Value::Int(_) | Value::Long(_) => self.as_i64(),
            Value::Float(_) | Value::Double(_) => {
                let f = self.as_f64()?;
                (f.is_finite() && f >= i64::MIN as f64 && f <= i64::MAX as f64)
                    .then(|| f.trunc() as i64)
            }
            Value::Decimal(d) => d.trunc().to_i64(),
            _ => None,
        }
    }

    fn to_f64_lossy(&self) -> Option<f64> {
        match self {
            Value::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            v => v.as_f64(),
        }
    }

    /// Renders the value as JSON.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Boolean(b) => json!(b),
            Value::Int(i) => json!(i),
            Value::Long(l) => json!(l),
            Value::Float(f) => float_json(f64::from(*f)),
            Value::Double(d) => float_json(*d),
            Value::Decimal(d) => json!(d.to_string()),
            Value::String(s) => json!(s),
            Value::DateTime(dt) => json!(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            Value::DateTimeOffset(dt) => json!(dt.to_rfc3339()),
            Value::Duration(d) => json!(d.num_milliseconds()),
            Value::Error(e) => json!({
                "error": e.message,
                "stage": e.stage,
                "value": e.original.to_json(),
            }),
        }
    }
}

fn float_json(f: f64) -> serde_json::Value {
    serde_json::Number::from_f64(f)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null)
}

fn parse_str(s: &str, kind: ValueKind) -> Result<Value, String> {
    if s.is_empty() {
        return Ok(Value::Null);
    }
    let fail = || format!("cannot cast '{}' to {}", s, kind.name());
    match kind {
        ValueKind::Boolean => match s.to_lowercase().as_str() {
            "true" | "t" | "1" | "yes" | "y" => Ok(Value::Boolean(true)),
            "false" | "f" | "0" | "no" | "n" => Ok(Value::Boolean(false)),
            _ => Err(fail()),
        },
        ValueKind::Int => s.parse().map(Value::Int).map_err(|_| fail()),
        ValueKind::Long => s.parse().map(Value::Long).map_err(|_| fail()),
        ValueKind::Float => s.parse().map(Value::Float).map_err(|_| fail()),
        ValueKind::Double => s.parse().map(Value::Double).map_err(|_| fail()),
        ValueKind::Decimal => Decimal::from_str(s)
            .or_else(|_| Decimal::from_scientific(s))
            .map(Value::Decimal)
            .map_err(|_| fail()),
        ValueKind::DateTime => parse_datetime(s).map(Value::DateTime).ok_or_else(fail),
        ValueKind::DateTimeOffset => DateTime::parse_from_rfc3339(s)
            .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f %:z"))
            .map(Value::DateTimeOffset)
            .map_err(|_| fail()),
        ValueKind::Duration => s
            .parse::<i64>()
            .ok()
            .and_then(Duration::try_milliseconds)
            .map(Value::Duration)
            .ok_or_else(fail),
        ValueKind::String => Ok(Value::String(s.to_string())),
        ValueKind::Null | ValueKind::Error => Err(fail()),
    }
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    DATETIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|f| NaiveDate::parse_from_str(s, f).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Long(l) => write!(f, "{}", l),
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::String(s) => f.write_str(s),
            Value::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S%.f")),
            Value::DateTimeOffset(dt) => f.write_str(&dt.to_rfc3339()),
            Value::Duration(d) => write!(f, "{}", d),
            Value::Error(e) => write!(f, "#ERROR({})", e),
        }
    }
}

// =============================================================================
// Conversions into Value
// =============================================================================

macro_rules! value_from {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

value_from! {
    bool => Boolean,
    i32 => Int,
    i64 => Long,
    f32 => Float,
    f64 => Double,
    Decimal => Decimal,
    String => String,
    NaiveDateTime => DateTime,
    DateTime<FixedOffset> => DateTimeOffset,
    Duration => Duration,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<RowError> for Value {
    fn from(v: RowError) -> Self {
        Value::Error(Box::new(v))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

// =============================================================================
// Typed reads
// =============================================================================

/// Types that can be read out of a [`Value`] by a typed getter.
///
/// Reads never convert between kinds, except lossless widening of
/// integers and floats.
pub trait FromValue: Sized {
    /// Kind name reported in mismatch errors.
    const EXPECTED: &'static str;

    fn from_value(value: &Value) -> Option<Self>;
}

macro_rules! from_value {
    ($t:ty, $expected:literal, $($pat:pat => $out:expr),+ $(,)?) => {
        impl FromValue for $t {
            const EXPECTED: &'static str = $expected;

            fn from_value(value: &Value) -> Option<Self> {
                match value {
                    $($pat => Some($out),)+
                    _ => None,
                }
            }
        }
    };
}

from_value!(bool, "Boolean", Value::Boolean(b) => *b);
from_value!(i32, "Int", Value::Int(i) => *i);
from_value!(i64, "Long", Value::Int(i) => i64::from(*i), Value::Long(l) => *l);
from_value!(f32, "Float", Value::Float(f) => *f);
from_value!(f64, "Double", Value::Float(f) => f64::from(*f), Value::Double(d) => *d);
from_value!(Decimal, "Decimal", Value::Decimal(d) => *d);
from_value!(String, "String", Value::String(s) => s.clone());
from_value!(NaiveDateTime, "DateTime", Value::DateTime(dt) => *dt);
from_value!(DateTime<FixedOffset>, "DateTimeOffset", Value::DateTimeOffset(dt) => *dt);
from_value!(Duration, "Duration", Value::Duration(d) => *d);
from_value!(RowError, "RowError", Value::Error(e) => (**e).clone());
