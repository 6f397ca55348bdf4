//! Identifier newtypes and host value types shared across the bridge.

use duckdb::types::{ToSql, ToSqlOutput, Value as DuckValue};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> duckdb::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::Owned(DuckValue::BigInt(self.0)))
            }
        }
    };
}

id_type!(
    /// Host-owned generator identifier.
    GeneratorId
);
id_type!(
    /// Host-owned population identifier.
    PopulationId
);
id_type!(
    /// Host column number of a population variable.
    ColNo
);
id_type!(
    /// Host row identifier (1-based).
    RowId
);
id_type!(
    /// Model number within a generator's ensemble.
    ModelNo
);
id_type!(
    /// Column cluster ("kind") index within one model.
    KindId
);
id_type!(
    /// Row cluster index within one kind.
    PartitionId
);
id_type!(
    /// Engine-internal 0-based column position.
    Rank
);

impl Rank {
    /// Position in a rank-ordered row.
    pub fn index(self) -> Result<usize> {
        usize::try_from(self.0).map_err(|_| Error::InvalidPartition(format!("negative column rank {}", self.0)))
    }
}

/// A value stored in, or supplied to, the host database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Interpret the value as a real number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Null => None,
            Value::Integer(v) => Some(*v as f64),
            Value::Real(v) => Some(*v),
            Value::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Render the value the way the engine's tabular format expects it.
    /// NULL renders as the empty string.
    pub fn to_field(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Integer(v) => v.to_string(),
            Value::Real(v) => v.to_string(),
            Value::Text(s) => s.clone(),
        }
    }

    pub(crate) fn from_duckdb(value: DuckValue) -> Result<Self> {
        fn out_of_range(v: impl fmt::Display) -> Error {
            Error::InvalidArgument(format!("integer {v} out of range"))
        }

        Ok(match value {
            DuckValue::Null => Value::Null,
            DuckValue::Boolean(b) => Value::Integer(i64::from(b)),
            DuckValue::TinyInt(v) => Value::Integer(v.into()),
            DuckValue::SmallInt(v) => Value::Integer(v.into()),
            DuckValue::Int(v) => Value::Integer(v.into()),
            DuckValue::BigInt(v) => Value::Integer(v),
            DuckValue::HugeInt(v) => Value::Integer(i64::try_from(v).map_err(|_| out_of_range(v))?),
            DuckValue::UTinyInt(v) => Value::Integer(v.into()),
            DuckValue::USmallInt(v) => Value::Integer(v.into()),
            DuckValue::UInt(v) => Value::Integer(v.into()),
            DuckValue::UBigInt(v) => Value::Integer(i64::try_from(v).map_err(|_| out_of_range(v))?),
            DuckValue::Float(v) => Value::Real(v.into()),
            DuckValue::Double(v) => Value::Real(v),
            // Decimals render exactly; the engine only sees reals.
            DuckValue::Decimal(d) => {
                let text = d.to_string();
                Value::Real(text.parse().map_err(|_| {
                    Error::InvalidArgument(format!("decimal {text} is not a real number"))
                })?)
            }
            DuckValue::Text(s) | DuckValue::Enum(s) => Value::Text(s),
            DuckValue::Date32(days) => Value::Text(temporal::date(days)?),
            DuckValue::Timestamp(unit, v) => Value::Text(temporal::timestamp(unit.to_micros(v))?),
            DuckValue::Time64(unit, v) => Value::Text(temporal::time(unit.to_micros(v))?),
            other => {
                return Err(Error::InvalidArgument(format!(
                    "unsupported host value type: {other:?}"
                )))
            }
        })
    }
}

/// Temporal host values, rendered as ISO-8601 text.
mod temporal {
    use chrono::{DateTime, NaiveTime};

    use crate::error::{Error, Result};

    const MICROS_PER_DAY: i64 = 86_400_000_000;

    fn out_of_range(what: &str, v: i64) -> Error {
        Error::InvalidArgument(format!("{what} {v} out of range"))
    }

    pub fn date(days: i32) -> Result<String> {
        DateTime::from_timestamp(i64::from(days) * 86_400, 0)
            .map(|dt| dt.date_naive().format("%Y-%m-%d").to_string())
            .ok_or_else(|| out_of_range("date", days.into()))
    }

    pub fn timestamp(micros: i64) -> Result<String> {
        DateTime::from_timestamp_micros(micros)
            .map(|dt| dt.naive_utc().format("%Y-%m-%d %H:%M:%S%.f").to_string())
            .ok_or_else(|| out_of_range("timestamp", micros))
    }

    pub fn time(micros: i64) -> Result<String> {
        if !(0..MICROS_PER_DAY).contains(&micros) {
            return Err(out_of_range("time", micros));
        }
        let secs = (micros / 1_000_000) as u32;
        let nanos = (micros % 1_000_000) as u32 * 1_000;
        NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
            .map(|t| t.format("%H:%M:%S%.f").to_string())
            .ok_or_else(|| out_of_range("time", micros))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            other => write!(f, "{}", other.to_field()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> duckdb::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Owned(match self {
            Value::Null => DuckValue::Null,
            Value::Integer(v) => DuckValue::BigInt(*v),
            Value::Real(v) => DuckValue::Double(*v),
            Value::Text(s) => DuckValue::Text(s.clone()),
        }))
    }
}

/// Coarse value domain a statistical type maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    Real,
    Text,
}

/// Declared statistical type of a population variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatType {
    Numerical,
    Cyclic,
    Counts,
    Boolean,
    Categorical,
    Nominal,
    UnboundedCategorical,
}

impl StatType {
    pub fn affinity(self) -> Affinity {
        match self {
            StatType::Numerical | StatType::Cyclic | StatType::Counts | StatType::Boolean => {
                Affinity::Real
            }
            StatType::Categorical | StatType::Nominal | StatType::UnboundedCategorical => {
                Affinity::Text
            }
        }
    }

    /// Whether imputation should use the mode rather than the mean.
    pub fn is_categorical(self) -> bool {
        matches!(
            self,
            StatType::Categorical | StatType::Nominal | StatType::UnboundedCategorical
        )
    }

    /// Name of the engine's component model for this type.
    pub fn engine_model(self) -> &'static str {
        match self {
            StatType::UnboundedCategorical => "dpd",
            StatType::Counts => "gp",
            StatType::Boolean => "bb",
            StatType::Categorical | StatType::Nominal => "dd",
            StatType::Cyclic | StatType::Numerical => "nich",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StatType::Numerical => "numerical",
            StatType::Cyclic => "cyclic",
            StatType::Counts => "counts",
            StatType::Boolean => "boolean",
            StatType::Categorical => "categorical",
            StatType::Nominal => "nominal",
            StatType::UnboundedCategorical => "unboundedcategorical",
        }
    }
}

impl FromStr for StatType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "numerical" => Ok(StatType::Numerical),
            "cyclic" => Ok(StatType::Cyclic),
            "counts" => Ok(StatType::Counts),
            "boolean" => Ok(StatType::Boolean),
            "categorical" => Ok(StatType::Categorical),
            "nominal" => Ok(StatType::Nominal),
            "unboundedcategorical" => Ok(StatType::UnboundedCategorical),
            other => Err(Error::InvalidArgument(format!("unknown statistical type: {other}"))),
        }
    }
}

impl fmt::Display for StatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
