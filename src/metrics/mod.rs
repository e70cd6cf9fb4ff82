use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod emit;
pub mod rules;

/// Dimension attached to every emitted observation.
pub const ENVIRONMENT_DIMENSION: &str = "Environment";

#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash, PartialOrd, Ord)]
pub enum MetricName {
    DeploymentStart,
    DeploymentFrequency,
    LeadTimeForChanges,
    /// Numerator of the change failure rate; the rate itself is
    /// `DeploymentFailure / DeploymentFrequency` over a period.
    DeploymentFailure,
    IncidentStart,
    IncidentResolve,
    Mttr,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::DeploymentStart => "DeploymentStart",
            MetricName::DeploymentFrequency => "DeploymentFrequency",
            MetricName::LeadTimeForChanges => "LeadTimeForChanges",
            MetricName::DeploymentFailure => "DeploymentFailure",
            MetricName::IncidentStart => "IncidentStart",
            MetricName::IncidentResolve => "IncidentResolve",
            MetricName::Mttr => "MTTR",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Units accepted by the emission adapter.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash)]
pub enum Unit {
    Count,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Percent,
    None,
}

impl Unit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Unit::Count => "Count",
            Unit::Milliseconds => "Milliseconds",
            Unit::Seconds => "Seconds",
            Unit::Minutes => "Minutes",
            Unit::Hours => "Hours",
            Unit::Percent => "Percent",
            Unit::None => "None",
        }
    }

    pub fn is_elapsed_time(&self) -> bool {
        matches!(self, Unit::Seconds | Unit::Minutes | Unit::Hours)
    }

    /// Converts a duration expressed in milliseconds into this unit.
    /// Returns `None` for units that do not measure time.
    pub fn scale_millis(&self, millis: i64) -> Option<f64> {
        let millis = millis as f64;
        match self {
            Unit::Milliseconds => Some(millis),
            Unit::Seconds => Some(millis / 1_000.0),
            Unit::Minutes => Some(millis / 60_000.0),
            Unit::Hours => Some(millis / 3_600_000.0),
            Unit::Count | Unit::Percent | Unit::None => None,
        }
    }
}

impl FromStr for Unit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "Count" => Ok(Unit::Count),
            "Milliseconds" => Ok(Unit::Milliseconds),
            "Seconds" => Ok(Unit::Seconds),
            "Minutes" => Ok(Unit::Minutes),
            "Hours" => Ok(Unit::Hours),
            "Percent" => Ok(Unit::Percent),
            "None" => Ok(Unit::None),
            other => Err(format!("Invalid or unsupported unit {}", other)),
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, PartialEq)]
#[error("metric {name} value must be finite, got {value}")]
pub struct NonFiniteValue {
    pub name: MetricName,
    pub value: f64,
}

/// A single point-in-time numeric observation derived from a lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricObservation {
    pub name: MetricName,
    pub value: f64,
    pub unit: Unit,
    /// `None` means "stamp at emission time".
    pub timestamp: Option<DateTime<Utc>>,
    pub dimensions: BTreeMap<String, String>,
}

impl MetricObservation {
    pub fn new(name: MetricName, value: f64, unit: Unit) -> Result<Self, NonFiniteValue> {
        if !value.is_finite() {
            return Err(NonFiniteValue { name, value });
        }
        Ok(MetricObservation {
            name,
            value,
            unit,
            timestamp: None,
            dimensions: BTreeMap::new(),
        })
    }

    /// A count of one, the shape used by every counter metric.
    pub fn count(name: MetricName) -> Self {
        MetricObservation {
            name,
            value: 1.0,
            unit: Unit::Count,
            timestamp: None,
            dimensions: BTreeMap::new(),
        }
    }

    pub fn with_dimension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(name.into(), value.into());
        self
    }

    pub fn with_optional_dimension(self, name: &str, value: Option<&str>) -> Self {
        match value {
            Some(v) if !v.is_empty() => self.with_dimension(name, v),
            _ => self,
        }
    }

    pub fn dimension(&self, name: &str) -> Option<&str> {
        self.dimensions.get(name).map(String::as_str)
    }
}
