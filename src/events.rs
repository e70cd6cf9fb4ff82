use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Raw event-bus payload. Only `detail-type`, `detail` and `time` are read;
/// the rest of the EventBridge envelope (id, source, account, ...) is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "detail-type", default)]
    pub detail_type: Option<Value>,
    #[serde(default)]
    pub detail: Option<Value>,
    #[serde(default)]
    pub time: Option<Value>,
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum EventType {
    DeploymentStart,
    DeploymentSuccess,
    DeploymentFailure,
    IncidentStart,
    IncidentResolve,
}

impl EventType {
    /// Maps a wire tag to its event type. Tags are matched exactly.
    pub fn from_tag(tag: &str) -> Option<EventType> {
        match tag {
            "deployment_start" => Some(EventType::DeploymentStart),
            "deployment_success" => Some(EventType::DeploymentSuccess),
            "deployment_failure" => Some(EventType::DeploymentFailure),
            "incident_start" => Some(EventType::IncidentStart),
            "incident_resolve" => Some(EventType::IncidentResolve),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            EventType::DeploymentStart => "deployment_start",
            EventType::DeploymentSuccess => "deployment_success",
            EventType::DeploymentFailure => "deployment_failure",
            EventType::IncidentStart => "incident_start",
            EventType::IncidentResolve => "incident_resolve",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStart {
    #[serde(default, deserialize_with = "string_or_number")]
    pub deployment_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSuccess {
    #[serde(default, deserialize_with = "string_or_number")]
    pub commit_time: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub change_start_time: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub deployment_time: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub commit_id: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub branch: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub deployment_id: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub pull_request_number: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentFailure {
    #[serde(default, deserialize_with = "string_or_number")]
    pub deployment_id: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub commit_id: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub severity: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentStart {
    #[serde(default, deserialize_with = "string_or_number")]
    pub incident_id: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub severity: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentResolve {
    #[serde(default, deserialize_with = "string_or_number")]
    pub incident_id: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub start_time: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub resolution_time: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub severity: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub resolution_method: Option<String>,
    #[serde(default)]
    pub impacted_services: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    DeploymentStart(DeploymentStart),
    DeploymentSuccess(DeploymentSuccess),
    DeploymentFailure(DeploymentFailure),
    IncidentStart(IncidentStart),
    IncidentResolve(IncidentResolve),
}

impl EventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            EventKind::DeploymentStart(_) => EventType::DeploymentStart,
            EventKind::DeploymentSuccess(_) => EventType::DeploymentSuccess,
            EventKind::DeploymentFailure(_) => EventType::DeploymentFailure,
            EventKind::IncidentStart(_) => EventType::IncidentStart,
            EventKind::IncidentResolve(_) => EventType::IncidentResolve,
        }
    }
}

/// A validated lifecycle event with typed details.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleEvent {
    pub occurred_at: Option<DateTime<Utc>>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Recognized(LifecycleEvent),
    /// The `detail-type` is not one this handler processes.
    Unrecognized(String),
}

#[derive(Error, Debug, PartialEq)]
#[error("field {field} is not a valid timestamp: {value:?}")]
pub struct TimestampError {
    pub field: &'static str,
    pub value: String,
}

#[derive(Error, Debug)]
pub enum InputError {
    #[error("event has no \"detail-type\"")]
    MissingDetailType,
    #[error("\"detail-type\" must be a string, got {0}")]
    InvalidDetailType(Value),
    #[error("{detail_type} event has no \"detail\"")]
    MissingDetail { detail_type: EventType },
    #[error("{detail_type} event has an invalid \"detail\": {source}")]
    InvalidDetail {
        detail_type: EventType,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    InvalidTimestamp(#[from] TimestampError),
}

/// Validates an envelope and selects the event kind it describes.
///
/// Unrecognized tags are not errors: they come back as
/// [`Classification::Unrecognized`] so the caller can acknowledge and move on.
pub fn classify(envelope: EventEnvelope) -> Result<Classification, InputError> {
    let tag = match envelope.detail_type {
        Some(Value::String(tag)) => tag,
        None | Some(Value::Null) => {
            warn!("rejecting event: missing \"detail-type\"");
            return Err(InputError::MissingDetailType);
        }
        Some(other) => {
            warn!(detail_type = %other, "rejecting event: \"detail-type\" is not a string");
            return Err(InputError::InvalidDetailType(other));
        }
    };

    let Some(event_type) = EventType::from_tag(&tag) else {
        info!(detail_type = %tag, "ignoring unrecognized event type");
        return Ok(Classification::Unrecognized(tag));
    };

    let Some(detail) = envelope.detail.filter(|d| !d.is_null()) else {
        warn!(detail_type = %event_type, "rejecting event: \"detail\" is required");
        return Err(InputError::MissingDetail {
            detail_type: event_type,
        });
    };

    let occurred_at = match envelope.time {
        None | Some(Value::Null) => None,
        Some(Value::String(raw)) => Some(parse_timestamp("time", &raw).inspect_err(|e| {
            warn!(detail_type = %event_type, error = %e, "rejecting event");
        })?),
        Some(other) => {
            let err = TimestampError {
                field: "time",
                value: other.to_string(),
            };
            warn!(detail_type = %event_type, error = %err, "rejecting event");
            return Err(err.into());
        }
    };

    let kind = match event_type {
        EventType::DeploymentStart => EventKind::DeploymentStart(detail_as(event_type, detail)?),
        EventType::DeploymentSuccess => {
            EventKind::DeploymentSuccess(detail_as(event_type, detail)?)
        }
        EventType::DeploymentFailure => {
            EventKind::DeploymentFailure(detail_as(event_type, detail)?)
        }
        EventType::IncidentStart => EventKind::IncidentStart(detail_as(event_type, detail)?),
        EventType::IncidentResolve => EventKind::IncidentResolve(detail_as(event_type, detail)?),
    };
    debug!(?kind, ?occurred_at, "event classified");

    Ok(Classification::Recognized(LifecycleEvent {
        occurred_at,
        kind,
    }))
}

fn detail_as<T: DeserializeOwned>(event_type: EventType, detail: Value) -> Result<T, InputError> {
    serde_json::from_value(detail).map_err(|source| {
        warn!(
            detail_type = %event_type,
            error = %source,
            "rejecting event: invalid \"detail\""
        );
        InputError::InvalidDetail {
            detail_type: event_type,
            source,
        }
    })
}

const NAIVE_DATE_TIME_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"];

/// Parses an RFC 3339 timestamp, epoch milliseconds, or a naive ISO-8601
/// date-time, date-time without seconds, or bare date. Naive forms are taken
/// as UTC; a bare date is UTC midnight.
pub fn parse_timestamp(field: &'static str, raw: &str) -> Result<DateTime<Utc>, TimestampError> {
    let trimmed = raw.trim();
    let invalid = || TimestampError {
        field,
        value: raw.to_string(),
    };

    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in NAIVE_DATE_TIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Ok(Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)));
    }
    if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        let millis = trimmed.parse::<i64>().map_err(|_| invalid())?;
        return Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(invalid);
    }

    Err(invalid())
}

// Producers are not consistent about ids: accept strings or numbers.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(de::Error::custom(format!(
            "expected a string or number, got {other}"
        ))),
    }
}
