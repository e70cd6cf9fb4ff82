use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::events::{self, Classification, EventEnvelope, InputError};
use crate::metrics::emit::{EmitError, Emitter, MetricSink};
use crate::metrics::rules::{self, DeriveError, RuleContext};

/// Progress of a single event through the handler.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum Stage {
    Received,
    Validated,
    Classified,
    Derived,
    Emitted,
    Completed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("malformed event: {0}")]
    MalformedEvent(#[from] InputError),
    #[error("malformed {detail_type} event: {source}")]
    InvalidEventField {
        detail_type: String,
        #[source]
        source: DeriveError,
    },
    #[error("failed to derive metrics from {detail_type} event: {source}")]
    Derivation {
        detail_type: String,
        #[source]
        source: DeriveError,
    },
    #[error("failed to emit metrics for {detail_type} event: {source}")]
    Emission {
        detail_type: String,
        #[source]
        source: EmitError,
    },
}

impl HandlerError {
    /// The stage the event was in when processing stopped.
    pub fn stage(&self) -> Stage {
        match self {
            HandlerError::MalformedEvent(InputError::MissingDetailType)
            | HandlerError::MalformedEvent(InputError::InvalidDetailType(_)) => Stage::Received,
            HandlerError::MalformedEvent(_) => Stage::Validated,
            HandlerError::InvalidEventField { .. } | HandlerError::Derivation { .. } => {
                Stage::Classified
            }
            HandlerError::Emission { .. } => Stage::Derived,
        }
    }

    /// True when the event itself is at fault; redelivering it cannot succeed.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            HandlerError::MalformedEvent(_) | HandlerError::InvalidEventField { .. }
        )
    }
}

/// Acknowledgment returned to the invoking runtime.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedResponse {
    pub status_code: u16,
    pub message: String,
    pub detail_type: Option<String>,
    pub metrics_emitted: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
}

impl ProcessedResponse {
    fn new(detail_type: Option<String>, metrics_emitted: usize, skipped: Option<String>) -> Self {
        ProcessedResponse {
            status_code: 200,
            message: "Metrics processed successfully".to_string(),
            detail_type,
            metrics_emitted,
            skipped,
        }
    }
}

/// Drives one event through classification, derivation and emission.
pub async fn lifecycle_event(
    sink: &dyn MetricSink,
    config: &Config,
    envelope: EventEnvelope,
    now: DateTime<Utc>,
) -> Result<ProcessedResponse, HandlerError> {
    debug!(stage = %Stage::Received, ?envelope, "processing event");

    let event = match events::classify(envelope)? {
        Classification::Unrecognized(tag) => {
            debug!(stage = %Stage::Completed, detail_type = %tag, "nothing to emit");
            return Ok(ProcessedResponse::new(
                Some(tag),
                0,
                Some("unrecognized event type".to_string()),
            ));
        }
        Classification::Recognized(event) => event,
    };
    let detail_type = event.kind.event_type().tag().to_string();

    if !config.is_production() {
        info!(
            detail_type = %detail_type,
            environment = %config.environment,
            production_environments = %config.production_environments.iter().join(","),
            "not a production environment, skipping metrics"
        );
        return Ok(ProcessedResponse::new(
            Some(detail_type),
            0,
            Some(format!("environment {} is not production", config.environment)),
        ));
    }

    let rule = rules::rule_for(&event.kind);
    debug!(stage = %Stage::Classified, rule = rule.name(), "rule selected");

    let ctx = RuleContext {
        policy: &config.policy,
        occurred_at: event.occurred_at,
        processed_at: now,
    };
    let observations = rule.derive(&ctx).map_err(|source| {
        let detail_type = detail_type.clone();
        if source.is_input_error() {
            warn!(
                detail_type = %detail_type,
                rule = rule.name(),
                error = %source,
                "rejecting event"
            );
            HandlerError::InvalidEventField {
                detail_type,
                source,
            }
        } else {
            error!(
                detail_type = %detail_type,
                rule = rule.name(),
                error = %source,
                "derivation failed"
            );
            HandlerError::Derivation {
                detail_type,
                source,
            }
        }
    })?;
    debug!(stage = %Stage::Derived, count = observations.len(), "observations derived");

    let outcomes = Emitter::new(sink, config)
        .emit_all(&observations, now)
        .await
        .map_err(|source| HandlerError::Emission {
            detail_type: detail_type.clone(),
            source,
        })?;

    let fallbacks = outcomes.iter().filter(|o| o.unit_fallback).count();
    if fallbacks > 0 {
        warn!(
            detail_type = %detail_type,
            fallbacks,
            "some metrics were published with a default unit"
        );
    }
    info!(
        stage = %Stage::Completed,
        detail_type = %detail_type,
        metrics_emitted = outcomes.len(),
        "event processed"
    );

    Ok(ProcessedResponse::new(Some(detail_type), outcomes.len(), None))
}
