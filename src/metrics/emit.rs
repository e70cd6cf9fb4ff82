use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use futures::stream::{StreamExt, TryStreamExt};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{Config, TimestampResolution};
use crate::metrics::{MetricObservation, Unit, ENVIRONMENT_DIMENSION};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A metric as handed to the emitter. The unit is still a free-form string
/// here; it is checked against [`Unit`] before anything reaches the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMetric {
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub dimensions: BTreeMap<String, String>,
}

impl From<&MetricObservation> for RawMetric {
    fn from(obs: &MetricObservation) -> Self {
        RawMetric {
            name: obs.name.to_string(),
            value: obs.value,
            unit: obs.unit.to_string(),
            timestamp: obs.timestamp,
            dimensions: obs.dimensions.clone(),
        }
    }
}

/// A validated publish call, exactly what the sink is asked to store.
#[derive(Debug, Clone, PartialEq)]
pub struct PutMetricRequest {
    pub namespace: String,
    pub name: String,
    pub value: f64,
    pub unit: Unit,
    pub timestamp: DateTime<Utc>,
    pub dimensions: BTreeMap<String, String>,
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to publish metric {metric}: {source}")]
    Publish {
        metric: String,
        #[source]
        source: BoxError,
    },
    #[error("failed to read back metric {metric}: {source}")]
    Verify {
        metric: String,
        #[source]
        source: BoxError,
    },
}

/// The external time-series store.
#[async_trait]
pub trait MetricSink: Send + Sync {
    async fn put_metric(&self, request: &PutMetricRequest) -> Result<(), SinkError>;

    /// Reads the point back. `Ok(false)` means the store answered but the
    /// point is not visible (yet).
    async fn verify(&self, request: &PutMetricRequest) -> Result<bool, SinkError>;
}

#[derive(Error, Debug)]
pub enum EmitError {
    #[error("metric {name} value must be finite, got {value}")]
    NonFiniteValue { name: String, value: f64 },
    #[error(transparent)]
    Sink(#[from] SinkError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmitOutcome {
    pub request: PutMetricRequest,
    /// The requested unit was not recognized and `Count` was published instead.
    pub unit_fallback: bool,
    /// `None` when verification is disabled or could not be performed.
    pub verified: Option<bool>,
}

/// Boundary between derived observations and the sink: validation, unit
/// defaulting, the `Environment` dimension, timestamp policy and optional
/// read-back verification.
pub struct Emitter<'a> {
    sink: &'a dyn MetricSink,
    config: &'a Config,
}

impl<'a> Emitter<'a> {
    pub fn new(sink: &'a dyn MetricSink, config: &'a Config) -> Self {
        Emitter { sink, config }
    }

    pub async fn emit(
        &self,
        raw: RawMetric,
        now: DateTime<Utc>,
    ) -> Result<EmitOutcome, EmitError> {
        if !raw.value.is_finite() {
            error!(
                metric = %raw.name,
                value = %raw.value,
                "refusing to publish metric: value must be a finite number"
            );
            return Err(EmitError::NonFiniteValue {
                name: raw.name,
                value: raw.value,
            });
        }

        // Publishing with a default unit beats dropping the point.
        let (unit, unit_fallback) = match raw.unit.parse::<Unit>() {
            Ok(unit) => (unit, false),
            Err(e) => {
                warn!(
                    metric = %raw.name,
                    unit = %raw.unit,
                    error = %e,
                    "unrecognized unit, publishing as Count"
                );
                (Unit::Count, true)
            }
        };

        let mut dimensions = raw.dimensions;
        if let Some(previous) = dimensions.insert(
            ENVIRONMENT_DIMENSION.to_string(),
            self.config.environment.clone(),
        ) {
            if previous != self.config.environment {
                warn!(
                    metric = %raw.name,
                    supplied = %previous,
                    environment = %self.config.environment,
                    "overriding caller supplied Environment dimension"
                );
            }
        }

        let request = PutMetricRequest {
            namespace: self.config.namespace.clone(),
            name: raw.name,
            value: raw.value,
            unit,
            timestamp: truncate_timestamp(
                raw.timestamp.unwrap_or(now),
                self.config.timestamp_resolution,
            ),
            dimensions,
        };

        debug!(?request, "publishing metric");
        self.sink.put_metric(&request).await.inspect_err(|e| {
            error!(metric = %request.name, error = %e, "failed to publish metric");
        })?;
        info!(
            metric = %request.name,
            value = request.value,
            unit = %request.unit,
            namespace = %request.namespace,
            "metric published"
        );

        let verified = if self.config.verify_writes {
            self.verify(&request).await
        } else {
            None
        };

        Ok(EmitOutcome {
            request,
            unit_fallback,
            verified,
        })
    }

    /// Publishes every observation of one event. Points are sent
    /// concurrently and may land in any order; any failure fails the call.
    pub async fn emit_all(
        &self,
        observations: &[MetricObservation],
        now: DateTime<Utc>,
    ) -> Result<Vec<EmitOutcome>, EmitError> {
        let results = futures::stream::iter(observations)
            .map(|obs| self.emit(RawMetric::from(obs), now))
            .buffer_unordered(self.config.emit_concurrency.max(1))
            .inspect_err(|error| error!(?error, "failed to emit metric"))
            .collect::<Vec<_>>()
            .await;

        results.into_iter().collect()
    }

    // Best effort: the point is already written, a failed read never fails the emission.
    async fn verify(&self, request: &PutMetricRequest) -> Option<bool> {
        match self.sink.verify(request).await {
            Ok(true) => {
                debug!(metric = %request.name, "metric verified");
                Some(true)
            }
            Ok(false) => {
                warn!(
                    metric = %request.name,
                    timestamp = %request.timestamp,
                    "metric not visible after publish"
                );
                Some(false)
            }
            Err(e) => {
                warn!(metric = %request.name, error = %e, "could not verify metric");
                None
            }
        }
    }
}

pub fn truncate_timestamp(ts: DateTime<Utc>, resolution: TimestampResolution) -> DateTime<Utc> {
    match resolution {
        TimestampResolution::None => ts,
        TimestampResolution::Second => ts.with_nanosecond(0).unwrap_or(ts),
        TimestampResolution::Minute => ts
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(ts),
    }
}
