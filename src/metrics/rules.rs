use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{error, info};

use crate::config::MetricPolicy;
use crate::events::{
    parse_timestamp, DeploymentFailure, DeploymentStart, DeploymentSuccess, EventKind,
    IncidentResolve, IncidentStart, TimestampError,
};
use crate::metrics::{MetricName, MetricObservation, NonFiniteValue, Unit};

pub const DEPLOYMENT_ID: &str = "DeploymentId";
pub const INCIDENT_ID: &str = "IncidentId";
pub const SEVERITY: &str = "Severity";

/// Inputs every rule may need besides the event detail itself.
#[derive(Debug, Clone, Copy)]
pub struct RuleContext<'a> {
    pub policy: &'a MetricPolicy,
    /// Envelope `time`, when the producer supplied one.
    pub occurred_at: Option<DateTime<Utc>>,
    /// Wall-clock time of this invocation.
    pub processed_at: DateTime<Utc>,
}

#[derive(Error, Debug, PartialEq)]
pub enum DeriveError {
    #[error("required field {field} is missing")]
    MissingField { field: &'static str },
    #[error(transparent)]
    InvalidTimestamp(#[from] TimestampError),
    #[error("{metric} elapsed time is negative: {start_field}={start} is after {end_field}={end}")]
    NegativeElapsed {
        metric: MetricName,
        start_field: &'static str,
        start: DateTime<Utc>,
        end_field: &'static str,
        end: DateTime<Utc>,
    },
    #[error("{metric} is an elapsed-time metric but is configured with unit {unit}")]
    UnitNotElapsed { metric: MetricName, unit: Unit },
    #[error(transparent)]
    NonFinite(#[from] NonFiniteValue),
}

impl DeriveError {
    /// Errors caused by the event content rather than by the computation.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            DeriveError::MissingField { .. } | DeriveError::InvalidTimestamp(_)
        )
    }
}

/// Maps one kind of lifecycle event to the observations it produces.
pub trait MetricRule {
    fn name(&self) -> &'static str;

    fn derive(&self, ctx: &RuleContext) -> Result<Vec<MetricObservation>, DeriveError>;
}

/// Selects the rule for a classified event. Every event kind has exactly one.
pub fn rule_for(kind: &EventKind) -> &dyn MetricRule {
    match kind {
        EventKind::DeploymentStart(detail) => detail,
        EventKind::DeploymentSuccess(detail) => detail,
        EventKind::DeploymentFailure(detail) => detail,
        EventKind::IncidentStart(detail) => detail,
        EventKind::IncidentResolve(detail) => detail,
    }
}

impl MetricRule for DeploymentStart {
    fn name(&self) -> &'static str {
        "DeploymentStart"
    }

    fn derive(&self, _: &RuleContext) -> Result<Vec<MetricObservation>, DeriveError> {
        let deployment_id = required("deploymentId", &self.deployment_id)?;
        Ok(vec![MetricObservation::count(MetricName::DeploymentStart)
            .with_dimension(DEPLOYMENT_ID, deployment_id)])
    }
}

impl MetricRule for DeploymentSuccess {
    fn name(&self) -> &'static str {
        "DeploymentSuccess"
    }

    fn derive(&self, ctx: &RuleContext) -> Result<Vec<MetricObservation>, DeriveError> {
        let commit = match (&self.commit_time, &self.change_start_time) {
            (Some(raw), _) if !raw.is_empty() => {
                ("commitTime", parse_timestamp("commitTime", raw)?)
            }
            (_, Some(raw)) if !raw.is_empty() => (
                "changeStartTime",
                parse_timestamp("changeStartTime", raw)?,
            ),
            _ => return Err(DeriveError::MissingField { field: "commitTime" }),
        };
        let deploy = end_time("deploymentTime", self.deployment_time.as_deref(), ctx)?;

        let lead_time = elapsed(
            MetricName::LeadTimeForChanges,
            ctx.policy.lead_time_unit,
            commit,
            deploy,
        )
        .inspect_err(|e| {
            error!(
                error = %e,
                commit_time = ?self.commit_time,
                change_start_time = ?self.change_start_time,
                deployment_time = ?self.deployment_time,
                event_time = ?ctx.occurred_at,
                "failed to derive lead time for changes"
            )
        })?;

        info!(
            lead_time = lead_time.value,
            unit = %lead_time.unit,
            commit_id = ?self.commit_id,
            branch = ?self.branch,
            deployment_id = ?self.deployment_id,
            pull_request = ?self.pull_request_number,
            "deployment succeeded"
        );

        Ok(vec![
            MetricObservation::count(MetricName::DeploymentFrequency),
            lead_time,
        ])
    }
}

impl MetricRule for DeploymentFailure {
    fn name(&self) -> &'static str {
        "DeploymentFailure"
    }

    fn derive(&self, _: &RuleContext) -> Result<Vec<MetricObservation>, DeriveError> {
        let deployment_id = required("deploymentId", &self.deployment_id)?;
        info!(
            deployment_id,
            commit_id = ?self.commit_id,
            severity = ?self.severity,
            "deployment failed, opening incident"
        );

        // A failed deployment is also the start of an incident, keyed by the
        // deployment so the matching incident_resolve can close it.
        Ok(vec![
            MetricObservation::count(MetricName::DeploymentFailure)
                .with_dimension(DEPLOYMENT_ID, deployment_id)
                .with_optional_dimension(SEVERITY, self.severity.as_deref()),
            MetricObservation::count(MetricName::IncidentStart)
                .with_dimension(INCIDENT_ID, deployment_id),
        ])
    }
}

impl MetricRule for IncidentStart {
    fn name(&self) -> &'static str {
        "IncidentStart"
    }

    fn derive(&self, _: &RuleContext) -> Result<Vec<MetricObservation>, DeriveError> {
        let incident_id = required("incidentId", &self.incident_id)?;
        info!(incident_id, severity = ?self.severity, "incident started");
        Ok(vec![MetricObservation::count(MetricName::IncidentStart)
            .with_dimension(INCIDENT_ID, incident_id)])
    }
}

impl MetricRule for IncidentResolve {
    fn name(&self) -> &'static str {
        "IncidentResolve"
    }

    fn derive(&self, ctx: &RuleContext) -> Result<Vec<MetricObservation>, DeriveError> {
        let incident_id = required("incidentId", &self.incident_id)?;
        let start_raw = required("startTime", &self.start_time)?;
        let start = ("startTime", parse_timestamp("startTime", start_raw)?);
        let resolved = end_time("resolutionTime", self.resolution_time.as_deref(), ctx)?;

        let mttr = elapsed(MetricName::Mttr, ctx.policy.mttr_unit, start, resolved)
            .inspect_err(|e| {
                error!(
                    error = %e,
                    incident_id,
                    start_time = start_raw,
                    resolution_time = ?self.resolution_time,
                    event_time = ?ctx.occurred_at,
                    "failed to derive time to recovery"
                )
            })?;

        info!(
            incident_id,
            recovery_time = mttr.value,
            unit = %mttr.unit,
            severity = ?self.severity,
            resolution_method = ?self.resolution_method,
            impacted_services = ?self.impacted_services,
            "incident resolved"
        );

        Ok(vec![
            mttr.with_dimension(INCIDENT_ID, incident_id)
                .with_optional_dimension(SEVERITY, self.severity.as_deref()),
            MetricObservation::count(MetricName::IncidentResolve)
                .with_dimension(INCIDENT_ID, incident_id),
        ])
    }
}

fn required<'a>(field: &'static str, value: &'a Option<String>) -> Result<&'a str, DeriveError> {
    match value.as_deref() {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(DeriveError::MissingField { field }),
    }
}

/// The end of an elapsed interval: the detail field when present, then the
/// envelope time, then the processing time.
fn end_time(
    field: &'static str,
    raw: Option<&str>,
    ctx: &RuleContext,
) -> Result<(&'static str, DateTime<Utc>), DeriveError> {
    if let Some(raw) = raw.filter(|r| !r.is_empty()) {
        return Ok((field, parse_timestamp(field, raw)?));
    }
    match ctx.occurred_at {
        Some(time) => Ok(("time", time)),
        None => Ok(("processedAt", ctx.processed_at)),
    }
}

fn elapsed(
    metric: MetricName,
    unit: Unit,
    (start_field, start): (&'static str, DateTime<Utc>),
    (end_field, end): (&'static str, DateTime<Utc>),
) -> Result<MetricObservation, DeriveError> {
    let millis = (end - start).num_milliseconds();
    if millis < 0 {
        return Err(DeriveError::NegativeElapsed {
            metric,
            start_field,
            start,
            end_field,
            end,
        });
    }
    let value = unit
        .scale_millis(millis)
        .ok_or(DeriveError::UnitNotElapsed { metric, unit })?;
    Ok(MetricObservation::new(metric, value, unit)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
    }

    fn ctx(policy: &MetricPolicy, occurred_at: Option<DateTime<Utc>>) -> RuleContext<'_> {
        RuleContext {
            policy,
            occurred_at,
            processed_at: ts(12, 0, 0),
        }
    }

    #[test]
    fn test_deployment_success_emits_frequency_and_lead_time() {
        let policy = MetricPolicy::default();
        let detail = DeploymentSuccess {
            commit_time: Some("2024-01-01T00:00:00Z".to_string()),
            ..Default::default()
        };
        let observations = detail.derive(&ctx(&policy, Some(ts(0, 10, 0)))).unwrap();
        assert_eq!(observations.len(), 2);
        assert_eq!(observations[0].name, MetricName::DeploymentFrequency);
        assert_eq!(observations[0].value, 1.0);
        assert_eq!(observations[0].unit, Unit::Count);
        assert_eq!(observations[1].name, MetricName::LeadTimeForChanges);
        assert_eq!(observations[1].value, 600.0);
        assert_eq!(observations[1].unit, Unit::Seconds);
    }

    #[test]
    fn test_lead_time_prefers_deployment_time_and_change_start() {
        let policy = MetricPolicy {
            lead_time_unit: Unit::Minutes,
            ..Default::default()
        };
        let detail = DeploymentSuccess {
            change_start_time: Some("2024-01-01T00:00:00Z".to_string()),
            deployment_time: Some("2024-01-01T00:30:00Z".to_string()),
            ..Default::default()
        };
        let observations = detail.derive(&ctx(&policy, Some(ts(1, 0, 0)))).unwrap();
        assert_eq!(observations[1].value, 30.0);
        assert_eq!(observations[1].unit, Unit::Minutes);
    }

    #[test]
    fn test_lead_time_falls_back_to_processing_time() {
        let policy = MetricPolicy::default();
        let detail = DeploymentSuccess {
            commit_time: Some("2024-01-01T11:00:00Z".to_string()),
            ..Default::default()
        };
        let observations = detail.derive(&ctx(&policy, None)).unwrap();
        assert_eq!(observations[1].value, 3600.0);
    }

    #[test]
    fn test_commit_after_deploy_is_rejected() {
        let policy = MetricPolicy::default();
        let detail = DeploymentSuccess {
            commit_time: Some("2024-01-02T00:00:00Z".to_string()),
            ..Default::default()
        };
        let err = detail.derive(&ctx(&policy, Some(ts(0, 0, 0)))).unwrap_err();
        assert!(matches!(
            err,
            DeriveError::NegativeElapsed {
                metric: MetricName::LeadTimeForChanges,
                start_field: "commitTime",
                end_field: "time",
                ..
            }
        ));
        assert!(!err.is_input_error());
    }

    #[test]
    fn test_missing_and_invalid_commit_time() {
        let policy = MetricPolicy::default();
        let err = DeploymentSuccess::default()
            .derive(&ctx(&policy, None))
            .unwrap_err();
        assert_eq!(err, DeriveError::MissingField { field: "commitTime" });
        assert!(err.is_input_error());

        let detail = DeploymentSuccess {
            commit_time: Some("last tuesday".to_string()),
            ..Default::default()
        };
        let err = detail.derive(&ctx(&policy, None)).unwrap_err();
        assert_eq!(
            err,
            DeriveError::InvalidTimestamp(TimestampError {
                field: "commitTime",
                value: "last tuesday".to_string()
            })
        );
    }

    #[test]
    fn test_deployment_failure_opens_incident() {
        let policy = MetricPolicy::default();
        let detail = DeploymentFailure {
            deployment_id: Some("d-9".to_string()),
            commit_id: Some("abc".to_string()),
            severity: Some("high".to_string()),
        };
        let observations = detail.derive(&ctx(&policy, None)).unwrap();
        assert_eq!(observations.len(), 2);
        assert_eq!(observations[0].name, MetricName::DeploymentFailure);
        assert_eq!(observations[0].dimension(DEPLOYMENT_ID), Some("d-9"));
        assert_eq!(observations[0].dimension(SEVERITY), Some("high"));
        assert_eq!(observations[1].name, MetricName::IncidentStart);
        assert_eq!(observations[1].dimension(INCIDENT_ID), Some("d-9"));
    }

    #[test]
    fn test_deployment_failure_requires_deployment_id() {
        let policy = MetricPolicy::default();
        let err = DeploymentFailure::default()
            .derive(&ctx(&policy, None))
            .unwrap_err();
        assert_eq!(err, DeriveError::MissingField { field: "deploymentId" });
    }

    #[test]
    fn test_incident_resolve_emits_mttr() {
        let policy = MetricPolicy::default();
        let detail = IncidentResolve {
            incident_id: Some("INC1".to_string()),
            start_time: Some("2024-01-01T00:00:00Z".to_string()),
            ..Default::default()
        };
        let observations = detail.derive(&ctx(&policy, Some(ts(0, 5, 0)))).unwrap();
        let mttr = &observations[0];
        assert_eq!(mttr.name, MetricName::Mttr);
        assert_eq!(mttr.value, 5.0);
        assert_eq!(mttr.unit, Unit::Minutes);
        assert_eq!(mttr.dimension(INCIDENT_ID), Some("INC1"));
        assert_eq!(observations[1].name, MetricName::IncidentResolve);
    }

    #[test]
    fn test_incident_resolve_uses_resolution_time() {
        let policy = MetricPolicy {
            mttr_unit: Unit::Hours,
            ..Default::default()
        };
        let detail = IncidentResolve {
            incident_id: Some("INC2".to_string()),
            start_time: Some("2024-01-01T00:00:00Z".to_string()),
            resolution_time: Some("2024-01-01T03:00:00Z".to_string()),
            severity: Some("sev2".to_string()),
            ..Default::default()
        };
        let observations = detail.derive(&ctx(&policy, Some(ts(9, 0, 0)))).unwrap();
        assert_eq!(observations[0].value, 3.0);
        assert_eq!(observations[0].unit, Unit::Hours);
        assert_eq!(observations[0].dimension(SEVERITY), Some("sev2"));
    }

    #[test]
    fn test_incident_resolve_invalid_start_time() {
        let policy = MetricPolicy::default();
        let detail = IncidentResolve {
            incident_id: Some("INC1".to_string()),
            start_time: Some("??".to_string()),
            ..Default::default()
        };
        let err = detail.derive(&ctx(&policy, None)).unwrap_err();
        assert!(matches!(
            err,
            DeriveError::InvalidTimestamp(TimestampError { field: "startTime", .. })
        ));
    }

    #[test]
    fn test_resolved_before_start_is_rejected() {
        let policy = MetricPolicy::default();
        let detail = IncidentResolve {
            incident_id: Some("INC1".to_string()),
            start_time: Some("2024-01-01T00:05:00Z".to_string()),
            resolution_time: Some("2024-01-01T00:00:00Z".to_string()),
            ..Default::default()
        };
        let err = detail.derive(&ctx(&policy, None)).unwrap_err();
        assert!(matches!(
            err,
            DeriveError::NegativeElapsed {
                metric: MetricName::Mttr,
                ..
            }
        ));
    }

    #[test]
    fn test_non_elapsed_unit_is_rejected() {
        let policy = MetricPolicy {
            mttr_unit: Unit::Count,
            ..Default::default()
        };
        let detail = IncidentResolve {
            incident_id: Some("INC1".to_string()),
            start_time: Some("2024-01-01T00:00:00Z".to_string()),
            ..Default::default()
        };
        let err = detail.derive(&ctx(&policy, Some(ts(0, 1, 0)))).unwrap_err();
        assert_eq!(
            err,
            DeriveError::UnitNotElapsed {
                metric: MetricName::Mttr,
                unit: Unit::Count
            }
        );
    }

    #[test]
    fn test_rule_for_selects_by_kind() {
        let kinds = [
            (EventKind::DeploymentStart(Default::default()), "DeploymentStart"),
            (
                EventKind::DeploymentSuccess(Default::default()),
                "DeploymentSuccess",
            ),
            (
                EventKind::DeploymentFailure(Default::default()),
                "DeploymentFailure",
            ),
            (EventKind::IncidentStart(Default::default()), "IncidentStart"),
            (EventKind::IncidentResolve(Default::default()), "IncidentResolve"),
        ];
        for (kind, expected) in kinds {
            assert_eq!(rule_for(&kind).name(), expected);
        }
    }

    #[test]
    fn test_counters_require_ids() {
        let policy = MetricPolicy::default();
        assert_eq!(
            DeploymentStart::default()
                .derive(&ctx(&policy, None))
                .unwrap_err(),
            DeriveError::MissingField {
                field: "deploymentId"
            }
        );
        assert_eq!(
            IncidentStart {
                incident_id: Some("  ".to_string()),
                severity: None,
            }
            .derive(&ctx(&policy, None))
            .unwrap_err(),
            DeriveError::MissingField { field: "incidentId" }
        );
        let observations = IncidentStart {
            incident_id: Some("INC7".to_string()),
            severity: None,
        }
        .derive(&ctx(&policy, None))
        .unwrap();
        assert_eq!(observations[0].dimension(INCIDENT_ID), Some("INC7"));
    }
}
