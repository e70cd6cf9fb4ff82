use async_trait::async_trait;
use aws_sdk_cloudwatch::types::{Dimension, MetricDatum, StandardUnit, Statistic};
use aws_sdk_cloudwatch::Client as CloudWatchClient;
use aws_smithy_types::DateTime as SmithyDateTime;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::metrics::emit::{MetricSink, PutMetricRequest, SinkError};
use crate::metrics::Unit;

/// Period, in seconds, of the read-back query used to verify a write.
const VERIFY_PERIOD_SECS: i32 = 60;

/// [`MetricSink`] backed by `cloudwatch:PutMetricData`.
#[derive(Clone, Debug)]
pub struct CloudWatchSink {
    client: CloudWatchClient,
}

impl CloudWatchSink {
    pub fn new(client: CloudWatchClient) -> Self {
        CloudWatchSink { client }
    }
}

#[async_trait]
impl MetricSink for CloudWatchSink {
    async fn put_metric(&self, request: &PutMetricRequest) -> Result<(), SinkError> {
        let datum = metric_datum(request);
        debug!(?datum, "PutMetricData");
        self.client
            .put_metric_data()
            .namespace(&request.namespace)
            .metric_data(datum)
            .send()
            .await
            .map_err(|e| SinkError::Publish {
                metric: request.name.clone(),
                source: Box::new(e.into_service_error()),
            })?;

        Ok(())
    }

    async fn verify(&self, request: &PutMetricRequest) -> Result<bool, SinkError> {
        let (start, end) = verify_window(request.timestamp);
        let output = self
            .client
            .get_metric_statistics()
            .namespace(&request.namespace)
            .metric_name(&request.name)
            .set_dimensions(Some(dimensions(request)))
            .start_time(smithy_datetime(start))
            .end_time(smithy_datetime(end))
            .period(VERIFY_PERIOD_SECS)
            .statistics(Statistic::SampleCount)
            .send()
            .await
            .map_err(|e| SinkError::Verify {
                metric: request.name.clone(),
                source: Box::new(e.into_service_error()),
            })?;

        debug!(
            metric = %request.name,
            datapoints = output.datapoints().len(),
            "GetMetricStatistics"
        );
        Ok(!output.datapoints().is_empty())
    }
}

/// CloudWatch has no standard unit for minutes or hours; those values are
/// published unitless and the metric name carries the meaning.
pub fn standard_unit(unit: Unit) -> StandardUnit {
    match unit {
        Unit::Count => StandardUnit::Count,
        Unit::Milliseconds => StandardUnit::Milliseconds,
        Unit::Seconds => StandardUnit::Seconds,
        Unit::Percent => StandardUnit::Percent,
        Unit::Minutes | Unit::Hours | Unit::None => StandardUnit::None,
    }
}

pub fn metric_datum(request: &PutMetricRequest) -> MetricDatum {
    MetricDatum::builder()
        .metric_name(&request.name)
        .value(request.value)
        .unit(standard_unit(request.unit))
        .timestamp(smithy_datetime(request.timestamp))
        .set_dimensions(Some(dimensions(request)))
        .build()
}

fn dimensions(request: &PutMetricRequest) -> Vec<Dimension> {
    request
        .dimensions
        .iter()
        .map(|(name, value)| Dimension::builder().name(name).value(value).build())
        .collect()
}

fn smithy_datetime(ts: DateTime<Utc>) -> SmithyDateTime {
    SmithyDateTime::from_millis(ts.timestamp_millis())
}

// One full period on each side of the point so it is covered regardless of
// how CloudWatch aligns the buckets.
fn verify_window(ts: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let period = Duration::seconds(VERIFY_PERIOD_SECS as i64);
    (ts - period, ts + period)
}
