use chrono::Utc;
use lambda_runtime::{Error, LambdaEvent};
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::events::EventEnvelope;
use crate::metrics::emit::MetricSink;
use crate::process::ProcessedResponse;

pub mod clients;
pub mod cloudwatch;
pub mod config;
pub mod events;
pub mod metrics;
pub mod process;

pub use clients::AwsClients;

pub fn set_up_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();
}

// lambda handler
pub async fn handler(
    sink: &dyn MetricSink,
    config: &Config,
    evt: LambdaEvent<EventEnvelope>,
) -> Result<ProcessedResponse, Error> {
    info!("Handling lambda invocation");
    debug!(request_id = %evt.context.request_id, "Handling event payload: {:?}", evt.payload);

    let response = process::lifecycle_event(sink, config, evt.payload, Utc::now())
        .await
        .inspect_err(|e| {
            error!(
                error = %e,
                stage = %e.stage(),
                caller_error = e.is_caller_error(),
                "Error processing metrics"
            )
        })?;

    Ok(response)
}
