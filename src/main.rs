use aws_config::BehaviorVersion;
use dora_metrics_shipper::cloudwatch::CloudWatchSink;
use dora_metrics_shipper::config::Config;
use dora_metrics_shipper::events::EventEnvelope;
use dora_metrics_shipper::AwsClients;
use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Error> {
    dora_metrics_shipper::set_up_logging();

    info!(
        "Initializing {} version {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let config = Config::load_from_env()?;
    info!(
        environment = %config.environment,
        namespace = %config.namespace,
        production = config.is_production(),
        lead_time_unit = %config.policy.lead_time_unit,
        mttr_unit = %config.policy.mttr_unit,
        timestamp_resolution = %config.timestamp_resolution,
        verify_writes = config.verify_writes,
        "configuration loaded"
    );

    let aws_config = aws_config::load_defaults(BehaviorVersion::latest()).await;
    let clients = AwsClients::new(&aws_config, &config);
    let sink = CloudWatchSink::new(clients.cloudwatch);

    run(service_fn(|request: LambdaEvent<EventEnvelope>| {
        dora_metrics_shipper::handler(&sink, &config, request)
    }))
    .await
}
