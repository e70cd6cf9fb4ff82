use aws_config::SdkConfig;
use aws_sdk_cloudwatch::Client as CloudWatchClient;
use aws_smithy_types::retry::RetryConfig;

use crate::config::Config;

/// A type used to hold the AWS clients required to interact with AWS services
/// used by the lambda function.
#[derive(Clone, Debug)]
pub struct AwsClients {
    pub cloudwatch: CloudWatchClient,
}

impl AwsClients {
    pub fn new(sdk_config: &SdkConfig, config: &Config) -> Self {
        let cloudwatch_config = aws_sdk_cloudwatch::config::Builder::from(sdk_config)
            .retry_config(RetryConfig::standard().with_max_attempts(config.retry_limit))
            .build();

        AwsClients {
            cloudwatch: CloudWatchClient::from_conf(cloudwatch_config),
        }
    }
}
