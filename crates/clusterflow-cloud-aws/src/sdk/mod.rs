//! AWS SDK backed clients
//!
//! Each adapter translates one service client into the corresponding
//! provider API trait. Error codes go through [`classify_code`] like every
//! other provider.
//!
//! [`classify_code`]: crate::api::classify_code

mod ec2;
mod elb;
mod iam;
mod kms;
mod route53;
mod s3;

use crate::api::{AwsClients, api_error};
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ec2::error::ProvideErrorMetadata;
use clusterflow_cloud::ApiError;
use std::sync::Arc;

pub use ec2::SdkEc2;
pub use elb::SdkElb;
pub use iam::SdkIam;
pub use kms::SdkKms;
pub use route53::SdkRoute53;
pub use s3::SdkS3;

/// Build clients for `region` from the default credential chain
pub async fn connect(region: &str) -> AwsClients {
    let config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .load()
        .await;
    tracing::debug!(region, "AWS SDK configuration loaded");

    AwsClients {
        region: region.to_string(),
        ec2: Arc::new(SdkEc2::new(&config)),
        iam: Arc::new(SdkIam::new(&config)),
        kms: Arc::new(SdkKms::new(&config)),
        s3: Arc::new(SdkS3::new(&config, region)),
        elb: Arc::new(SdkElb::new(&config)),
        route53: Arc::new(SdkRoute53::new(&config)),
    }
}

/// Classify an SDK error by its service error code
pub(crate) fn sdk_error<E>(err: E) -> ApiError
where
    E: ProvideErrorMetadata + std::fmt::Display,
{
    let code = err.code().unwrap_or("Unknown").to_string();
    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| err.to_string());
    api_error(code, message)
}

/// A request builder rejected missing required fields
pub(crate) fn build_error(err: impl std::fmt::Display) -> ApiError {
    ApiError::other("BuildError", err.to_string())
}

/// A response lacked a field the caller relies on
pub(crate) fn missing(what: &str) -> ApiError {
    ApiError::other("MissingField", format!("response did not contain {}", what))
}
