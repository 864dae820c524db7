//! AWS client initialization for the Nitro enclave
//!
//! Builds a KMS client whose HTTP traffic (including credential lookups
//! against instance metadata) runs over vsock.
//!
//! ## Setup on Parent EC2 Instance
//!
//! The parent instance must run vsock-proxy to forward enclave traffic:
//!
//! ```bash
//! # KMS proxy (port 8000)
//! vsock-proxy 8000 kms.ap-southeast-1.amazonaws.com 443 &
//!
//! # Instance metadata proxy (port 8002)
//! vsock-proxy 8002 169.254.169.254 80 &
//! ```

use crate::kms::EnclaveKms;
use crate::vsock_transport::{VsockConfig, VsockHttpConnector};
use aws_config::Region;
use aws_sdk_kms::Client as KmsClient;
use tracing::info;

/// Initializes the KMS client for enclave use
pub async fn enclave_kms(vsock: VsockConfig) -> EnclaveKms {
    info!(
        region = %vsock.region,
        kms_port = vsock.kms_port,
        imds_port = vsock.imds_port,
        "Initializing KMS client over vsock"
    );

    let region = Region::new(vsock.region.clone());
    let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(region)
        .http_client(VsockHttpConnector::new(vsock))
        .load()
        .await;

    EnclaveKms::new(KmsClient::new(&sdk_config))
}
