//! Vsock transport for the AWS SDK
//!
//! The enclave has no network interface. This connector carries the KMS
//! client's HTTP traffic over vsock to the parent EC2 instance, where
//! `vsock-proxy` forwards the raw TCP stream to the AWS endpoint. TLS is
//! therefore terminated here, inside the enclave, so the parent only ever
//! relays ciphertext.
//!
//! ```text
//! ┌─────────────────┐  vsock   ┌─────────────────┐   TCP    ┌─────────────────┐
//! │  Enclave        │─────────▶│  Parent EC2     │─────────▶│  AWS KMS        │
//! │  (TLS client)   │          │  (vsock-proxy)  │          │  (TLS server)   │
//! └─────────────────┘          └─────────────────┘          └─────────────────┘
//! ```
//!
//! Instance metadata (credentials) is plain HTTP on a separate proxy port.

use aws_smithy_runtime_api::client::connector_metadata::ConnectorMetadata;
use aws_smithy_runtime_api::client::http::{
    HttpClient, HttpConnector, HttpConnectorFuture, HttpConnectorSettings, SharedHttpConnector,
};
use aws_smithy_runtime_api::client::orchestrator::{HttpRequest, HttpResponse};
use aws_smithy_runtime_api::client::result::ConnectorError;
use aws_smithy_runtime_api::client::runtime_components::RuntimeComponents;

/// CID for the parent/host instance in vsock
pub const VSOCK_CID_HOST: u32 = 3;

/// Default vsock ports (must match vsock-proxy config on parent)
pub const VSOCK_PORT_KMS: u32 = 8000;
pub const VSOCK_PORT_IMDS: u32 = 8002;

/// EC2 instance metadata service address
pub const IMDS_HOST: &str = "169.254.169.254";

/// Configuration for vsock-based AWS connectivity
#[derive(Debug, Clone)]
pub struct VsockConfig {
    /// vsock port for KMS service
    pub kms_port: u32,
    /// vsock port for EC2 Instance Metadata Service (IMDS)
    pub imds_port: u32,
    /// AWS region
    pub region: String,
}

impl Default for VsockConfig {
    fn default() -> Self {
        Self {
            kms_port: VSOCK_PORT_KMS,
            imds_port: VSOCK_PORT_IMDS,
            region: "ap-southeast-1".to_string(),
        }
    }
}

/// Where a request for a given host goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub port: u32,
    pub tls: bool,
}

impl VsockConfig {
    /// Creates a new vsock config with the specified region
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            ..Default::default()
        }
    }

    /// Maps an endpoint host to its vsock-proxy port
    ///
    /// Unknown hosts have no route; the enclave talks to nothing else.
    pub fn route_for_host(&self, host: &str) -> Option<Route> {
        if host.starts_with("kms.") && host.ends_with(".amazonaws.com") {
            Some(Route {
                port: self.kms_port,
                tls: true,
            })
        } else if host == IMDS_HOST {
            Some(Route {
                port: self.imds_port,
                tls: false,
            })
        } else {
            None
        }
    }
}

/// A vsock-based HTTP connector for the AWS SDK
#[derive(Debug, Clone)]
pub struct VsockHttpConnector {
    config: VsockConfig,
}

impl VsockHttpConnector {
    pub fn new(config: VsockConfig) -> Self {
        Self { config }
    }
}

impl HttpConnector for VsockHttpConnector {
    fn call(&self, request: HttpRequest) -> HttpConnectorFuture {
        let config = self.config.clone();
        HttpConnectorFuture::new(async move { vsock_send_request(request, &config).await })
    }
}

impl HttpClient for VsockHttpConnector {
    fn http_connector(
        &self,
        _settings: &HttpConnectorSettings,
        _components: &RuntimeComponents,
    ) -> SharedHttpConnector {
        SharedHttpConnector::new(self.clone())
    }

    fn connector_metadata(&self) -> Option<ConnectorMetadata> {
        Some(ConnectorMetadata::new("vsock-connector", None))
    }
}

#[cfg(target_os = "linux")]
fn tls_config() -> Result<std::sync::Arc<rustls::ClientConfig>, ConnectorError> {
    use std::sync::{Arc, OnceLock};

    static CONFIG: OnceLock<Arc<rustls::ClientConfig>> = OnceLock::new();
    if let Some(config) = CONFIG.get() {
        return Ok(Arc::clone(config));
    }

    let roots = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| ConnectorError::other(e.into(), None))?
    .with_root_certificates(roots)
    .with_no_client_auth();

    Ok(Arc::clone(CONFIG.get_or_init(|| Arc::new(config))))
}

/// Runs one HTTP/1.1 exchange over an established stream
#[cfg(target_os = "linux")]
async fn exchange<S>(
    io: S,
    request: hyper::Request<http_body_util::Full<bytes::Bytes>>,
    host: &str,
) -> Result<hyper::Response<hyper::body::Incoming>, ConnectorError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    use hyper::client::conn::http1::Builder;
    use hyper_util::rt::TokioIo;

    let (mut sender, conn) = Builder::new()
        .handshake(TokioIo::new(io))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, host = %host, "[VSOCK] HTTP handshake failed");
            ConnectorError::other(e.into(), None)
        })?;

    let host_for_spawn = host.to_string();
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(error = %e, host = %host_for_spawn, "[VSOCK] Connection closed with error");
        }
    });

    sender.send_request(request).await.map_err(|e| {
        tracing::error!(error = %e, host = %host, "[VSOCK] HTTP request failed");
        ConnectorError::other(e.into(), None)
    })
}

/// Sends an HTTP request over vsock
#[cfg(target_os = "linux")]
async fn vsock_send_request(
    request: HttpRequest,
    config: &VsockConfig,
) -> Result<HttpResponse, ConnectorError> {
    use aws_smithy_runtime_api::http::StatusCode as SmithyStatusCode;
    use aws_smithy_types::body::SdkBody;
    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};
    use std::time::Instant;
    use tokio_vsock::{VsockAddr, VsockStream};

    let start = Instant::now();
    let method = request.method().to_string();
    let uri: http::Uri = request
        .uri()
        .parse()
        .map_err(|e: http::uri::InvalidUri| ConnectorError::user(e.into()))?;
    let host = uri
        .host()
        .ok_or_else(|| ConnectorError::user("request URI has no host".into()))?
        .to_string();
    let route = config.route_for_host(&host).ok_or_else(|| {
        tracing::warn!(host = %host, "[VSOCK] No vsock-proxy route for endpoint");
        ConnectorError::user(format!("no vsock route for {}", host).into())
    })?;
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let stream = VsockStream::connect(VsockAddr::new(VSOCK_CID_HOST, route.port))
        .await
        .map_err(|e| {
            tracing::error!(
                error = %e,
                host = %host,
                vsock_port = route.port,
                "[VSOCK] Cannot connect. Ensure vsock-proxy is running on parent: \
                 vsock-proxy {} {} 443",
                route.port,
                host
            );
            ConnectorError::io(e.into())
        })?;

    let parts = request.into_parts();
    let body_bytes: Vec<u8> = parts.body.bytes().map(|b| b.to_vec()).unwrap_or_default();

    let mut builder = hyper::Request::builder().method(method.as_str()).uri(path.as_str());
    let mut has_host = false;
    for (name, value) in parts.headers.iter() {
        has_host |= name.eq_ignore_ascii_case("host");
        builder = builder.header(name.to_string(), value.as_bytes());
    }
    if !has_host {
        builder = builder.header("host", host.as_str());
    }
    let hyper_request = builder
        .body(Full::new(Bytes::from(body_bytes)))
        .map_err(|e| ConnectorError::other(e.into(), None))?;

    let response = if route.tls {
        let server_name = rustls::pki_types::ServerName::try_from(host.clone())
            .map_err(|e| ConnectorError::user(e.into()))?;
        let tls = tokio_rustls::TlsConnector::from(tls_config()?)
            .connect(server_name, stream)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, host = %host, "[VSOCK] TLS handshake failed");
                ConnectorError::io(e.into())
            })?;
        exchange(tls, hyper_request, &host).await?
    } else {
        exchange(stream, hyper_request, &host).await?
    };

    let (parts, body) = response.into_parts();
    let body_bytes = body
        .collect()
        .await
        .map_err(|e| ConnectorError::io(e.into()))?
        .to_bytes();

    let status = SmithyStatusCode::try_from(parts.status.as_u16())
        .map_err(|e| ConnectorError::other(e.into(), None))?;

    tracing::debug!(
        host = %host,
        status = status.as_u16(),
        body_len = body_bytes.len(),
        elapsed_ms = start.elapsed().as_millis(),
        "[VSOCK] Request complete"
    );

    let mut sdk_response = HttpResponse::new(status, SdkBody::from(body_bytes));
    // IMDS token responses rely on x-aws-ec2-metadata-token-ttl-seconds surviving
    for (name, value) in parts.headers.iter() {
        if let Ok(value) = value.to_str() {
            sdk_response
                .headers_mut()
                .insert(name.as_str().to_string(), value.to_string());
        } else {
            tracing::warn!(header_name = %name, "[VSOCK] Dropping non-UTF8 response header");
        }
    }

    Ok(sdk_response)
}

/// vsock only exists on Linux; elsewhere every call fails
#[cfg(not(target_os = "linux"))]
async fn vsock_send_request(
    _request: HttpRequest,
    _config: &VsockConfig,
) -> Result<HttpResponse, ConnectorError> {
    Err(ConnectorError::other(
        "vsock transport is only available on Linux inside a Nitro enclave".into(),
        None,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_for_host() {
        let config = VsockConfig::new("ap-southeast-1");

        assert_eq!(
            config.route_for_host("kms.ap-southeast-1.amazonaws.com"),
            Some(Route {
                port: VSOCK_PORT_KMS,
                tls: true
            })
        );
        assert_eq!(
            config.route_for_host(IMDS_HOST),
            Some(Route {
                port: VSOCK_PORT_IMDS,
                tls: false
            })
        );
        assert_eq!(config.route_for_host("dynamodb.ap-southeast-1.amazonaws.com"), None);
        assert_eq!(config.route_for_host("kms.evil.example.com"), None);
    }

    #[test]
    fn test_custom_ports() {
        let config = VsockConfig {
            kms_port: 9000,
            ..VsockConfig::new("us-east-1")
        };
        assert_eq!(
            config.route_for_host("kms.us-east-1.amazonaws.com").map(|r| r.port),
            Some(9000)
        );
    }
}
