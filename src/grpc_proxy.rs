//! HTTP → gRPC bridge
//!
//! A request flagged with the gRPC header carries a JSON envelope naming a
//! service, method and payload. The bridge forwards it as a unary call over
//! a cached channel to a whitelisted upstream and maps the gRPC status back
//! to an HTTP code. Payloads travel as raw JSON bytes; the upstream services
//! speak a JSON codec, so no descriptor knowledge lives in the gateway.

use std::collections::HashMap;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes};
use dashmap::DashMap;
use http::{HeaderValue, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::metadata::{MetadataKey, MetadataValue};
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};
use tracing::{debug, info, warn};

use crate::config::GrpcProxyConfig;
use crate::context::RequestCtx;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;

/// JSON envelope accepted by the bridge.
#[derive(Debug, Deserialize)]
pub struct BridgeRequest {
    pub service: String,
    pub method: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub timeout: u64,
}

/// JSON envelope written back to the client.
#[derive(Debug, Serialize)]
pub struct BridgeResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub code: u16,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

pub struct GrpcProxy {
    config: GrpcProxyConfig,
    channels: DashMap<String, Channel>,
}

impl GrpcProxy {
    pub fn new(config: &GrpcProxyConfig) -> Self {
        info!(hosts = config.hosts.len(), "gRPC proxy initialized with allowed hosts");
        Self {
            config: config.clone(),
            channels: DashMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// A request carrying the flag header `true`/`1` is a bridge request.
    pub fn is_grpc_request(&self, ctx: &RequestCtx) -> bool {
        if !self.config.enabled {
            return false;
        }
        matches!(ctx.header(&self.config.grpc_header), Some("true") | Some("1"))
    }

    /// Whitelist check: exact address or a listed host with any port.
    pub fn validate_addr(&self, addr: &str) -> bool {
        if self.config.hosts.is_empty() {
            return false;
        }
        self.config
            .hosts
            .iter()
            .any(|host| addr == host || addr.starts_with(&format!("{host}:")))
    }

    /// Execute the bridged call and render the reply envelope.
    pub async fn handle(&self, ctx: &RequestCtx, body: Bytes) -> Response<Bytes> {
        let Some(addr) = ctx.header(&self.config.grpc_addr).map(str::to_string) else {
            return envelope_response(BridgeResponse::error(
                "missing gRPC address header",
                StatusCode::BAD_REQUEST,
            ));
        };

        if !self.validate_addr(&addr) {
            warn!(address = %addr, "gRPC address not in whitelist");
            return envelope_response(BridgeResponse::error(
                "gRPC address not allowed",
                StatusCode::FORBIDDEN,
            ));
        }

        let request: BridgeRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                return envelope_response(BridgeResponse::error(
                    &format!("invalid request format: {e}"),
                    StatusCode::BAD_REQUEST,
                ));
            }
        };
        if request.service.is_empty() || request.method.is_empty() {
            return envelope_response(BridgeResponse::error(
                "service and method fields are required",
                StatusCode::BAD_REQUEST,
            ));
        }

        match self.call(&addr, &request).await {
            Ok(reply) => {
                let data = serde_json::from_slice(&reply).ok();
                envelope_response(BridgeResponse {
                    success: true,
                    data,
                    error: String::new(),
                    code: StatusCode::OK.as_u16(),
                    headers: HashMap::new(),
                })
            }
            Err(status) => {
                debug!(code = ?status.code(), message = %status.message(), "gRPC call failed");
                envelope_response(BridgeResponse::error(
                    status.message(),
                    map_grpc_status(status.code()),
                ))
            }
        }
    }

    async fn call(&self, addr: &str, request: &BridgeRequest) -> Result<Bytes, Status> {
        let channel = self.channel(addr)?;
        let mut client = tonic::client::Grpc::new(channel);
        client
            .ready()
            .await
            .map_err(|e| Status::unavailable(format!("upstream not ready: {e}")))?;

        let path = http::uri::PathAndQuery::try_from(format!(
            "/{}/{}",
            request.service, request.method
        ))
        .map_err(|e| Status::invalid_argument(format!("bad service/method: {e}")))?;

        let payload = serde_json::to_vec(&request.data)
            .map_err(|e| Status::invalid_argument(format!("unencodable data: {e}")))?;

        let mut grpc_request = tonic::Request::new(Bytes::from(payload));
        for (key, value) in &request.headers {
            let Ok(key) = MetadataKey::from_bytes(key.as_bytes()) else {
                continue;
            };
            if let Ok(value) = MetadataValue::try_from(value.as_str()) {
                grpc_request.metadata_mut().insert(key, value);
            }
        }

        let timeout = Duration::from_secs(if request.timeout == 0 {
            DEFAULT_CALL_TIMEOUT_SECS
        } else {
            request.timeout
        });

        let response = tokio::time::timeout(
            timeout,
            client.unary(grpc_request, path, RawJsonCodec::default()),
        )
        .await
        .map_err(|_| Status::deadline_exceeded("bridged call timed out"))??;

        Ok(response.into_inner())
    }

    fn channel(&self, addr: &str) -> Result<Channel, Status> {
        if let Some(channel) = self.channels.get(addr) {
            return Ok(channel.clone());
        }
        let endpoint = Endpoint::try_from(format!("http://{addr}"))
            .map_err(|e| Status::invalid_argument(format!("bad upstream address: {e}")))?
            .connect_timeout(DIAL_TIMEOUT);
        // Lazy connect: the channel dials on first use and reconnects itself.
        let channel = endpoint.connect_lazy();
        self.channels.insert(addr.to_string(), channel.clone());
        info!(address = %addr, "created new gRPC channel");
        Ok(channel)
    }
}

impl BridgeResponse {
    fn error(message: &str, code: StatusCode) -> Self {
        Self {
            success: false,
            data: None,
            error: message.to_string(),
            code: code.as_u16(),
            headers: HashMap::new(),
        }
    }
}

/// gRPC → HTTP status translation.
fn map_grpc_status(code: Code) -> StatusCode {
    match code {
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn envelope_response(envelope: BridgeResponse) -> Response<Bytes> {
    let status =
        StatusCode::from_u16(envelope.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::to_vec(&envelope).unwrap_or_default();
    let mut response = Response::new(Bytes::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert("content-type", HeaderValue::from_static("application/json"));
    response
}

// ── raw bytes codec ──────────────────────────────────────────────

/// Pass-through codec: frames carry raw JSON bytes both ways.
#[derive(Debug, Clone, Default)]
struct RawJsonCodec;

impl Codec for RawJsonCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = RawEncoder;
    type Decoder = RawDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        RawEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawDecoder
    }
}

#[derive(Debug)]
struct RawEncoder;

impl Encoder for RawEncoder {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Bytes, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
        dst.put_slice(&item);
        Ok(())
    }
}

#[derive(Debug)]
struct RawDecoder;

impl Decoder for RawDecoder {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Bytes>, Status> {
        let remaining = src.remaining();
        Ok(Some(src.copy_to_bytes(remaining)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, Method};

    fn proxy_with_hosts(hosts: &[&str]) -> GrpcProxy {
        GrpcProxy::new(&GrpcProxyConfig {
            enabled: true,
            hosts: hosts.iter().map(|h| (*h).to_string()).collect(),
            grpc_header: "X-Grpc-Proxy".to_string(),
            grpc_addr: "X-Grpc-Addr".to_string(),
        })
    }

    fn ctx_with(headers: &[(&str, &str)]) -> RequestCtx {
        let mut ctx = RequestCtx::new(Method::POST, "api.example", "/", None, HeaderMap::new(), None);
        for (name, value) in headers {
            ctx.set_header(name, value);
        }
        ctx
    }

    #[test]
    fn test_grpc_detection() {
        let proxy = proxy_with_hosts(&["svc.local"]);
        assert!(proxy.is_grpc_request(&ctx_with(&[("X-Grpc-Proxy", "true")])));
        assert!(proxy.is_grpc_request(&ctx_with(&[("X-Grpc-Proxy", "1")])));
        assert!(!proxy.is_grpc_request(&ctx_with(&[("X-Grpc-Proxy", "yes")])));
        assert!(!proxy.is_grpc_request(&ctx_with(&[])));
    }

    #[test]
    fn test_whitelist_matching() {
        let proxy = proxy_with_hosts(&["svc.local", "10.0.0.5"]);
        assert!(proxy.validate_addr("svc.local"));
        assert!(proxy.validate_addr("svc.local:50051"));
        assert!(proxy.validate_addr("10.0.0.5:9000"));
        assert!(!proxy.validate_addr("evil.local:50051"));
        // Host-prefix matching must not allow lookalike domains.
        assert!(!proxy.validate_addr("svc.local.evil"));
    }

    #[test]
    fn test_empty_whitelist_denies_everything() {
        let proxy = proxy_with_hosts(&[]);
        assert!(!proxy.validate_addr("anything"));
    }

    #[tokio::test]
    async fn test_missing_addr_header_is_bad_request() {
        let proxy = proxy_with_hosts(&["svc.local"]);
        let response = proxy
            .handle(&ctx_with(&[("X-Grpc-Proxy", "true")]), Bytes::new())
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unlisted_addr_is_forbidden_envelope() {
        let proxy = proxy_with_hosts(&["svc.local"]);
        let ctx = ctx_with(&[("X-Grpc-Proxy", "true"), ("X-Grpc-Addr", "evil.local:1")]);
        let response = proxy.handle(&ctx, Bytes::new()).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let envelope: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(envelope["success"], false);
        assert_eq!(envelope["code"], 403);
    }

    #[tokio::test]
    async fn test_malformed_envelope_is_bad_request() {
        let proxy = proxy_with_hosts(&["svc.local"]);
        let ctx = ctx_with(&[("X-Grpc-Proxy", "true"), ("X-Grpc-Addr", "svc.local:50051")]);
        let response = proxy.handle(&ctx, Bytes::from_static(b"not-json")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_envelope_requires_service_and_method() {
        let proxy = proxy_with_hosts(&["svc.local"]);
        let ctx = ctx_with(&[("X-Grpc-Proxy", "true"), ("X-Grpc-Addr", "svc.local:50051")]);
        let body = Bytes::from_static(br#"{"service": "", "method": "Get"}"#);
        let response = proxy.handle(&ctx, body).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(map_grpc_status(Code::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(map_grpc_status(Code::InvalidArgument), StatusCode::BAD_REQUEST);
        assert_eq!(map_grpc_status(Code::Unauthenticated), StatusCode::UNAUTHORIZED);
        assert_eq!(map_grpc_status(Code::PermissionDenied), StatusCode::FORBIDDEN);
        assert_eq!(
            map_grpc_status(Code::Internal),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            map_grpc_status(Code::Unavailable),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
