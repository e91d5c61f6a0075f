//! `CallGRPC` activity over the Connect unary JSON protocol.
//!
//! A call is a `POST {base}/{service}/{method}` with a JSON body. Connect
//! servers (and gRPC servers behind a Connect/gRPC-JSON gateway) answer
//! with the JSON-encoded response message, or an error document
//! `{ "code": "...", "message": "..." }`.

use std::time::Duration;

use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::{Value, json};

use tideway_core::substrate::activity::{ACTIVITY_CALL_GRPC, Activity, ActivityContext, ActivityError, error_type};
use tideway_types::workflow::{GrpcCallArgs, GrpcService};

const CONNECT_PROTOCOL_VERSION: &str = "1";
const HTTPS_PORT: u16 = 443;
const DEFAULT_PORT: u16 = 80;

#[derive(Debug, Deserialize)]
struct ConnectError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Connect error codes the server may recover from on its own.
fn is_retryable(code: &str) -> bool {
    matches!(code, "unavailable" | "resource_exhausted" | "aborted" | "internal" | "unknown")
}

/// HTTP-equivalent status for a Connect error code.
fn status_for(code: &str) -> u16 {
    match code {
        "invalid_argument" | "failed_precondition" | "out_of_range" => 400,
        "unauthenticated" => 401,
        "permission_denied" => 403,
        "not_found" => 404,
        "already_exists" | "aborted" => 409,
        "resource_exhausted" => 429,
        "canceled" => 499,
        "unimplemented" => 501,
        "unavailable" => 503,
        "deadline_exceeded" => 504,
        _ => 500,
    }
}

/// Base URL for a service: `host` may carry its own scheme.
pub fn base_url(service: &GrpcService) -> String {
    let host = service.host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        return match service.port {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
    }
    let port = service.port.unwrap_or(DEFAULT_PORT);
    let scheme = if port == HTTPS_PORT { "https" } else { "http" };
    format!("{scheme}://{host}:{port}")
}

pub struct CallGrpcActivity {
    client: Client,
}

impl CallGrpcActivity {
    pub fn new() -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().build()?,
        })
    }

    async fn call(&self, args: GrpcCallArgs, timeout: Duration) -> Result<Value, ActivityError> {
        let url = format!("{}/{}/{}", base_url(&args.service), args.service.name, args.method);
        let body = args.arguments.unwrap_or_else(|| json!({}));

        tracing::debug!(url = %url, "calling Connect endpoint");
        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .header("connect-protocol-version", CONNECT_PROTOCOL_VERSION)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ActivityError::timeout("grpc call")
                } else {
                    ActivityError::retryable(error_type::COMMUNICATION, e.to_string())
                }
            })?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ActivityError::retryable(error_type::COMMUNICATION, e.to_string()))?;

        if status.is_success() {
            if bytes.is_empty() {
                return Ok(json!({}));
            }
            return Ok(match serde_json::from_slice::<Value>(&bytes) {
                Ok(value) => value,
                Err(_) => {
                    tracing::warn!(url = %url, "gRPC response is not JSON, returning text");
                    Value::String(String::from_utf8_lossy(&bytes).into_owned())
                }
            });
        }

        let error: ConnectError = serde_json::from_slice(&bytes).unwrap_or(ConnectError {
            code: String::new(),
            message: String::from_utf8_lossy(&bytes).into_owned(),
        });
        tracing::warn!(url = %url, code = %error.code, status = status.as_u16(), "gRPC call failed");

        if error.code == "deadline_exceeded" {
            return Err(ActivityError::timeout(format!("grpc {}", args.method)));
        }
        let message = format!("{}/{} failed: {} {}", args.service.name, args.method, error.code, error.message);
        let err = if is_retryable(&error.code) || (error.code.is_empty() && status.is_server_error()) {
            ActivityError::retryable(error_type::COMMUNICATION, message)
        } else {
            ActivityError::non_retryable(error_type::COMMUNICATION, message)
        };
        let code = if error.code.is_empty() { status.as_u16() } else { status_for(&error.code) };
        Err(err
            .with_status(code)
            .with_details(json!({ "code": error.code, "message": error.message })))
    }
}

impl Activity for CallGrpcActivity {
    fn name(&self) -> &str {
        ACTIVITY_CALL_GRPC
    }

    async fn execute(&self, ctx: ActivityContext, input: Value) -> Result<Value, ActivityError> {
        let args: GrpcCallArgs = serde_json::from_value(input)
            .map_err(|e| ActivityError::non_retryable(error_type::VALIDATION, format!("invalid grpc arguments: {e}")))?;
        self.call(args, ctx.info.start_to_close).await
    }
}
