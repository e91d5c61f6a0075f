//! `CallHTTP` activity.
//!
//! Arguments arrive fully evaluated. Status handling:
//! 3xx (when redirects are not followed) and 4xx fail without retry, 5xx
//! fail retryably, transport errors are retryable too. The error details
//! carry the status code and parsed response body.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, StatusCode, redirect};
use serde_json::{Value, json};

use tideway_core::substrate::activity::{ACTIVITY_CALL_HTTP, Activity, ActivityContext, ActivityError, error_type};
use tideway_types::workflow::{HttpCallArgs, HttpOutputFormat};

const MAX_REDIRECTS: usize = 10;

pub struct CallHttpActivity {
    /// Fails on 3xx.
    strict: Client,
    /// Follows redirects (`redirect: true`).
    following: Client,
}

impl CallHttpActivity {
    pub fn new() -> Result<Self, reqwest::Error> {
        Ok(Self {
            strict: Client::builder().redirect(redirect::Policy::none()).build()?,
            following: Client::builder()
                .redirect(redirect::Policy::limited(MAX_REDIRECTS))
                .build()?,
        })
    }

    async fn call(&self, args: HttpCallArgs, timeout: Duration) -> Result<Value, ActivityError> {
        let method = Method::from_bytes(args.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| ActivityError::non_retryable(error_type::VALIDATION, format!("invalid HTTP method: {e}")))?;
        let uri = args.endpoint.uri().to_string();
        let client = if args.redirect { &self.following } else { &self.strict };

        let mut request = client.request(method.clone(), &uri).timeout(timeout);
        for (name, value) in &args.headers {
            request = request.header(name, value);
        }
        if !args.query.is_empty() {
            request = request.query(&args.query);
        }
        request = match &args.body {
            None | Some(Value::Null) => request,
            Some(Value::String(text)) => request.body(text.clone()),
            Some(body) => request.json(body),
        };

        tracing::debug!(method = %method, uri = %uri, "calling HTTP endpoint");
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let headers = header_map(response.headers());
        let bytes = response.bytes().await.map_err(transport_error)?;
        let content = parse_content(&bytes);

        if let Some(err) = status_error(status, &content) {
            tracing::warn!(method = %method, uri = %uri, status = status.as_u16(), "HTTP call failed");
            return Err(err);
        }

        Ok(match args.output {
            HttpOutputFormat::Content => content,
            HttpOutputFormat::Raw => Value::String(BASE64.encode(&bytes)),
            HttpOutputFormat::Response => json!({
                "request": {
                    "method": method.as_str(),
                    "uri": uri,
                    "headers": args.headers,
                },
                "statusCode": status.as_u16(),
                "headers": headers,
                "content": content,
            }),
        })
    }
}

fn transport_error(e: reqwest::Error) -> ActivityError {
    if e.is_timeout() {
        ActivityError::timeout("http request")
    } else {
        ActivityError::retryable(error_type::COMMUNICATION, e.to_string())
    }
}

/// JSON when the body parses as JSON, text otherwise, null when empty.
fn parse_content(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        out.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    out
}

fn status_error(status: StatusCode, content: &Value) -> Option<ActivityError> {
    let code = status.as_u16();
    let err = if status.is_redirection() {
        ActivityError::non_retryable(error_type::COMMUNICATION, format!("HTTP call returned redirect status {status}"))
    } else if status.is_client_error() {
        ActivityError::non_retryable(error_type::COMMUNICATION, format!("HTTP call returned client error {status}"))
    } else if status.is_server_error() {
        ActivityError::retryable(error_type::COMMUNICATION, format!("HTTP call returned server error {status}"))
    } else {
        return None;
    };
    Some(err.with_status(code).with_details(json!({ "statusCode": code, "content": content })))
}

impl Activity for CallHttpActivity {
    fn name(&self) -> &str {
        ACTIVITY_CALL_HTTP
    }

    async fn execute(&self, ctx: ActivityContext, input: Value) -> Result<Value, ActivityError> {
        let args: HttpCallArgs = serde_json::from_value(input)
            .map_err(|e| ActivityError::non_retryable(error_type::VALIDATION, format!("invalid http arguments: {e}")))?;
        self.call(args, ctx.info.start_to_close).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn args(value: Value) -> HttpCallArgs {
        serde_json::from_value(value).unwrap()
    }

    async fn call(server: &MockServer, extra: Value) -> Result<Value, ActivityError> {
        let mut value = json!({ "method": "get", "endpoint": format!("{}/users/1", server.uri()) });
        if let (Some(base), Value::Object(extra)) = (value.as_object_mut(), extra) {
            base.extend(extra);
        }
        CallHttpActivity::new().unwrap().call(args(value), TIMEOUT).await
    }

    #[tokio::test]
    async fn test_content_output_parses_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/1"))
            .and(query_param("expand", "teams"))
            .and(header("x-org", "acme"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 1, "name": "ana" })))
            .mount(&server)
            .await;

        let out = call(&server, json!({ "query": { "expand": "teams" }, "headers": { "x-org": "acme" } }))
            .await
            .unwrap();
        assert_eq!(out, json!({ "id": 1, "name": "ana" }));
    }

    #[tokio::test]
    async fn test_json_body_and_response_output() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/users/1"))
            .and(body_json(json!({ "name": "bo" })))
            .respond_with(ResponseTemplate::new(201).set_body_string("created").insert_header("x-trace", "t1"))
            .mount(&server)
            .await;

        let out = call(
            &server,
            json!({ "method": "POST", "body": { "name": "bo" }, "output": "response" }),
        )
        .await
        .unwrap();
        assert_eq!(out["statusCode"], json!(201));
        assert_eq!(out["content"], json!("created"));
        assert_eq!(out["headers"]["x-trace"], json!("t1"));
        assert_eq!(out["request"]["method"], json!("POST"));
    }

    #[tokio::test]
    async fn test_raw_output_is_base64() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8, 159, 146, 150]))
            .mount(&server)
            .await;

        let out = call(&server, json!({ "output": "raw" })).await.unwrap();
        assert_eq!(out, json!(BASE64.encode([0u8, 159, 146, 150])));
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "error": "no such user" })))
            .mount(&server)
            .await;

        let err = call(&server, json!({})).await.unwrap_err();
        assert!(err.non_retryable);
        assert_eq!(err.status, Some(404));
        assert_eq!(err.details.unwrap()["content"]["error"], json!("no such user"));
    }

    #[tokio::test]
    async fn test_server_errors_are_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = call(&server, json!({})).await.unwrap_err();
        assert!(!err.non_retryable);
        assert_eq!(err.error_type, error_type::COMMUNICATION);
        assert_eq!(err.status, Some(503));
    }

    #[tokio::test]
    async fn test_redirects_fail_unless_followed() {
        let server = MockServer::start().await;
        Mock::given(path("/users/1"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/users/2"))
            .mount(&server)
            .await;
        Mock::given(path("/users/2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 2 })))
            .mount(&server)
            .await;

        let err = call(&server, json!({})).await.unwrap_err();
        assert!(err.non_retryable);
        assert_eq!(err.status, Some(302));

        let out = call(&server, json!({ "redirect": true })).await.unwrap();
        assert_eq!(out, json!({ "id": 2 }));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_retryable() {
        let activity = CallHttpActivity::new().unwrap();
        let err = activity
            .call(args(json!({ "method": "get", "endpoint": "http://127.0.0.1:9/" })), TIMEOUT)
            .await
            .unwrap_err();
        assert!(!err.non_retryable);
    }
}
