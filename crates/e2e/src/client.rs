//! HTTP client for talking to the system under test

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{E2eError, E2eResult};

const SNIPPET_LEN: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }

    fn to_reqwest(self) -> reqwest::Method {
        match self {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Request payload
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Empty,
    Json(Value),
    /// Sent verbatim, with an optional Content-Type
    Raw {
        text: String,
        content_type: Option<String>,
    },
}

/// A fully resolved request, relative to the base URL
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub path: String,
    pub authorization: Option<String>,
    pub body: Body,
}

impl RequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            authorization: None,
            body: Body::Empty,
        }
    }

    pub fn json(mut self, value: Value) -> Self {
        self.body = Body::Json(value);
        self
    }

    pub fn raw(mut self, text: impl Into<String>, content_type: Option<String>) -> Self {
        self.body = Body::Raw {
            text: text.into(),
            content_type,
        };
        self
    }

    pub fn authorization(mut self, value: Option<String>) -> Self {
        self.authorization = value;
        self
    }
}

/// What came back
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Captured {
    pub status: u16,
    pub body: String,
    /// Parsed body, when it was JSON
    pub json: Option<Value>,
    pub duration_ms: u64,
}

impl Captured {
    pub fn from_parts(status: u16, body: String, duration_ms: u64) -> Self {
        let json = serde_json::from_str(&body).ok();
        Self {
            status,
            body,
            json,
            duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body truncated for error messages
    pub fn body_snippet(&self) -> String {
        if self.body.chars().count() <= SNIPPET_LEN {
            self.body.clone()
        } else {
            let cut: String = self.body.chars().take(SNIPPET_LEN).collect();
            format!("{}...", cut)
        }
    }
}

/// Thin wrapper over reqwest bound to one base URL
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> E2eResult<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// Send a request. Any HTTP status is a success here; only transport
    /// failures (refused, reset, timed out) are errors.
    pub async fn send(&self, req: &RequestSpec) -> E2eResult<Captured> {
        let url = self.url(&req.path);
        let mut builder = self.http.request(req.method.to_reqwest(), &url);

        if let Some(auth) = &req.authorization {
            builder = builder.header(AUTHORIZATION, auth);
        }
        builder = match &req.body {
            Body::Empty => builder,
            Body::Json(value) => builder.json(value),
            Body::Raw { text, content_type } => {
                let b = builder.body(text.clone());
                match content_type {
                    Some(ct) => b.header(CONTENT_TYPE, ct),
                    None => b,
                }
            }
        };

        let start = Instant::now();
        let resp = builder.send().await.map_err(|e| E2eError::Connectivity {
            url: url.clone(),
            reason: describe_transport_error(&e),
        })?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(|e| E2eError::Connectivity {
            url: url.clone(),
            reason: format!("reading body: {}", describe_transport_error(&e)),
        })?;
        let duration_ms = start.elapsed().as_millis() as u64;

        debug!("{} {} -> {} ({} ms)", req.method.as_str(), req.path, status, duration_ms);
        Ok(Captured::from_parts(status, body, duration_ms))
    }
}

fn describe_transport_error(e: &reqwest::Error) -> String {
    if e.is_connect() {
        format!("connection refused or reset ({})", e)
    } else if e.is_timeout() {
        format!("request timed out ({})", e)
    } else {
        e.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_with_and_without_slash() {
        let client = ApiClient::new("http://127.0.0.1:8000/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.url("/vehicles"), "http://127.0.0.1:8000/vehicles");
        assert_eq!(client.url("vehicles/AB-123"), "http://127.0.0.1:8000/vehicles/AB-123");
    }

    #[test]
    fn captured_parses_json_when_possible() {
        let ok = Captured::from_parts(201, r#"{"status":"Success"}"#.to_string(), 3);
        assert!(ok.is_success());
        assert_eq!(ok.json.unwrap()["status"], "Success");

        let text = Captured::from_parts(401, "Unauthorized".to_string(), 1);
        assert!(!text.is_success());
        assert!(text.json.is_none());
    }

    #[test]
    fn snippet_truncates_long_bodies() {
        let long = "x".repeat(1000);
        let captured = Captured::from_parts(500, long, 0);
        let snippet = captured.body_snippet();
        assert!(snippet.ends_with("..."));
        assert_eq!(snippet.len(), SNIPPET_LEN + 3);
    }

    #[test]
    fn method_parses_uppercase() {
        let m: Method = serde_yaml::from_str("DELETE").unwrap();
        assert_eq!(m, Method::Delete);
    }

    #[tokio::test]
    async fn refused_connection_is_connectivity_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = ApiClient::new(format!("http://127.0.0.1:{}", port), Duration::from_secs(2)).unwrap();
        let err = client
            .send(&RequestSpec::new(Method::Get, "/parkinglots"))
            .await
            .unwrap_err();
        assert!(matches!(err, E2eError::Connectivity { .. }), "got {err}");
    }
}
