//! HTTP capability shared by the fetcher and by loaded extensions

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::core::config::HttpConfig;
use crate::core::error::{ConsumetError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Put => write!(f, "PUT"),
            Method::Delete => write!(f, "DELETE"),
            Method::Patch => write!(f, "PATCH"),
            Method::Head => write!(f, "HEAD"),
            Method::Options => write!(f, "OPTIONS"),
        }
    }
}

impl From<Method> for reqwest::Method {
    fn from(value: Method) -> Self {
        match value {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
            Method::Patch => reqwest::Method::PATCH,
            Method::Head => reqwest::Method::HEAD,
            Method::Options => reqwest::Method::OPTIONS,
        }
    }
}

/// Request as issued by the fetcher or by `axios`/`fetch` inside an isolate
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequest {
    #[serde(default)]
    pub method: Method,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub params: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn head(url: impl Into<String>) -> Self {
        Self {
            method: Method::Head,
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Executes HTTP requests for the engine and for loaded code
///
/// Non-2xx responses are returned, not turned into errors; only transport
/// failures and timeouts are `NetworkError`.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}

pub type SharedHttpClient = Arc<dyn HttpClient>;

pub struct ReqwestClient {
    client: reqwest::Client,
    user_agent: String,
}

impl ReqwestClient {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| ConsumetError::InitializationError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            user_agent: config.user_agent.clone(),
        })
    }

    pub fn shared(config: &HttpConfig) -> Result<SharedHttpClient> {
        Ok(Arc::new(Self::new(config)?))
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        tracing::debug!(method = %request.method, url = %request.url, "executing http request");

        let mut builder = self.client.request(request.method.into(), &request.url);

        if !request.params.is_empty() {
            builder = builder.query(&request.params);
        }

        let has_agent = request
            .headers
            .keys()
            .any(|k| k.eq_ignore_ascii_case("user-agent"));
        if !has_agent {
            builder = builder.header(reqwest::header::USER_AGENT, &self.user_agent);
        }

        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }

        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        if let Some(timeout_ms) = request.timeout_ms {
            builder = builder.timeout(Duration::from_millis(timeout_ms));
        }

        let response = builder.send().await.map_err(|e| map_error(&request.url, e))?;
        map_response(response).await
    }
}

async fn map_response(value: reqwest::Response) -> Result<HttpResponse> {
    let status = value.status();
    let url = value.url().to_string();
    let headers = value
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
        .collect::<HashMap<_, _>>();

    let body = value.text().await.map_err(|e| map_error(&url, e))?;

    Ok(HttpResponse {
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or_default().to_string(),
        url,
        headers,
        body,
    })
}

fn map_error(url: &str, err: reqwest::Error) -> ConsumetError {
    if err.is_timeout() {
        ConsumetError::NetworkError(format!("request to {} timed out", url))
    } else {
        ConsumetError::NetworkError(format!("request to {} failed: {}", url, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = HttpRequest::get("https://example.com")
            .header("Referer", "https://example.com/")
            .timeout(Duration::from_secs(5));

        assert_eq!(request.method, Method::Get);
        assert_eq!(request.headers["Referer"], "https://example.com/");
        assert_eq!(request.timeout_ms, Some(5000));
    }

    #[test]
    fn test_request_deserializes_from_js_shape() {
        let request: HttpRequest = serde_json::from_str(
            r#"{"method":"POST","url":"https://example.com/ajax","headers":{"X-Requested-With":"XMLHttpRequest"},"body":"id=1"}"#,
        )
        .unwrap();

        assert_eq!(request.method, Method::Post);
        assert_eq!(request.body.as_deref(), Some("id=1"));
        assert!(request.params.is_empty());
    }

    #[test]
    fn test_reqwest_client_builds() {
        assert!(ReqwestClient::new(&HttpConfig::default()).is_ok());
    }
}
