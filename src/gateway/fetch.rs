// src/gateway/fetch.rs
//! Domain-gated outbound fetch
//!
//! The single network path available to agent code. The allowlist check
//! happens before any I/O: a rejected host performs no network call at
//! all. An allowed request is performed exactly once and its body parsed
//! per the requested mode.

use crate::gateway::domain_policy::DomainPolicy;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// How to parse the response body. Anything other than `json`/`text`
/// yields null.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchParse {
    Json,
    Text,
    None,
}

impl FetchParse {
    /// Wire form: `"json"`, `"text"`, or anything else.
    pub fn from_mode(mode: Option<&str>) -> Self {
        match mode {
            Some("json") => FetchParse::Json,
            Some("text") => FetchParse::Text,
            _ => FetchParse::None,
        }
    }
}

/// Request options, mirroring the init object agent code passes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchInit {
    pub method: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

/// Outbound HTTP client bound to one agent's domain policy.
pub struct Fetcher {
    policy: DomainPolicy,
    client: reqwest::Client,
}

impl Fetcher {
    pub fn new(policy: DomainPolicy, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| EngineError::FetchFailed(format!("client construction failed: {}", e)))?;
        Ok(Self { policy, client })
    }

    pub fn policy(&self) -> &DomainPolicy {
        &self.policy
    }

    /// Perform a gated fetch. Disallowed hosts fail before any network I/O.
    pub async fn fetch(
        &self,
        url: &str,
        init: FetchInit,
        parse: FetchParse,
    ) -> Result<serde_json::Value> {
        let url = Url::parse(url)
            .map_err(|e| EngineError::FetchFailed(format!("invalid url {}: {}", url, e)))?;
        let host = DomainPolicy::host_of(&url)?;

        if let Err(e) = self.policy.check(&host) {
            metrics::counter!("gateway.fetch_denied").increment(1);
            return Err(e);
        }

        debug!(%url, "Outbound fetch");
        metrics::counter!("gateway.fetch_allowed").increment(1);

        let method = init.method.as_deref().unwrap_or("GET");
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| EngineError::FetchFailed(format!("invalid method {}: {}", method, e)))?;

        let mut request = self.client.request(method, url);
        for (name, value) in &init.headers {
            request = request.header(name, value);
        }
        if let Some(body) = init.body {
            request = request.body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::FetchFailed(format!("request failed: {}", e)))?;

        match parse {
            FetchParse::Json => response
                .json()
                .await
                .map_err(|e| EngineError::FetchFailed(format!("json parse failed: {}", e))),
            FetchParse::Text => response
                .text()
                .await
                .map(serde_json::Value::String)
                .map_err(|e| EngineError::FetchFailed(format!("body read failed: {}", e))),
            FetchParse::None => Ok(serde_json::Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// One-shot HTTP server returning a fixed JSON body; counts connections.
    async fn json_server() -> (String, Arc<AtomicU32>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&hits);

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let body = r#"{"ok":true}"#;
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });

        (format!("127.0.0.1:{}", addr.port()), hits)
    }

    #[test]
    fn test_parse_mode_mapping() {
        assert_eq!(FetchParse::from_mode(Some("json")), FetchParse::Json);
        assert_eq!(FetchParse::from_mode(Some("text")), FetchParse::Text);
        assert_eq!(FetchParse::from_mode(Some("xml")), FetchParse::None);
        assert_eq!(FetchParse::from_mode(None), FetchParse::None);
    }

    #[tokio::test]
    async fn test_disallowed_host_performs_no_network_call() {
        let (host, hits) = json_server().await;
        let fetcher = Fetcher::new(DomainPolicy::new(Vec::<String>::new()), 5).unwrap();

        let err = fetcher
            .fetch(
                &format!("http://{}/data", host),
                FetchInit::default(),
                FetchParse::Json,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::DomainNotAllowed { .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_allowed_host_performs_exactly_one_call() {
        let (host, hits) = json_server().await;
        let fetcher = Fetcher::new(DomainPolicy::new([host.clone()]), 5).unwrap();

        let value = fetcher
            .fetch(
                &format!("http://{}/data", host),
                FetchInit::default(),
                FetchParse::Json,
            )
            .await
            .unwrap();

        assert_eq!(value, json!({"ok": true}));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_text_and_null_parse_modes() {
        let (host, _hits) = json_server().await;
        let fetcher = Fetcher::new(DomainPolicy::new([host.clone()]), 5).unwrap();
        let url = format!("http://{}/data", host);

        let text = fetcher
            .fetch(&url, FetchInit::default(), FetchParse::Text)
            .await
            .unwrap();
        assert_eq!(text, serde_json::Value::String(r#"{"ok":true}"#.to_string()));

        let none = fetcher
            .fetch(&url, FetchInit::default(), FetchParse::None)
            .await
            .unwrap();
        assert!(none.is_null());
    }

    #[tokio::test]
    async fn test_invalid_url_is_fetch_error() {
        let fetcher = Fetcher::new(DomainPolicy::new(["x"]), 5).unwrap();
        let err = fetcher
            .fetch("not a url", FetchInit::default(), FetchParse::None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::FetchFailed(_)));
    }
}
