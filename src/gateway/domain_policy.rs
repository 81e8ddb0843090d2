// src/gateway/domain_policy.rs
//! Domain allowlist for outbound fetches
//!
//! Each agent carries an immutable set of allowed hosts, fixed at load
//! time. Entries are exact hosts (`api.example.com`), hosts with an
//! explicit non-default port (`127.0.0.1:8080`), or wildcard patterns
//! (`*.example.com`) matching any subdomain.

use crate::utils::errors::{EngineError, Result};
use std::collections::BTreeSet;
use tracing::debug;
use url::Url;

/// Immutable per-agent domain allowlist.
#[derive(Debug, Clone, Default)]
pub struct DomainPolicy {
    allowed: BTreeSet<String>,
}

impl DomainPolicy {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: domains.into_iter().map(Into::into).collect(),
        }
    }

    /// The host-with-optional-port string an allowlist entry must match.
    /// Default ports are never included (`https://h:443/` matches `h`).
    pub fn host_of(url: &Url) -> Result<String> {
        let host = url
            .host_str()
            .ok_or_else(|| EngineError::FetchFailed(format!("url has no host: {}", url)))?;
        Ok(match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        })
    }

    pub fn allows(&self, host: &str) -> bool {
        if self.allowed.contains(host) {
            return true;
        }

        // Wildcard match (e.g. *.example.com), on subdomain boundaries only.
        for pattern in &self.allowed {
            if let Some(suffix) = pattern.strip_prefix("*.") {
                if host.ends_with(suffix)
                    && host.len() > suffix.len()
                    && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
                {
                    debug!(host, pattern = %pattern, "Wildcard domain match");
                    return true;
                }
            }
        }

        false
    }

    pub fn check(&self, host: &str) -> Result<()> {
        if self.allows(host) {
            Ok(())
        } else {
            Err(EngineError::DomainNotAllowed {
                host: host.to_string(),
            })
        }
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }
}
