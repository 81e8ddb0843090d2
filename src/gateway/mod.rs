// src/gateway/mod.rs
//! Capability gateway
//!
//! The mediation layer between agent code and the host:
//!
//! - **Domain Policy**: per-agent allowlist for outbound hosts
//! - **Fetch**: the single, gated network path
//! - **Capability**: the gateway surface and its backend injection
//!
//! # Architecture
//!
//! ```text
//! agent code ── host_call ──► injected capability (scope-gated)
//!                                   │
//!                  ┌────────────────┼──────────────────┐
//!                  ▼                ▼                  ▼
//!             Universal Log    Job Manager      Fetcher (allowlist)
//! ```

pub mod capability;
pub mod domain_policy;
pub mod fetch;

// Re-export commonly used types
pub use capability::{install_capabilities, CapabilityGateway, EventMeta, ViewHost};
pub use domain_policy::DomainPolicy;
pub use fetch::{FetchInit, FetchParse, Fetcher};
