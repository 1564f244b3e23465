//! mirrorproxy - a domain-rewriting HTTP/HTTPS reverse proxy
//!
//! Forwards traffic addressed to configured access hosts to their target
//! origins, rewriting every textual trace of the target hostname back to the
//! access hostname in headers and bodies (and the inverse substitution on the
//! way out). CONNECT traffic is tunneled raw; TLS can be terminated locally
//! with per-host certificates gated by the mapping table.

pub mod certificate;
pub mod compression;
pub mod error;
pub mod mapping;
pub mod proxy;
pub mod rewrite;

pub use certificate::{CertificateManager, HostPolicy};
pub use error::ProxyError;
pub use mapping::{Direction, DomainMapping, MappingTable};
pub use proxy::{ProxyConfig, ProxyServer};
