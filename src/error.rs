//! Per-request error taxonomy
//! Startup/configuration failures use `anyhow` and abort the process; these
//! are the errors a single request can hit after the listeners are up.

use hyper::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// The inbound host matched no configured mapping. A configuration
    /// problem on the caller's side, never retried.
    #[error("no mapping found for host {host:?}")]
    NoMapping { host: String },

    #[error("request carries no host")]
    MissingHost,

    #[error("rewritten target is not a valid uri: {0}")]
    InvalidTarget(#[from] hyper::http::Error),

    #[error("upstream round trip failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    #[error("response hook rejected the response: {0}")]
    ResponseHook(#[source] anyhow::Error),

    /// Dialing the CONNECT target failed. The tunnel is torn down without
    /// writing a response; the client observes a dropped connection.
    #[error("tunnel dial to {authority} failed: {source}")]
    TunnelDial {
        authority: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProxyError {
    /// Status presented to the client. Response bodies stay empty so internal
    /// error text never leaks.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MissingHost => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}
