//! Outbound request rewriting
//! The director points a request at the resolved target origin; the header
//! utilities handle hop-by-hop stripping and forwarding headers.

use crate::error::ProxyError;
use crate::mapping::DomainMapping;
use hyper::header::{
    ACCEPT_ENCODING, CONNECTION, HOST, HeaderMap, HeaderName, HeaderValue, PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE, USER_AGENT,
};
use hyper::http::request::Parts;
use hyper::Uri;
use once_cell::sync::Lazy;
use std::net::IpAddr;

/// Sent upstream when the client did not supply a User-Agent of its own.
const FALLBACK_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_12_1) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/65.0.3325.181 Safari/537.36";

/// Headers that are meaningful for a single transport hop only and must never
/// be forwarded in either direction.
static HOP_BY_HOP_HEADERS: Lazy<[HeaderName; 8]> = Lazy::new(|| {
    [
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        PROXY_AUTHENTICATE,
        PROXY_AUTHORIZATION,
        TE,
        TRAILER,
        TRANSFER_ENCODING,
        UPGRADE,
    ]
});

/// Rewrite the outbound request parts to address the mapping's target.
///
/// The scheme comes from the target URL, the authority from forward
/// substitution over the inbound `Host` value, the path from single-slash
/// joining of the target base path and the request path, and the query from
/// concatenating the target's fixed query with the request query. The `Host`
/// header always equals the new authority. No I/O happens here.
pub fn direct(
    parts: &mut Parts,
    mapping: &DomainMapping,
    inbound_host: &str,
) -> Result<(), ProxyError> {
    let authority = mapping.substitute_forward(inbound_host);

    let path = single_joining_slash(mapping.target().path(), parts.uri.path());
    let path_and_query = match (mapping.target().query(), parts.uri.query()) {
        (Some(fixed), Some(query)) => format!("{}?{}&{}", path, fixed, query),
        (Some(fixed), None) => format!("{}?{}", path, fixed),
        (None, Some(query)) => format!("{}?{}", path, query),
        (None, None) => path,
    };

    parts.uri = Uri::builder()
        .scheme(mapping.target().scheme())
        .authority(authority.as_str())
        .path_and_query(path_and_query.as_str())
        .build()?;

    let host_value = HeaderValue::from_str(&authority).map_err(hyper::http::Error::from)?;
    parts.headers.insert(HOST, host_value);

    if !parts.headers.contains_key(USER_AGENT) {
        parts
            .headers
            .insert(USER_AGENT, HeaderValue::from_static(FALLBACK_USER_AGENT));
    }

    // Upstream negotiation is fixed to gzip; the return path decides what the
    // client actually receives.
    parts
        .headers
        .insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));

    Ok(())
}

/// Remove hop-by-hop headers: everything named in `Connection` values plus
/// the standard set.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in listed {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP_HEADERS.iter() {
        headers.remove(name);
    }
}

/// Merge the client address into `X-Forwarded-For`.
pub fn append_forwarded_for(headers: &mut HeaderMap, client_ip: IpAddr) {
    let name = HeaderName::from_static("x-forwarded-for");
    let client = client_ip.to_string();
    let merged = match headers.get(&name).and_then(|value| value.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{}, {}", prior, client),
        _ => client,
    };
    if let Ok(value) = HeaderValue::from_str(&merged) {
        headers.insert(name, value);
    }
}

/// Join a base path and a request path with exactly one slash between them.
fn single_joining_slash(a: &str, b: &str) -> String {
    let a_slash = a.ends_with('/');
    let b_slash = b.starts_with('/');
    match (a_slash, b_slash) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) => format!("{}/{}", a, b),
        _ => format!("{}{}", a, b),
    }
}
