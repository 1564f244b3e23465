//! Domain mapping table
//! Resolves inbound access hosts to target origins and performs the
//! bidirectional host substitution over header values and bodies.

use anyhow::{Context, Result, bail};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use std::path::Path;
use url::Url;

/// Substitution direction: `Forward` rewrites access-host occurrences into the
/// target host (client -> origin), `Reverse` the inverse (origin -> client).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

/// A single access-host -> target-origin mapping.
///
/// `target_host` is always the authority of `target` (host plus port when the
/// URL carries one), derived at construction time. The value is immutable once
/// built; the reverse substitution direction works on a detached swap of the
/// two host strings, never on shared state.
#[derive(Debug, Clone)]
pub struct DomainMapping {
    access_host: String,
    target_host: String,
    target: Url,
}

impl DomainMapping {
    /// Build a mapping from an access host and a target URL.
    /// A target that does not parse as an absolute URL is a configuration
    /// error and fails construction.
    pub fn new(access_host: impl Into<String>, target: &str) -> Result<Self> {
        let access_host = access_host.into();
        if access_host.is_empty() {
            bail!("mapping access host must not be empty");
        }

        let target: Url = target
            .parse()
            .with_context(|| format!("invalid target url {:?}", target))?;

        let host = target
            .host_str()
            .with_context(|| format!("target url {:?} has no host", target.as_str()))?;
        let target_host = match target.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        Ok(Self {
            access_host,
            target_host,
            target,
        })
    }

    pub fn access_host(&self) -> &str {
        &self.access_host
    }

    pub fn target_host(&self) -> &str {
        &self.target_host
    }

    /// The parsed target origin (scheme, authority, base path, fixed query).
    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Replace all non-overlapping occurrences, left to right.
    pub fn substitute(&self, direction: Direction, text: &str) -> String {
        let (from, to) = self.pair(direction);
        text.replace(from, to)
    }

    pub fn substitute_forward(&self, text: &str) -> String {
        self.substitute(Direction::Forward, text)
    }

    pub fn substitute_reverse(&self, text: &str) -> String {
        self.substitute(Direction::Reverse, text)
    }

    /// Byte-level variant of [`substitute`], used for response bodies.
    pub fn substitute_bytes(&self, direction: Direction, content: &[u8]) -> Vec<u8> {
        let (from, to) = self.pair(direction);
        replace_bytes(content, from.as_bytes(), to.as_bytes())
    }

    /// Apply the substitution to every header value.
    ///
    /// Multi-value ordering is preserved: the first value for a name replaces
    /// the existing entry, subsequent values append. Values that are not valid
    /// UTF-8 are forwarded untouched.
    pub fn rewrite_headers(&self, headers: &mut HeaderMap, direction: Direction) {
        let names: Vec<HeaderName> = headers.keys().cloned().collect();
        for name in names {
            let values: Vec<HeaderValue> = headers.get_all(&name).iter().cloned().collect();
            let mut first = true;
            for value in values {
                let rewritten = match value.to_str() {
                    Ok(text) => {
                        let replaced = self.substitute(direction, text);
                        HeaderValue::from_str(&replaced).unwrap_or_else(|_| value.clone())
                    }
                    Err(_) => value.clone(),
                };
                if first {
                    headers.insert(&name, rewritten);
                    first = false;
                } else {
                    headers.append(&name, rewritten);
                }
            }
        }
    }

    fn pair(&self, direction: Direction) -> (&str, &str) {
        match direction {
            Direction::Forward => (&self.access_host, &self.target_host),
            Direction::Reverse => (&self.target_host, &self.access_host),
        }
    }
}

/// Mapping file entry: `{"from": "<access-host>", "to": "<target-url>"}`.
#[derive(Debug, Deserialize)]
struct MappingEntry {
    from: String,
    to: String,
}

/// An ordered set of domain mappings.
///
/// Lookup is a suffix match against the access hosts and the first declared
/// match wins, so more-specific mappings must be declared before
/// less-specific ones. Matching is case-sensitive exactly as declared. The
/// table is built once at startup and read-only afterwards.
#[derive(Debug, Clone)]
pub struct MappingTable {
    mappings: Vec<DomainMapping>,
}

impl MappingTable {
    /// Build a table from ordered `(access-host, target-url)` pairs.
    pub fn new<I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut mappings = Vec::new();
        for (from, to) in pairs {
            mappings.push(DomainMapping::new(from, &to)?);
        }
        Ok(Self { mappings })
    }

    /// Load a table from a JSON file of `[{"from": ..., "to": ...}]` entries.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading mapping file {}", path.display()))?;
        let entries: Vec<MappingEntry> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing mapping file {}", path.display()))?;
        Self::new(entries.into_iter().map(|e| (e.from, e.to)))
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DomainMapping> {
        self.mappings.iter()
    }

    /// Resolve an inbound host to its mapping.
    ///
    /// A `:port` suffix on the queried host is ignored; declared access hosts
    /// never carry one.
    pub fn resolve(&self, host: &str) -> Option<&DomainMapping> {
        let host = host.split(':').next().unwrap_or(host);
        self.mappings
            .iter()
            .find(|m| host.ends_with(&m.access_host))
    }

    /// Host policy for the TLS front: certificates may only be issued for
    /// hosts that resolve to a mapping.
    pub fn is_host_allowed(&self, host: &str) -> bool {
        self.resolve(host).is_some()
    }
}

fn replace_bytes(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    if needle.is_empty() {
        return haystack.to_vec();
    }
    let mut out = Vec::with_capacity(haystack.len());
    let mut rest = haystack;
    while let Some(pos) = find_subslice(rest, needle) {
        out.extend_from_slice(&rest[..pos]);
        out.extend_from_slice(replacement);
        rest = &rest[pos + needle.len()..];
    }
    out.extend_from_slice(rest);
    out
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
