//! Gzip transcoding for the response rewrite path
//! The upstream leg always negotiates gzip; this adapter decodes the body for
//! rewriting and decides what encoding the client-facing copy carries.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use hyper::header::{HeaderMap, ACCEPT_ENCODING, CONTENT_ENCODING};
use std::io::{Read, Write};
use tracing::warn;

/// What to do with the client-facing `Content-Encoding` header once the body
/// has been through the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingAction {
    /// Leave the header exactly as upstream sent it.
    Keep,
    /// Remove it; the body is delivered as plain bytes.
    Strip,
}

/// Per-response transcoding state, built from the original client request
/// headers and the upstream response headers.
pub struct CompressionAdapter {
    upstream_gzip: bool,
    client_accepts_gzip: bool,
    opaque: bool,
    reencoded: bool,
}

impl CompressionAdapter {
    pub fn new(client_headers: &HeaderMap, upstream_headers: &HeaderMap) -> Self {
        // Plain substring match; a `gzip;q=0` directive still counts as
        // acceptance.
        let client_accepts_gzip = client_headers
            .get(ACCEPT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.contains("gzip"))
            .unwrap_or(false);

        let upstream_gzip = upstream_headers
            .get(CONTENT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.eq_ignore_ascii_case("gzip"))
            .unwrap_or(false);

        Self {
            upstream_gzip,
            client_accepts_gzip,
            opaque: false,
            reencoded: false,
        }
    }

    /// Decode the upstream body for rewriting.
    ///
    /// Corrupt gzip framing does not fail the response: the raw bytes are
    /// returned and the body is marked opaque so it is forwarded unaltered.
    pub fn decode(&mut self, raw: &[u8]) -> Vec<u8> {
        if !self.upstream_gzip {
            return raw.to_vec();
        }

        let mut decoder = GzDecoder::new(raw);
        let mut out = Vec::new();
        match decoder.read_to_end(&mut out) {
            Ok(_) => out,
            Err(err) => {
                warn!(%err, "gzip decode failed, forwarding body unaltered");
                self.opaque = true;
                raw.to_vec()
            }
        }
    }

    /// A body that could not be decoded must not be rewritten.
    pub fn is_opaque(&self) -> bool {
        self.opaque
    }

    /// Re-encode the rewritten body when the client accepts gzip; otherwise
    /// pass the plain bytes through.
    pub fn encode(&mut self, plain: Vec<u8>) -> Vec<u8> {
        if !self.upstream_gzip || self.opaque || !self.client_accepts_gzip {
            return plain;
        }

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        if let Err(err) = encoder.write_all(&plain) {
            warn!(%err, "gzip encode failed, sending plain body");
            return plain;
        }
        match encoder.finish() {
            Ok(out) => {
                self.reencoded = true;
                out
            }
            Err(err) => {
                warn!(%err, "gzip encode failed, sending plain body");
                plain
            }
        }
    }

    /// Decide the client-facing `Content-Encoding`. Call after [`encode`].
    pub fn header_action(&self) -> EncodingAction {
        if self.upstream_gzip && !self.opaque && !self.reencoded {
            EncodingAction::Strip
        } else {
            EncodingAction::Keep
        }
    }
}
