//! `Accept-Encoding` negotiation and up-front body compression.

use std::io::Write;

use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;

use liveorigin_common::Result;

/// Content coding applied to a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Gzip,
    Deflate,
}

impl ContentEncoding {
    /// Token used in `Content-Encoding`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
        }
    }

    /// Pick a coding from an `Accept-Encoding` header.
    ///
    /// gzip is preferred over deflate at equal quality; codings with `q=0`
    /// are refused and `*` matches gzip.
    pub fn negotiate(accept: &str) -> Option<Self> {
        let mut best: Option<(Self, f32)> = None;
        for item in accept.split(',') {
            let mut params = item.split(';');
            let token = params.next().unwrap_or("").trim().to_ascii_lowercase();
            let q = params
                .filter_map(|p| p.trim().strip_prefix("q="))
                .find_map(|v| v.trim().parse::<f32>().ok())
                .unwrap_or(1.0);
            if q <= 0.0 {
                continue;
            }
            let coding = match token.as_str() {
                "gzip" | "x-gzip" | "*" => Self::Gzip,
                "deflate" => Self::Deflate,
                _ => continue,
            };
            let better = match best {
                None => true,
                Some((current, best_q)) => {
                    q > best_q || (q == best_q && coding == Self::Gzip && current != Self::Gzip)
                }
            };
            if better {
                best = Some((coding, q));
            }
        }
        best.map(|(coding, _)| coding)
    }

    /// Compress a complete body.
    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        let out = match self {
            Self::Gzip => {
                let mut enc = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
                enc.write_all(data)?;
                enc.finish()?
            }
            Self::Deflate => {
                let mut enc =
                    ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
                enc.write_all(data)?;
                enc.finish()?
            }
        };
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::{GzDecoder, ZlibDecoder};
    use std::io::Read;

    #[test]
    fn negotiation_prefers_gzip() {
        assert_eq!(
            ContentEncoding::negotiate("deflate, gzip"),
            Some(ContentEncoding::Gzip)
        );
        assert_eq!(
            ContentEncoding::negotiate("deflate"),
            Some(ContentEncoding::Deflate)
        );
        assert_eq!(ContentEncoding::negotiate("br, identity"), None);
    }

    #[test]
    fn negotiation_honors_quality() {
        assert_eq!(
            ContentEncoding::negotiate("gzip;q=0.2, deflate;q=0.8"),
            Some(ContentEncoding::Deflate)
        );
        assert_eq!(ContentEncoding::negotiate("gzip;q=0"), None);
        assert_eq!(ContentEncoding::negotiate("*"), Some(ContentEncoding::Gzip));
    }

    #[test]
    fn compressed_bodies_decompress() {
        let body = "<MPD>".repeat(200);

        let gz = ContentEncoding::Gzip.compress(body.as_bytes()).unwrap();
        assert!(gz.len() < body.len());
        let mut plain = String::new();
        GzDecoder::new(&gz[..]).read_to_string(&mut plain).unwrap();
        assert_eq!(plain, body);

        let zl = ContentEncoding::Deflate.compress(body.as_bytes()).unwrap();
        let mut plain = String::new();
        ZlibDecoder::new(&zl[..]).read_to_string(&mut plain).unwrap();
        assert_eq!(plain, body);
    }
}
