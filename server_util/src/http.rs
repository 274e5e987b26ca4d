// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use axum::http::header::{ACCEPT_ENCODING, CONTENT_LENGTH, TRANSFER_ENCODING};
use axum::http::{HeaderMap, StatusCode};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{self, Read, Write};
use std::str::FromStr;

/// Why an incoming body was refused before reading it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BodyLimit {
    /// No Content-Length and chunked Transfer-Encoding; we never buffer
    /// unbounded bodies.
    LengthRequired,
    /// Declared length exceeds the per-endpoint cap.
    TooLarge,
}

impl BodyLimit {
    pub fn status(self) -> StatusCode {
        match self {
            Self::LengthRequired => StatusCode::LENGTH_REQUIRED,
            Self::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }
}

/// Checks the declared request body size against `limit` without consuming
/// anything. Chunked uploads are rejected outright.
pub fn check_content_length(headers: &HeaderMap, limit: usize) -> Result<(), BodyLimit> {
    let chunked = headers
        .get(TRANSFER_ENCODING)
        .and_then(|hv| hv.to_str().ok())
        .map(|s| s.eq_ignore_ascii_case("chunked"))
        .unwrap_or(false);
    if chunked {
        return Err(BodyLimit::LengthRequired);
    }

    match headers
        .get(CONTENT_LENGTH)
        .and_then(|hv| hv.to_str().ok())
        .and_then(|s| usize::from_str(s).ok())
    {
        Some(declared) if declared > limit => Err(BodyLimit::TooLarge),
        // Absent Content-Length means no body; fine.
        _ => Ok(()),
    }
}

/// True when the client is willing to receive a gzip response body.
pub fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT_ENCODING)
        .iter()
        .filter_map(|hv| hv.to_str().ok())
        .flat_map(|s| s.split(','))
        .any(|token| {
            let token = token.trim();
            let name = token.split(';').next().unwrap_or("").trim();
            name.eq_ignore_ascii_case("gzip") && !token.contains("q=0,") && !token.ends_with("q=0")
        })
}

pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
    // Writing to a Vec cannot fail.
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

pub fn gunzip(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Compresses `body` if the client accepts gzip and compression shrinks the
/// payload by at least 20%. Returns the body to send and whether it is
/// gzipped.
pub fn negotiate_gzip(headers: &HeaderMap, body: Vec<u8>) -> (Vec<u8>, bool) {
    if !accepts_gzip(headers) {
        return (body, false);
    }
    let compressed = gzip(&body);
    // compressed <= 80% of plain, computed without floats.
    if compressed.len() * 5 <= body.len() * 4 {
        (compressed, true)
    } else {
        (body, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.append(
                axum::http::header::HeaderName::from_str(k).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn content_length_cap() {
        assert_eq!(check_content_length(&headers(&[]), 10), Ok(()));
        assert_eq!(
            check_content_length(&headers(&[("content-length", "10")]), 10),
            Ok(())
        );
        assert_eq!(
            check_content_length(&headers(&[("content-length", "11")]), 10),
            Err(BodyLimit::TooLarge)
        );
        assert_eq!(
            check_content_length(&headers(&[("transfer-encoding", "chunked")]), 10),
            Err(BodyLimit::LengthRequired)
        );
    }

    #[test]
    fn gzip_round_trip() {
        let plain = b"the quick brown fox jumps over the lazy dog".repeat(20);
        let packed = gzip(&plain);
        assert!(packed.len() < plain.len());
        assert_eq!(gunzip(&packed).unwrap(), plain);
    }

    #[test]
    fn gunzip_rejects_garbage() {
        assert!(gunzip(b"definitely not gzip").is_err());
    }

    #[test]
    fn accept_encoding_parsing() {
        assert!(accepts_gzip(&headers(&[("accept-encoding", "gzip")])));
        assert!(accepts_gzip(&headers(&[(
            "accept-encoding",
            "deflate, gzip;q=1.0, *;q=0.5"
        )])));
        assert!(!accepts_gzip(&headers(&[("accept-encoding", "br")])));
        assert!(!accepts_gzip(&headers(&[])));
    }

    #[test]
    fn negotiation_requires_a_real_win() {
        // Highly compressible and accepted: gzip.
        let compressible = b"aaaaaaaa".repeat(200).to_vec();
        let (body, gzipped) =
            negotiate_gzip(&headers(&[("accept-encoding", "gzip")]), compressible.clone());
        assert!(gzipped);
        assert_eq!(gunzip(&body).unwrap(), compressible);

        // Tiny body: gzip overhead loses, send plain.
        let tiny = b"ok".to_vec();
        let (body, gzipped) = negotiate_gzip(&headers(&[("accept-encoding", "gzip")]), tiny.clone());
        assert!(!gzipped);
        assert_eq!(body, tiny);

        // Compressible but client does not accept it.
        let (body, gzipped) = negotiate_gzip(&headers(&[]), compressible.clone());
        assert!(!gzipped);
        assert_eq!(body, compressible);
    }
}
