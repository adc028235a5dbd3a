// Copyright 2025 Recall Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use anyhow::{anyhow, Context};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::strategy::{UserMetadata, METADATA_PREFIX};

/// Strips the query string (and with it the signature) from a presigned URL so it can be logged.
pub fn scrub_presigned_url(url: &str) -> &str {
    match url.rfind('?') {
        Some(idx) if idx > 0 => &url[..idx],
        _ => url,
    }
}

/// Returns the presigned URL if it is usable: non-empty and not the literal "null".
pub fn usable_presigned_url(url: Option<&str>) -> Option<&str> {
    url.filter(|u| !u.is_empty() && !u.eq_ignore_ascii_case("null"))
}

/// Content-encoding to put on the wire. GCS transcodes `gzip` objects on download,
/// which no other supported backend does, so the header is blanked for them.
pub fn transport_content_encoding(encoding: &str) -> &str {
    if encoding == "gzip" {
        ""
    } else {
        encoding
    }
}

/// Maps user metadata to `x-goog-meta-` request headers.
pub fn metadata_headers(metadata: &UserMetadata) -> anyhow::Result<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(metadata.len());
    for (key, value) in metadata {
        let name = HeaderName::from_bytes(format!("{METADATA_PREFIX}{key}").as_bytes())
            .with_context(|| format!("invalid metadata key '{}'", key))?;
        let value = HeaderValue::from_str(value)
            .with_context(|| format!("invalid value for metadata key '{}'", key))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Collects `x-goog-meta-` response headers back into user metadata.
pub fn metadata_from_headers(headers: &HeaderMap) -> UserMetadata {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix(METADATA_PREFIX)?;
            let value = value.to_str().ok()?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Parse a `key=value` metadata pair.
pub fn parse_metadata(s: &str) -> anyhow::Result<(String, String)> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| anyhow!("invalid metadata '{}', expected key=value", s))?;
    if key.is_empty() {
        return Err(anyhow!("metadata key cannot be empty"));
    }
    Ok((key.to_string(), value.to_string()))
}
