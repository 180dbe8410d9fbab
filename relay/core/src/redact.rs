//! Secret Redaction
//!
//! Helpers that keep access tokens, refresh tokens and API keys out of logs
//! and `Debug` output.

use std::borrow::Cow;

/// Number of leading characters kept visible in a masked secret
const VISIBLE_PREFIX: usize = 4;

/// Mask a secret, keeping only a short prefix for correlation
///
/// Secrets shorter than twice the visible prefix are masked entirely.
#[must_use]
pub fn mask_secret(secret: &str) -> String {
    let count = secret.chars().count();
    if count < VISIBLE_PREFIX * 2 {
        return "****".to_string();
    }
    let prefix: String = secret.chars().take(VISIBLE_PREFIX).collect();
    format!("{prefix}****")
}

/// Redact the credential part of an auth header value
///
/// `Bearer abc.def` becomes `Bearer abc.****`; any other value is masked as a
/// raw key.
#[must_use]
pub fn redact_header_value(value: &str) -> String {
    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => {
            format!("{scheme} {}", mask_secret(token.trim()))
        }
        _ => mask_secret(value),
    }
}

/// Redact bearer tokens and JSON token fields embedded in free text
///
/// Used on upstream error bodies before they are logged.
pub fn redact_text(input: &str) -> Cow<'_, str> {
    let mut redacted = input.to_string();

    for marker in ["Bearer ", "bearer "] {
        if !redacted.contains(marker) {
            continue;
        }
        let mut out = String::with_capacity(redacted.len());
        let mut rest = redacted.as_str();
        while let Some(idx) = rest.find(marker) {
            out.push_str(&rest[..idx + marker.len()]);
            rest = &rest[idx + marker.len()..];

            let consumed = token_len(rest);
            out.push_str("REDACTED");
            rest = &rest[consumed..];
        }
        out.push_str(rest);
        redacted = out;
    }

    for field in [
        "\"access_token\":\"",
        "\"refresh_token\":\"",
        "\"accessToken\":\"",
        "\"refreshToken\":\"",
    ] {
        if !redacted.contains(field) {
            continue;
        }
        let mut out = String::with_capacity(redacted.len());
        let mut rest = redacted.as_str();
        while let Some(idx) = rest.find(field) {
            out.push_str(&rest[..idx + field.len()]);
            rest = &rest[idx + field.len()..];

            let consumed = rest.find('"').unwrap_or(rest.len());
            out.push_str("REDACTED");
            rest = &rest[consumed..];
        }
        out.push_str(rest);
        redacted = out;
    }

    if redacted == input {
        Cow::Borrowed(input)
    } else {
        Cow::Owned(redacted)
    }
}

fn token_len(rest: &str) -> usize {
    let mut consumed = 0;
    for ch in rest.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '~' | '+' | '/' | '=') {
            consumed += ch.len_utf8();
        } else {
            break;
        }
    }
    consumed
}
