/*
 * auth.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Tagliacarte, a cross-platform email client.
 *
 * Tagliacarte is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Tagliacarte is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Tagliacarte.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Authentication: proactive Basic/Bearer headers, and Digest challenge/response
//! per RFC 7616. OAuth token refresh is delegated to a caller-supplied callback
//! rather than performed by this crate (see `OAuthRefresh`).

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use md5::Md5;
use sha2::{Digest as ShaDigest, Sha256, Sha512_256};
use std::fmt::Write as _;
use std::future::Future;
use std::pin::Pin;

/// Credentials configured for a connection. Cloned per connection so that
/// nonce counters and expiry state are never shared across connections.
#[derive(Debug, Clone)]
pub enum Credentials {
    Basic {
        username: String,
        password: String,
    },
    Bearer {
        token: String,
    },
    Digest {
        username: String,
        password: String,
        algorithm: DigestAlgorithm,
    },
    OAuth {
        access_token: String,
        refresh_token: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Md5Sess,
    Sha256,
    Sha256Sess,
    Sha512_256,
    Sha512_256Sess,
}

impl DigestAlgorithm {
    fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "MD5-SESS" => DigestAlgorithm::Md5Sess,
            "SHA-256" => DigestAlgorithm::Sha256,
            "SHA-256-SESS" => DigestAlgorithm::Sha256Sess,
            "SHA-512-256" => DigestAlgorithm::Sha512_256,
            "SHA-512-256-SESS" => DigestAlgorithm::Sha512_256Sess,
            _ => DigestAlgorithm::Md5,
        }
    }

    fn is_sess(&self) -> bool {
        matches!(
            self,
            DigestAlgorithm::Md5Sess | DigestAlgorithm::Sha256Sess | DigestAlgorithm::Sha512_256Sess
        )
    }

    fn hash_hex(&self, input: &str) -> String {
        match self {
            DigestAlgorithm::Md5 | DigestAlgorithm::Md5Sess => hex(&Md5::digest(input.as_bytes())),
            DigestAlgorithm::Sha256 | DigestAlgorithm::Sha256Sess => {
                hex(&Sha256::digest(input.as_bytes()))
            }
            DigestAlgorithm::Sha512_256 | DigestAlgorithm::Sha512_256Sess => {
                hex(&Sha512_256::digest(input.as_bytes()))
            }
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

/// Per-credential nonce counter. Never reset for the lifetime of the connection.
#[derive(Debug, Default)]
pub struct DigestState {
    nc: u32,
}

impl DigestState {
    pub fn new() -> Self {
        Self { nc: 0 }
    }
}

/// A parsed `WWW-Authenticate` (or `Proxy-Authenticate`) challenge.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub scheme: String,
    pub realm: Option<String>,
    pub nonce: Option<String>,
    pub qop: Option<String>,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
    pub stale: bool,
    /// Bearer-specific error code, e.g. "invalid_token" or "expired".
    pub error: Option<String>,
}

/// Parse the first scheme in a `WWW-Authenticate` header value.
pub fn parse_www_authenticate(value: &str) -> Option<Challenge> {
    let value = value.trim();
    let space = value.find(char::is_whitespace)?;
    let scheme = value[..space].to_string();
    let rest = value[space..].trim_start();

    let mut realm = None;
    let mut nonce = None;
    let mut qop = None;
    let mut opaque = None;
    let mut algorithm = None;
    let mut stale = false;
    let mut error = None;

    for param in split_auth_params(rest) {
        let (name, val) = match param.split_once('=') {
            Some(p) => p,
            None => continue,
        };
        let name = name.trim().to_ascii_lowercase();
        let val = unquote(val.trim());
        match name.as_str() {
            "realm" => realm = Some(val),
            "nonce" => nonce = Some(val),
            "qop" => qop = Some(val),
            "opaque" => opaque = Some(val),
            "algorithm" => algorithm = Some(val),
            "stale" => stale = val.eq_ignore_ascii_case("true"),
            "error" => error = Some(val),
            _ => {}
        }
    }

    Some(Challenge {
        scheme,
        realm,
        nonce,
        qop,
        opaque,
        algorithm,
        stale,
        error,
    })
}

/// Split a comma-separated auth-param list, respecting quoted strings.
fn split_auth_params(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '\\' if in_quotes => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ',' if !in_quotes => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }
    parts
}

fn unquote(s: &str) -> String {
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        s[1..s.len() - 1].replace("\\\"", "\"").replace("\\\\", "\\")
    } else {
        s.to_string()
    }
}

/// Header value to attach proactively (before any challenge), for schemes
/// that support it. Digest never attaches proactively.
pub fn proactive_authorization(credentials: &Credentials) -> Option<String> {
    match credentials {
        Credentials::Basic { username, password } => {
            let raw = format!("{}:{}", username, password);
            Some(format!("Basic {}", BASE64_STANDARD.encode(raw)))
        }
        Credentials::Bearer { token } => Some(format!("Bearer {}", token)),
        Credentials::OAuth { access_token, .. } => Some(format!("Bearer {}", access_token)),
        Credentials::Digest { .. } => None,
    }
}

/// Compute an `Authorization` header in response to a challenge. Returns
/// `None` when the credential cannot satisfy the scheme in `challenge`.
pub fn compute_challenge_response(
    credentials: &Credentials,
    state: &mut DigestState,
    method: &str,
    uri: &str,
    challenge: &Challenge,
) -> Option<String> {
    match (credentials, challenge.scheme.to_ascii_lowercase().as_str()) {
        (Credentials::Digest { username, password, algorithm }, "digest") => {
            let realm = challenge.realm.as_deref().unwrap_or("");
            let nonce = challenge.nonce.as_deref()?;
            let alg = challenge
                .algorithm
                .as_deref()
                .map(DigestAlgorithm::parse)
                .unwrap_or(*algorithm);

            state.nc += 1;
            let nc = format!("{:08x}", state.nc);
            let cnonce = generate_cnonce();

            let mut ha1 = alg.hash_hex(&format!("{}:{}:{}", username, realm, password));
            if alg.is_sess() {
                ha1 = alg.hash_hex(&format!("{}:{}:{}", ha1, nonce, cnonce));
            }
            let ha2 = alg.hash_hex(&format!("{}:{}", method, uri));

            let qop = challenge.qop.as_deref();
            let use_qop = qop.map(|q| q.split(',').any(|t| t.trim() == "auth")).unwrap_or(false);

            let response = if use_qop {
                alg.hash_hex(&format!("{}:{}:{}:{}:auth:{}", ha1, nonce, nc, cnonce, ha2))
            } else {
                alg.hash_hex(&format!("{}:{}:{}", ha1, nonce, ha2))
            };

            let mut header = format!(
                "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
                username, realm, nonce, uri, response
            );
            if let Some(opaque) = &challenge.opaque {
                let _ = write!(header, ", opaque=\"{}\"", opaque);
            }
            if use_qop {
                let _ = write!(header, ", qop=auth, nc={}, cnonce=\"{}\"", nc, cnonce);
            }
            if challenge.algorithm.is_some() {
                let _ = write!(header, ", algorithm={}", algorithm_name(alg));
            }
            Some(header)
        }
        (Credentials::OAuth { access_token, .. }, "bearer") => {
            if challenge.error.as_deref() == Some("invalid_token")
                || challenge.error.as_deref() == Some("expired")
            {
                None // caller must refresh via OAuthRefresh and retry with a new token
            } else {
                Some(format!("Bearer {}", access_token))
            }
        }
        (Credentials::Basic { .. }, "basic") => proactive_authorization(credentials),
        (Credentials::Bearer { .. }, "bearer") => proactive_authorization(credentials),
        _ => None,
    }
}

/// Whether a failed Bearer/OAuth challenge should trigger a refresh-and-retry
/// rather than simply surfacing the 401/407: the credentials must be OAuth
/// with a refresh token on hand, the challenge must report `invalid_token` or
/// `expired`, and the caller must have configured a refresh callback.
pub fn oauth_refresh_needed(credentials: &Credentials, challenge: &Challenge, has_refresh_callback: bool) -> bool {
    has_refresh_callback
        && challenge.scheme.eq_ignore_ascii_case("bearer")
        && matches!(challenge.error.as_deref(), Some("invalid_token") | Some("expired"))
        && matches!(credentials, Credentials::OAuth { refresh_token: Some(_), .. })
}

fn algorithm_name(alg: DigestAlgorithm) -> &'static str {
    match alg {
        DigestAlgorithm::Md5 => "MD5",
        DigestAlgorithm::Md5Sess => "MD5-sess",
        DigestAlgorithm::Sha256 => "SHA-256",
        DigestAlgorithm::Sha256Sess => "SHA-256-sess",
        DigestAlgorithm::Sha512_256 => "SHA-512-256",
        DigestAlgorithm::Sha512_256Sess => "SHA-512-256-sess",
    }
}

fn generate_cnonce() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex(&bytes)
}

/// Caller-supplied OAuth refresh callback: exchange a refresh token for a new
/// access token (and optionally a new refresh token). The engine never talks
/// to a token endpoint itself; it only invokes this when a Bearer challenge
/// reports `invalid_token` or `expired`.
pub trait OAuthRefresh: Send + Sync {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(String, Option<String>), crate::protocol::http::error::HttpError>> + Send + 'a>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_digest_challenge() {
        let c = parse_www_authenticate(
            r#"Digest realm="example.com", nonce="abc123", qop="auth", opaque="xyz""#,
        )
        .unwrap();
        assert_eq!(c.scheme, "Digest");
        assert_eq!(c.realm.as_deref(), Some("example.com"));
        assert_eq!(c.nonce.as_deref(), Some("abc123"));
        assert_eq!(c.qop.as_deref(), Some("auth"));
        assert_eq!(c.opaque.as_deref(), Some("xyz"));
    }

    #[test]
    fn basic_proactive_header() {
        let creds = Credentials::Basic {
            username: "alice".into(),
            password: "secret".into(),
        };
        let header = proactive_authorization(&creds).unwrap();
        assert_eq!(header, "Basic YWxpY2U6c2VjcmV0");
    }

    #[test]
    fn digest_never_proactive() {
        let creds = Credentials::Digest {
            username: "alice".into(),
            password: "secret".into(),
            algorithm: DigestAlgorithm::Md5,
        };
        assert!(proactive_authorization(&creds).is_none());
    }

    #[test]
    fn digest_response_matches_rfc_formula() {
        // RFC 2617-style manual computation, MD5, qop=auth.
        let creds = Credentials::Digest {
            username: "Mufasa".into(),
            password: "Circle Of Life".into(),
            algorithm: DigestAlgorithm::Md5,
        };
        let challenge = Challenge {
            scheme: "Digest".into(),
            realm: Some("testrealm@host.com".into()),
            nonce: Some("dcd98b7102dd2f0e8b11d0f600bfb0c093".into()),
            qop: Some("auth".into()),
            opaque: Some("5ccc069c403ebaf9f0171e9517f40e41".into()),
            algorithm: None,
            stale: false,
            error: None,
        };
        let mut state = DigestState::new();
        let header = compute_challenge_response(
            &creds,
            &mut state,
            "GET",
            "/dir/index.html",
            &challenge,
        )
        .unwrap();
        assert!(header.contains("username=\"Mufasa\""));
        assert!(header.contains("nc=00000001"));
        assert_eq!(state.nc, 1);
    }

    #[test]
    fn digest_nc_increments_per_call() {
        let creds = Credentials::Digest {
            username: "u".into(),
            password: "p".into(),
            algorithm: DigestAlgorithm::Md5,
        };
        let challenge = Challenge {
            scheme: "Digest".into(),
            realm: Some("r".into()),
            nonce: Some("n".into()),
            qop: Some("auth".into()),
            opaque: None,
            algorithm: None,
            stale: false,
            error: None,
        };
        let mut state = DigestState::new();
        compute_challenge_response(&creds, &mut state, "GET", "/x", &challenge);
        compute_challenge_response(&creds, &mut state, "GET", "/x", &challenge);
        assert_eq!(state.nc, 2);
    }

    #[test]
    fn oauth_refresh_needed_returns_none() {
        let creds = Credentials::OAuth {
            access_token: "expired-token".into(),
            refresh_token: Some("r".into()),
        };
        let challenge = Challenge {
            scheme: "Bearer".into(),
            realm: None,
            nonce: None,
            qop: None,
            opaque: None,
            algorithm: None,
            stale: false,
            error: Some("invalid_token".into()),
        };
        let mut state = DigestState::new();
        assert!(compute_challenge_response(&creds, &mut state, "GET", "/x", &challenge).is_none());
    }

    #[test]
    fn oauth_refresh_needed_requires_refresh_token_and_callback() {
        let challenge = Challenge {
            scheme: "Bearer".into(),
            realm: None,
            nonce: None,
            qop: None,
            opaque: None,
            algorithm: None,
            stale: false,
            error: Some("invalid_token".into()),
        };
        let with_refresh_token = Credentials::OAuth {
            access_token: "expired-token".into(),
            refresh_token: Some("r".into()),
        };
        let without_refresh_token = Credentials::OAuth {
            access_token: "expired-token".into(),
            refresh_token: None,
        };
        assert!(oauth_refresh_needed(&with_refresh_token, &challenge, true));
        assert!(!oauth_refresh_needed(&with_refresh_token, &challenge, false));
        assert!(!oauth_refresh_needed(&without_refresh_token, &challenge, true));

        let stale_password_challenge = Challenge { error: None, ..challenge.clone() };
        assert!(!oauth_refresh_needed(&with_refresh_token, &stale_password_challenge, true));
    }
}
