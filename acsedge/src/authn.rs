// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of acsedge.
//
// acsedge is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// acsedge is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with acsedge.  If not,
// see <http://www.gnu.org/licenses/>.

//! # acsedge authentication
//!
//! Every organization authenticates its CPEs with either HTTP "basic" or RFC 2617 digest
//! authentication-- a deployment-wide choice (TLS terminated in front of us ⇒ basic; plaintext
//! ⇒ digest, so the password never rides the wire). On top of either scheme sits the zero-touch
//! bypass: a factory-fresh device knows no organization credentials, only its own identity and
//! a fixed provisioning secret, and must be let in far enough to be claimed.
//!
//! The verification surface is deliberately boolean: `verify` & `is_zero_touch` never error.
//! Whatever went wrong parsing a header, the caller's next move is the same-- re-challenge.

use std::{
    sync::RwLock,
    time::{Duration, Instant},
};

use base64::{prelude::BASE64_STANDARD, Engine};
use md5::{Digest, Md5};
use secrecy::{ExposeSecret, SecretString};
use snafu::{prelude::*, Backtrace};
use tap::Pipe;

use crate::entities::{is_zero_touch_username, Organization, ZERO_TOUCH_PASSWORD};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

// Internal only; the public surface converts all of these to `false`.
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to decode base64 field: {source}"))]
    BadBase64Encoding {
        text: String,
        source: base64::DecodeError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to find a colon in '{text}'"))]
    MissingColon { text: String, backtrace: Backtrace },
    #[snafu(display("{field} missing from digest header"))]
    MissingDigestField { field: String, backtrace: Backtrace },
    #[snafu(display("The text was not valid UTF-8"))]
    NotUtf8 {
        source: std::string::FromUtf8Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Authorization scheme {scheme} not supported"))]
    UnsupportedAuthScheme {
        scheme: String,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        header parsing                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Decode a `Basic` Authorization header into (username, password).
fn parse_basic(header: &str) -> Result<(String, String)> {
    let payload = header
        .strip_prefix("Basic ")
        .context(UnsupportedAuthSchemeSnafu {
            scheme: header.split_whitespace().next().unwrap_or("").to_string(),
        })?;
    BASE64_STANDARD
        .decode(payload.trim())
        .context(BadBase64EncodingSnafu {
            text: payload.to_owned(),
        })?
        .pipe(String::from_utf8)
        .context(NotUtf8Snafu)?
        .split_once(':')
        .context(MissingColonSnafu {
            text: payload.to_string(),
        })?
        .pipe(|(u, p)| Ok((u.to_string(), p.to_string())))
}

/// The fields of a `Digest` Authorization header we care about.
#[derive(Debug, Default)]
struct DigestFields {
    username: String,
    realm: String,
    nonce: String,
    uri: String,
    response: String,
    qop: Option<String>,
    nc: Option<String>,
    cnonce: Option<String>,
}

fn parse_digest(header: &str) -> Result<DigestFields> {
    let payload = header
        .strip_prefix("Digest ")
        .context(UnsupportedAuthSchemeSnafu {
            scheme: header.split_whitespace().next().unwrap_or("").to_string(),
        })?;
    let mut fields = DigestFields::default();
    for part in payload.split(',') {
        if let Some((key, value)) = part.split_once('=') {
            let value = value.trim().trim_matches('"').to_string();
            match key.trim() {
                "username" => fields.username = value,
                "realm" => fields.realm = value,
                "nonce" => fields.nonce = value,
                "uri" => fields.uri = value,
                "response" => fields.response = value,
                "qop" => fields.qop = Some(value),
                "nc" => fields.nc = Some(value),
                "cnonce" => fields.cnonce = Some(value),
                _ => (),
            }
        }
    }
    ensure!(
        !fields.username.is_empty(),
        MissingDigestFieldSnafu {
            field: "username".to_string()
        }
    );
    ensure!(
        !fields.response.is_empty(),
        MissingDigestFieldSnafu {
            field: "response".to_string()
        }
    );
    Ok(fields)
}

fn md5_hex(text: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(text.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// The RFC 2617 response computation, shared by server-side verification & the client side of
/// connection requests.
fn digest_response(
    username: &str,
    password: &str,
    realm: &str,
    method: &str,
    uri: &str,
    nonce: &str,
    qop: Option<&str>,
    nc: Option<&str>,
    cnonce: Option<&str>,
) -> String {
    let ha1 = md5_hex(&format!("{}:{}:{}", username, realm, password));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));
    match qop {
        Some(qop) => md5_hex(&format!(
            "{}:{}:{}:{}:{}:{}",
            ha1,
            nonce,
            nc.unwrap_or(""),
            cnonce.unwrap_or(""),
            qop,
            ha2
        )),
        None => md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2)),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      standalone zero-touch                                     //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Zero-touch check with no organization record in hand.
///
/// A factory-fresh device may check in before anyone has provisioned its organization; the
/// first-contact bootstrap admits it on the strength of its identity-derived username & the
/// fixed secret alone. Only the basic scheme can be checked without an organization (digest
/// needs a realm & nonce we'd have issued).
pub fn is_zero_touch_credential(header: &str) -> bool {
    parse_basic(header)
        .map(|(username, password)| {
            is_zero_touch_username(&username) && password == ZERO_TOUCH_PASSWORD
        })
        .unwrap_or(false)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         authenticators                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Which authentication scheme this deployment uses; chosen once, at credential-cache
/// construction, from the HTTPS-enabled flag.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Variant {
    Basic,
    Digest,
}

impl Variant {
    pub fn for_transport(https_enabled: bool) -> Variant {
        if https_enabled {
            Variant::Basic
        } else {
            Variant::Digest
        }
    }
}

/// A per-organization basic authenticator: the challenge *is* the expected header, so verify
/// reduces to string equality.
#[derive(Debug)]
pub struct BasicAuthenticator {
    expected: String,
}

impl BasicAuthenticator {
    fn new(org: &Organization) -> BasicAuthenticator {
        BasicAuthenticator {
            expected: format!(
                "Basic {}",
                BASE64_STANDARD.encode(format!(
                    "{}:{}",
                    org.acs_username,
                    org.acs_password.expose_secret()
                ))
            ),
        }
    }
    fn challenge(&self) -> String {
        self.expected.clone()
    }
    fn verify(&self, header: &str) -> bool {
        header.trim() == self.expected
    }
    fn is_zero_touch(&self, header: &str) -> bool {
        is_zero_touch_credential(header)
    }
}

struct IssuedNonce {
    value: String,
    issued: Instant,
}

fn fresh_nonce() -> IssuedNonce {
    IssuedNonce {
        value: format!("{:032x}", rand::random::<u128>()),
        issued: Instant::now(),
    }
}

/// A per-organization digest authenticator.
///
/// The nonce rotates: `challenge()` mints a new one whenever the current nonce is older than
/// the configured TTL, and `verify()` accepts only the current nonce. A CPE presenting a stale
/// nonce fails verification, draws a 401 carrying the fresh nonce, and recovers on its next
/// POST-- one extra round trip, in exchange for bounding the replay window.
pub struct DigestAuthenticator {
    realm: String,
    domain: String,
    username: String,
    password: SecretString,
    nonce_ttl: Duration,
    nonce: RwLock<IssuedNonce>,
}

impl DigestAuthenticator {
    fn new(org: &Organization, nonce_ttl: Duration) -> DigestAuthenticator {
        DigestAuthenticator {
            realm: org.id.to_string(),
            domain: format!("/cwmp/{}", org.url_path),
            username: org.acs_username.clone(),
            password: org.acs_password.clone(),
            nonce_ttl,
            nonce: RwLock::new(fresh_nonce()),
        }
    }
    fn current_nonce(&self) -> String {
        self.nonce.read().expect("lock poisoned").value.clone()
    }
    fn challenge(&self) -> String {
        {
            let nonce = self.nonce.read().expect("lock poisoned");
            if nonce.issued.elapsed() < self.nonce_ttl {
                return self.format_challenge(&nonce.value);
            }
        }
        let mut nonce = self.nonce.write().expect("lock poisoned");
        // Re-check under the write lock; another challenger may have rotated already.
        if nonce.issued.elapsed() >= self.nonce_ttl {
            *nonce = fresh_nonce();
        }
        self.format_challenge(&nonce.value)
    }
    fn format_challenge(&self, nonce: &str) -> String {
        format!(
            r#"Digest realm="{}", domain="{}", algorithm=MD5, qop="auth", nonce="{}", opaque="{}""#,
            self.realm,
            self.domain,
            nonce,
            md5_hex(nonce)
        )
    }
    fn verify_with_password(&self, header: &str, username: &str, password: &str) -> bool {
        let fields = match parse_digest(header) {
            Ok(fields) => fields,
            Err(_) => return false,
        };
        if fields.username != username || fields.nonce != self.current_nonce() {
            return false;
        }
        let expected = digest_response(
            username,
            password,
            &self.realm,
            "POST",
            &fields.uri,
            &fields.nonce,
            fields.qop.as_deref(),
            fields.nc.as_deref(),
            fields.cnonce.as_deref(),
        );
        expected == fields.response
    }
    fn verify(&self, header: &str) -> bool {
        self.verify_with_password(header, &self.username.clone(), self.password.expose_secret())
    }
    fn is_zero_touch(&self, header: &str) -> bool {
        let username = match parse_digest(header) {
            Ok(fields) => fields.username,
            Err(_) => return false,
        };
        is_zero_touch_username(&username)
            && self.verify_with_password(header, &username, ZERO_TOUCH_PASSWORD)
    }
}

/// The per-organization authentication strategy: one of these per tenant, rebuilt from scratch
/// whenever the organization record changes (never mutated in place-- the credential cache
/// swaps the whole instance).
pub enum Authenticator {
    Basic(BasicAuthenticator),
    Digest(DigestAuthenticator),
}

impl Authenticator {
    pub fn for_org(org: &Organization, variant: Variant, nonce_ttl: Duration) -> Authenticator {
        match variant {
            Variant::Basic => Authenticator::Basic(BasicAuthenticator::new(org)),
            Variant::Digest => Authenticator::Digest(DigestAuthenticator::new(org, nonce_ttl)),
        }
    }
    /// The `WWW-Authenticate` header value to send with a 401.
    pub fn challenge(&self) -> String {
        match self {
            Authenticator::Basic(basic) => basic.challenge(),
            Authenticator::Digest(digest) => digest.challenge(),
        }
    }
    /// Does `header` carry this organization's credentials?
    pub fn verify(&self, header: &str) -> bool {
        match self {
            Authenticator::Basic(basic) => basic.verify(header),
            Authenticator::Digest(digest) => digest.verify(header),
        }
    }
    /// Does `header` carry a zero-touch bootstrap credential?
    pub fn is_zero_touch(&self, header: &str) -> bool {
        match self {
            Authenticator::Basic(basic) => basic.is_zero_touch(header),
            Authenticator::Digest(digest) => digest.is_zero_touch(header),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                             client-side digest (connection requests)                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Answer a `WWW-Authenticate: Digest` challenge; the CPE is the server, here.
///
/// Returns None if the challenge isn't a digest challenge we can answer.
pub fn answer_digest_challenge(
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
    challenge: &str,
) -> Option<String> {
    let payload = challenge.strip_prefix("Digest ")?;
    let mut realm = String::new();
    let mut nonce = String::new();
    let mut qop: Option<String> = None;
    let mut opaque: Option<String> = None;
    for part in payload.split(',') {
        if let Some((key, value)) = part.split_once('=') {
            let value = value.trim().trim_matches('"').to_string();
            match key.trim() {
                "realm" => realm = value,
                "nonce" => nonce = value,
                "qop" => qop = Some(value),
                "opaque" => opaque = Some(value),
                _ => (),
            }
        }
    }
    if nonce.is_empty() {
        return None;
    }
    let qop = qop.map(|q| {
        // The server may offer "auth,auth-int"; we do "auth".
        if q.split(',').any(|q| q.trim() == "auth") {
            "auth".to_string()
        } else {
            q
        }
    });
    let cnonce = format!("{:016x}", rand::random::<u64>());
    let nc = "00000001";
    let response = digest_response(
        username,
        password,
        &realm,
        method,
        uri,
        &nonce,
        qop.as_deref(),
        Some(nc),
        Some(&cnonce),
    );
    let mut header = format!(
        r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}""#,
        username, realm, nonce, uri, response
    );
    if let Some(qop) = qop {
        header.push_str(&format!(r#", qop={}, nc={}, cnonce="{}""#, qop, nc, cnonce));
    }
    if let Some(opaque) = opaque {
        header.push_str(&format!(r#", opaque="{}""#, opaque));
    }
    Some(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::entities::{OrgId, OrgPath};

    fn acme() -> Organization {
        Organization {
            id: OrgId::new("acme"),
            url_path: OrgPath::new("acme").unwrap(),
            acs_username: "acme".to_string(),
            acs_password: "s3cr3t".to_string().into(),
            https_enabled: true,
        }
    }

    #[test]
    fn basic_accepts_exactly_the_org_credentials() {
        let authn = Authenticator::for_org(&acme(), Variant::Basic, Duration::from_secs(300));
        assert!(authn.verify("Basic YWNtZTpzM2NyM3Q="));
        assert!(!authn.verify("Basic d3Jvbmc="));
        assert!(!authn.verify("Bearer whatever"));
        assert_eq!(authn.challenge(), "Basic YWNtZTpzM2NyM3Q=");
    }

    #[test]
    fn basic_zero_touch() {
        let authn = Authenticator::for_org(&acme(), Variant::Basic, Duration::from_secs(300));
        let header = format!(
            "Basic {}",
            BASE64_STANDARD.encode("A1B2C3-ONT-CXNK0011AABB:activate-cxnk")
        );
        assert!(authn.is_zero_touch(&header));
        assert!(!authn.verify(&header));

        let wrong_secret = format!(
            "Basic {}",
            BASE64_STANDARD.encode("A1B2C3-ONT-CXNK0011AABB:wrong")
        );
        assert!(!authn.is_zero_touch(&wrong_secret));

        let wrong_name = format!("Basic {}", BASE64_STANDARD.encode("acme:activate-cxnk"));
        assert!(!authn.is_zero_touch(&wrong_name));
    }

    #[test]
    fn standalone_zero_touch() {
        let header = format!(
            "Basic {}",
            BASE64_STANDARD.encode("A1B2C3-ENT-CXNKDEADBEEF:activate-cxnk")
        );
        assert!(is_zero_touch_credential(&header));
        assert!(!is_zero_touch_credential("Basic YWNtZTpzM2NyM3Q="));
        assert!(!is_zero_touch_credential("garbage"));
    }

    fn nonce_from_challenge(challenge: &str) -> String {
        challenge
            .split(',')
            .find_map(|part| {
                let (key, value) = part.split_once('=')?;
                (key.trim() == "nonce").then(|| value.trim().trim_matches('"').to_string())
            })
            .unwrap()
    }

    #[test]
    fn digest_round_trip() {
        let authn = Authenticator::for_org(&acme(), Variant::Digest, Duration::from_secs(300));
        let challenge = authn.challenge();
        assert!(challenge.starts_with("Digest realm=\"acme\""));

        // Play the CPE: answer the challenge with the org's credentials.
        let header =
            answer_digest_challenge("acme", "s3cr3t", "POST", "/cwmp/acme", &challenge).unwrap();
        assert!(authn.verify(&header));

        // A wrong password computes a different response.
        let header =
            answer_digest_challenge("acme", "wrong", "POST", "/cwmp/acme", &challenge).unwrap();
        assert!(!authn.verify(&header));
    }

    #[test]
    fn digest_zero_touch() {
        let authn = Authenticator::for_org(&acme(), Variant::Digest, Duration::from_secs(300));
        let challenge = authn.challenge();
        let header = answer_digest_challenge(
            "A1B2C3-ONT-CXNK0011AABB",
            ZERO_TOUCH_PASSWORD,
            "POST",
            "/cwmp/acme",
            &challenge,
        )
        .unwrap();
        assert!(authn.is_zero_touch(&header));
        assert!(!authn.verify(&header));
    }

    #[test]
    fn digest_nonce_rotates_after_ttl() {
        let authn = Authenticator::for_org(&acme(), Variant::Digest, Duration::from_millis(10));
        let first = authn.challenge();
        let header =
            answer_digest_challenge("acme", "s3cr3t", "POST", "/cwmp/acme", &first).unwrap();
        assert!(authn.verify(&header));

        std::thread::sleep(Duration::from_millis(20));
        let second = authn.challenge();
        assert_ne!(nonce_from_challenge(&first), nonce_from_challenge(&second));
        // The response computed against the stale nonce no longer verifies.
        assert!(!authn.verify(&header));
    }

    #[test]
    fn digest_nonce_stable_within_ttl() {
        let authn = Authenticator::for_org(&acme(), Variant::Digest, Duration::from_secs(300));
        assert_eq!(
            nonce_from_challenge(&authn.challenge()),
            nonce_from_challenge(&authn.challenge())
        );
    }
}
