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

//! # acsedge models
//!
//! Foundational types for the session edge: organizations (tenants), device keys, worker
//! indices and the sticky token that binds a CWMP session to its owning worker.

use std::{fmt::Display, ops::Deref, str::FromStr};

use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};
use snafu::{prelude::*, Backtrace};

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{text} is not a valid device key"))]
    BadCpeKey { text: String, backtrace: Backtrace },
    #[snafu(display("{text} is not a valid organization URL path segment"))]
    BadOrgPath { text: String, backtrace: Backtrace },
    #[snafu(display("{text} is not a valid sticky token"))]
    BadStickyToken { text: String, backtrace: Backtrace },
    #[snafu(display("{text} is not a valid worker index: {source}"))]
    BadWorkerIndex {
        text: String,
        source: std::num::ParseIntError,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

fn mk_serde_de_err<'de, D: serde::Deserializer<'de>>(err: impl std::error::Error) -> D::Error {
    <D::Error as serde::de::Error>::custom(format!("{:?}", err))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Identifiers                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Organization (tenant) identifier; opaque to the edge, assigned by the organization store.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct OrgId(String);

impl OrgId {
    pub fn new(s: &str) -> OrgId {
        OrgId(s.to_string())
    }
}

impl AsRef<str> for OrgId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for OrgId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

lazy_static! {
    static ref ORG_PATH: Regex = Regex::new("^[A-Za-z0-9_-]+$").unwrap(/* known good */);
}

/// The public URL path segment under which an organization's CPEs check in
/// (`POST /cwmp/{org-path}`). Also the index key in the credential cache.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct OrgPath(String);

impl OrgPath {
    pub fn new(s: &str) -> Result<OrgPath> {
        ensure!(
            ORG_PATH.is_match(s),
            BadOrgPathSnafu {
                text: s.to_string()
            }
        );
        Ok(OrgPath(s.to_string()))
    }
}

impl AsRef<str> for OrgPath {
    fn as_ref(&self) -> &str {
        self.deref()
    }
}

impl Deref for OrgPath {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for OrgPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OrgPath {
    type Err = Error;

    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        OrgPath::new(s)
    }
}

// Implement `Deserialize` by hand to fail if the serialized value isn't a legit `OrgPath`
impl<'de> Deserialize<'de> for OrgPath {
    fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        OrgPath::new(&s).map_err(mk_serde_de_err::<'de, D>)
    }
}

lazy_static! {
    static ref CPE_KEY: Regex =
        Regex::new("^[A-Za-z0-9]+-[0-9A-Fa-f]{6}-[A-Za-z0-9]+$").unwrap(/* known good */);
}

/// Device key: `{org-id}-{OUI}-{serial}`. Uniquely identifies one CPE across the fleet; the
/// OUI & serial come from the device's Inform.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct CpeKey(String);

impl CpeKey {
    pub fn new(s: &str) -> Result<CpeKey> {
        ensure!(
            CPE_KEY.is_match(s),
            BadCpeKeySnafu {
                text: s.to_string()
            }
        );
        Ok(CpeKey(s.to_string()))
    }
    pub fn from_parts(org: &OrgId, oui: &str, serial: &str) -> Result<CpeKey> {
        CpeKey::new(&format!("{}-{}-{}", org, oui, serial))
    }
}

impl AsRef<str> for CpeKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for CpeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for CpeKey {
    fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        CpeKey::new(&s).map_err(mk_serde_de_err::<'de, D>)
    }
}

/// Index of a session worker within the (fixed-size) pool.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct WorkerIndex(pub usize);

impl Display for WorkerIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Organization                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An organization (tenant) record, as read from the organization store or a change event.
///
/// The ACS username/password are the credentials the organization's CPEs present when checking
/// in; they are *recoverable* (digest authentication needs the plaintext), so they're held as
/// [SecretString]s rather than hashes.
// Deserialize-only; `SecretString` intentionally doesn't implement `Serialize`.
#[derive(Clone, Debug, Deserialize)]
pub struct Organization {
    pub id: OrgId,
    #[serde(rename = "url-path")]
    pub url_path: OrgPath,
    #[serde(rename = "acs-username")]
    pub acs_username: String,
    #[serde(rename = "acs-password")]
    pub acs_password: SecretString,
    #[serde(rename = "https-enabled", default)]
    pub https_enabled: bool,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     zero-touch credentials                                     //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The fixed provisioning secret presented by factory-fresh devices.
pub static ZERO_TOUCH_PASSWORD: &str = "activate-cxnk";

lazy_static! {
    // `{OUI}-{ONT|ENT}-{FSAN}`, where the FSAN is "CXNK" followed by 8 hex digits.
    static ref ZERO_TOUCH_USERNAME: Regex =
        Regex::new("^[0-9A-Fa-f]{6}-(ONT|ENT)-CXNK[0-9A-Fa-f]{8}$").unwrap(/* known good */);
}

/// Does `username` match the zero-touch bootstrap naming pattern?
pub fn is_zero_touch_username(username: &str) -> bool {
    ZERO_TOUCH_USERNAME.is_match(username)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          sticky token                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The session-affinity cookie value.
///
/// Wire format is `{discriminator}~{millis}~{host}~{worker}`; only the final segment is
/// interpreted on the way back in (it routes the request to the owning worker), which means the
/// token as a whole can stay opaque to the CPE. The discriminator keeps tokens minted in the
/// same millisecond distinct.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct StickyToken {
    text: String,
    worker: WorkerIndex,
}

impl StickyToken {
    /// Mint a fresh token bound to `worker`.
    pub fn mint(host: &str, worker: WorkerIndex) -> StickyToken {
        let disc: u32 = rand::random();
        StickyToken {
            text: format!(
                "{:08x}~{}~{}~{}",
                disc,
                Utc::now().timestamp_millis(),
                host,
                worker
            ),
            worker,
        }
    }
    pub fn worker(&self) -> WorkerIndex {
        self.worker
    }
}

impl AsRef<str> for StickyToken {
    fn as_ref(&self) -> &str {
        &self.text
    }
}

impl Display for StickyToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.text)
    }
}

impl FromStr for StickyToken {
    type Err = Error;

    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        // Four `~`-separated segments, the last of which must parse as a worker index.
        let segments: Vec<&str> = s.split('~').collect();
        ensure!(
            segments.len() == 4 && segments.iter().all(|seg| !seg.is_empty()),
            BadStickyTokenSnafu {
                text: s.to_string()
            }
        );
        let worker = segments[3]
            .parse::<usize>()
            .context(BadWorkerIndexSnafu {
                text: segments[3].to_string(),
            })?;
        Ok(StickyToken {
            text: s.to_string(),
            worker: WorkerIndex(worker),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn org_paths() {
        assert!(OrgPath::new("acme").is_ok());
        assert!(OrgPath::new("acme-west_2").is_ok());
        assert!(OrgPath::new("").is_err());
        assert!(OrgPath::new("acme/west").is_err());
    }

    #[test]
    fn cpe_keys() {
        assert!(CpeKey::new("org1-A1B2C3-CXNK0011AABB").is_ok());
        assert!(CpeKey::new("no-oui-here").is_err());
        let key = CpeKey::from_parts(&OrgId::new("org1"), "A1B2C3", "CXNK0011AABB").unwrap();
        assert_eq!(key.as_ref(), "org1-A1B2C3-CXNK0011AABB");
    }

    #[test]
    fn zero_touch_usernames() {
        assert!(is_zero_touch_username("A1B2C3-ONT-CXNK0011AABB"));
        assert!(is_zero_touch_username("a1b2c3-ENT-CXNKdeadbeef"));
        assert!(!is_zero_touch_username("A1B2C3-FOO-CXNK0011AABB"));
        assert!(!is_zero_touch_username("A1B2C3-ONT-XXXX0011AABB"));
        assert!(!is_zero_touch_username("acme"));
    }

    #[test]
    fn sticky_tokens() {
        let token = StickyToken::mint("edge-1", WorkerIndex(3));
        let parsed = token.to_string().parse::<StickyToken>().unwrap();
        assert_eq!(parsed.worker(), WorkerIndex(3));
        assert_eq!(parsed, token);

        assert!("".parse::<StickyToken>().is_err());
        assert!("a~b~c".parse::<StickyToken>().is_err());
        assert!("a~b~c~notanumber".parse::<StickyToken>().is_err());
    }
}
