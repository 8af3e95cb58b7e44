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

//! # acsedge credential cache
//!
//! Authentication happens on every CPE POST, so organization credentials are served from an
//! in-process cache rather than the system of record. The cache is primed with a bulk load at
//! startup, kept current by a change feed of organization events, and (belt & braces) fully
//! re-loaded on a randomized ten-to-twenty-minute cadence in case feed messages were dropped.
//!
//! Readers far outnumber the single writer (feed events are applied serially), so the maps sit
//! behind an [RwLock]. Lookup is by URL path; a side map from organization id to path lets an
//! update that *moves* an organization to a new path retire the old entry.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{prelude::*, Backtrace};
use tokio::{sync::mpsc, sync::Notify, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    authn::{Authenticator, Variant},
    entities::{OrgId, OrgPath, Organization},
    storage::OrgStore,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("While loading organizations: {source}"))]
    Load {
        source: crate::storage::Error,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          configuration                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// How long a digest nonce stays valid before `challenge()` rotates it
    #[serde(rename = "nonce-ttl")]
    pub nonce_ttl: Duration,
    /// Lower bound on the full-refresh interval
    #[serde(rename = "refresh-min")]
    pub refresh_min: Duration,
    /// Upper bound on the full-refresh interval
    #[serde(rename = "refresh-max")]
    pub refresh_max: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            nonce_ttl: Duration::from_secs(300),
            refresh_min: Duration::from_secs(600),
            refresh_max: Duration::from_secs(1200),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        the cache proper                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A cached organization: the record plus the authenticator built from it.
///
/// Entries are immutable; an update builds a fresh entry & swaps it in, so a session worker
/// holding an `Arc<OrgEntry>` across an await point keeps a consistent view.
pub struct OrgEntry {
    pub org: Organization,
    pub authn: Authenticator,
}

impl OrgEntry {
    pub fn new(org: Organization, nonce_ttl: Duration) -> OrgEntry {
        let authn = Authenticator::for_org(
            &org,
            Variant::for_transport(org.https_enabled),
            nonce_ttl,
        );
        OrgEntry { org, authn }
    }
}

#[derive(Default)]
struct Maps {
    by_path: HashMap<OrgPath, Arc<OrgEntry>>,
    path_by_id: HashMap<OrgId, OrgPath>,
}

pub struct CredentialCache {
    cfg: Config,
    maps: RwLock<Maps>,
}

impl CredentialCache {
    pub fn new(cfg: Config) -> CredentialCache {
        CredentialCache {
            cfg,
            maps: RwLock::new(Maps::default()),
        }
    }

    /// Look up an organization by the URL path its CPEs post to.
    pub fn lookup(&self, path: &OrgPath) -> Option<Arc<OrgEntry>> {
        self.maps
            .read()
            .expect("lock poisoned")
            .by_path
            .get(path)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.maps.read().expect("lock poisoned").by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the entire cache contents with a fresh bulk load.
    pub async fn reload(&self, store: &dyn OrgStore) -> Result<()> {
        let orgs = store.load_all().await.context(LoadSnafu)?;
        let mut maps = Maps::default();
        for org in orgs {
            maps.path_by_id.insert(org.id.clone(), org.url_path.clone());
            maps.by_path.insert(
                org.url_path.clone(),
                Arc::new(OrgEntry::new(org, self.cfg.nonce_ttl)),
            );
        }
        let count = maps.by_path.len();
        *self.maps.write().expect("lock poisoned") = maps;
        info!("loaded {} organization(s)", count);
        Ok(())
    }

    fn upsert(&self, org: Organization) {
        let mut maps = self.maps.write().expect("lock poisoned");
        // If this organization moved to a new URL path, retire the old entry.
        if let Some(old_path) = maps.path_by_id.get(&org.id) {
            if *old_path != org.url_path {
                let old_path = old_path.clone();
                maps.by_path.remove(&old_path);
            }
        }
        maps.path_by_id.insert(org.id.clone(), org.url_path.clone());
        maps.by_path.insert(
            org.url_path.clone(),
            Arc::new(OrgEntry::new(org, self.cfg.nonce_ttl)),
        );
    }

    fn delete(&self, id: &OrgId) {
        let mut maps = self.maps.write().expect("lock poisoned");
        if let Some(path) = maps.path_by_id.remove(id) {
            maps.by_path.remove(&path);
        }
    }

    /// Apply one change-feed event.
    ///
    /// Events are applied last-write-wins & idempotently: re-applying an upsert, or deleting an
    /// organization already gone, is a no-op. A malformed event is logged & dropped-- the
    /// periodic full refresh will repair any resulting drift.
    pub fn apply(&self, event: &Value) {
        match event.get("type").and_then(Value::as_str) {
            Some("upsert") => match event
                .get("organization")
                .map(|org| serde_json::from_value::<Organization>(org.clone()))
            {
                Some(Ok(org)) => {
                    debug!("upserting organization {}", org.id);
                    self.upsert(org);
                }
                _ => warn!("dropping malformed upsert event: {}", event),
            },
            Some("delete") => match event.get("id").and_then(Value::as_str) {
                Some(id) => {
                    debug!("deleting organization {}", id);
                    self.delete(&OrgId::new(id));
                }
                None => warn!("dropping malformed delete event: {}", event),
            },
            _ => warn!("dropping change event with no recognized type: {}", event),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        background tasks                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Drain the change feed into the cache; runs until the sender side is dropped.
pub fn spawn_subscriber(
    cache: Arc<CredentialCache>,
    mut feed: mpsc::Receiver<Value>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = feed.recv().await {
            cache.apply(&event);
        }
        debug!("change feed closed; subscriber exiting");
    })
}

/// Periodically re-load the cache in full, at a randomized interval.
///
/// The jitter keeps a fleet of edge nodes from stampeding the store in lock-step.
pub fn spawn_refresh(
    cache: Arc<CredentialCache>,
    store: Arc<dyn OrgStore>,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    let (min, max) = (cache.cfg.refresh_min, cache.cfg.refresh_max);
    tokio::spawn(async move {
        loop {
            let interval = if max > min {
                rand::thread_rng().gen_range(min..max)
            } else {
                min
            };
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(err) = cache.reload(store.as_ref()).await {
                        // Keep serving the last-known-good contents.
                        error!("periodic refresh failed: {}", err);
                    }
                },
                _ = shutdown.notified() => {
                    debug!("refresh task shutting down");
                    break;
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::storage::MemStore;

    fn org(id: &str, path: &str, password: &str) -> Value {
        json!({
            "id": id,
            "url-path": path,
            "acs-username": id,
            "acs-password": password,
            "https-enabled": true,
        })
    }

    #[tokio::test]
    async fn reload_primes_the_cache() {
        let store = MemStore::default();
        store.add(serde_json::from_value(org("acme", "acme", "s3cr3t")).unwrap());
        store.add(serde_json::from_value(org("umbrella", "umb", "hive")).unwrap());

        let cache = CredentialCache::new(Config::default());
        assert!(cache.is_empty());
        cache.reload(&store).await.unwrap();
        assert_eq!(2, cache.len());

        let entry = cache.lookup(&"acme".parse().unwrap()).unwrap();
        assert_eq!("acme", entry.org.id.as_ref());
        assert!(cache.lookup(&"nope".parse().unwrap()).is_none());
    }

    #[test]
    fn events_apply_idempotently() {
        let cache = CredentialCache::new(Config::default());

        let upsert = json!({"type": "upsert", "organization": org("acme", "acme", "s3cr3t")});
        cache.apply(&upsert);
        cache.apply(&upsert);
        assert_eq!(1, cache.len());

        // Latest write wins: same org, new password.
        cache.apply(&json!({"type": "upsert", "organization": org("acme", "acme", "n3w")}));
        let entry = cache.lookup(&"acme".parse().unwrap()).unwrap();
        assert!(entry.authn.verify(&format!(
            "Basic {}",
            base64::Engine::encode(&base64::prelude::BASE64_STANDARD, "acme:n3w")
        )));

        let delete = json!({"type": "delete", "id": "acme"});
        cache.apply(&delete);
        cache.apply(&delete);
        assert!(cache.is_empty());
    }

    #[test]
    fn a_moved_org_retires_its_old_path() {
        let cache = CredentialCache::new(Config::default());
        cache.apply(&json!({"type": "upsert", "organization": org("acme", "acme", "s3cr3t")}));
        cache.apply(&json!({"type": "upsert", "organization": org("acme", "acme-west", "s3cr3t")}));
        assert_eq!(1, cache.len());
        assert!(cache.lookup(&"acme".parse().unwrap()).is_none());
        assert!(cache.lookup(&"acme-west".parse().unwrap()).is_some());
    }

    #[test]
    fn malformed_events_are_dropped() {
        let cache = CredentialCache::new(Config::default());
        cache.apply(&json!({"type": "upsert", "organization": {"id": "acme"}}));
        cache.apply(&json!({"type": "delete"}));
        cache.apply(&json!({"color": "mauve"}));
        cache.apply(&json!(42));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn the_subscriber_drains_the_feed() {
        let cache = Arc::new(CredentialCache::new(Config::default()));
        let (tx, rx) = mpsc::channel(16);
        let handle = spawn_subscriber(cache.clone(), rx);

        tx.send(json!({"type": "upsert", "organization": org("acme", "acme", "s3cr3t")}))
            .await
            .unwrap();
        drop(tx);
        handle.await.unwrap();
        assert_eq!(1, cache.len());
    }
}
