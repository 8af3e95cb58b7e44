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

//! # acsedge organization storage
//!
//! The system of record for organizations lives elsewhere; this process only ever *reads* it--
//! once in bulk at startup (and on periodic refresh), with incremental updates arriving over
//! the change feed. [OrgStore] abstracts the bulk read so that the credential cache can be
//! exercised against an in-memory store in tests.

use std::{
    path::{Path, PathBuf},
    sync::RwLock,
};

use async_trait::async_trait;
use snafu::{prelude::*, Backtrace};

use crate::entities::Organization;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Storage backend error: {source}"))]
    Backend {
        source: Box<dyn std::error::Error + Send + Sync>,
        backtrace: Backtrace,
    },
    #[snafu(display("While reading {}: {source}", path.display()))]
    Io {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("While parsing {}: {source}", path.display()))]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        the OrgStore trait                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Read-only access to the organization system of record.
///
/// Object-safe; held as `Arc<dyn OrgStore>` by the credential cache.
#[async_trait]
pub trait OrgStore: Send + Sync {
    /// Every organization currently on record.
    async fn load_all(&self) -> Result<Vec<Organization>>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            FileStore                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An [OrgStore] backed by a JSON file holding an array of organization records.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> FileStore {
        FileStore {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl OrgStore for FileStore {
    async fn load_all(&self) -> Result<Vec<Organization>> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .context(IoSnafu {
                path: self.path.clone(),
            })?;
        serde_json::from_str(&text).context(MalformedSnafu {
            path: self.path.clone(),
        })
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            MemStore                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An in-memory [OrgStore]; test & demo use.
#[derive(Default)]
pub struct MemStore {
    orgs: RwLock<Vec<Organization>>,
}

impl MemStore {
    pub fn new(orgs: Vec<Organization>) -> MemStore {
        MemStore {
            orgs: RwLock::new(orgs),
        }
    }
    pub fn add(&self, org: Organization) {
        self.orgs.write().expect("lock poisoned").push(org);
    }
}

#[async_trait]
impl OrgStore for MemStore {
    async fn load_all(&self) -> Result<Vec<Organization>> {
        Ok(self.orgs.read().expect("lock poisoned").clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_store_reads_a_seed_file() {
        let dir = std::env::temp_dir().join(format!("acsedge-test-{:08x}", rand::random::<u32>()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("orgs.json");
        std::fs::write(
            &path,
            r#"[{"id":"acme","url-path":"acme","acs-username":"acme","acs-password":"s3cr3t"}]"#,
        )
        .unwrap();

        let store = FileStore::new(&path);
        let orgs = store.load_all().await.unwrap();
        assert_eq!(1, orgs.len());
        assert_eq!("acme", orgs[0].id.as_ref());
        assert!(!orgs[0].https_enabled);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn file_store_propagates_missing_files() {
        let store = FileStore::new("/no/such/file.json");
        assert!(store.load_all().await.is_err());
    }
}
