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

use futures::future::BoxFuture;
use libtest_mimic::Failed;
use serde::Deserialize;
use snafu::{prelude::*, IntoError};
use tap::Pipe;

use acsedge_test::EdgeFixture;

use std::{env, fs};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to parse {pth}: {source}"))]
    De {
        pth: String,
        source: toml::de::Error,
    },
    #[snafu(display("Failed to read ACSEDGE_TEST_CONFIG: {source}"))]
    Env { source: std::env::VarError },
    #[snafu(display("Failed to read {pth}: {source}"))]
    Read { pth: String, source: std::io::Error },
}

type Result<T> = std::result::Result<T, Error>;

/// Common test configuration
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub logging: bool,
    /// Default log filter; overridable via `RUST_LOG` as usual
    #[serde(rename = "log-level")]
    pub log_level: String,
}

impl Configuration {
    /// Obtain a [Configuration]
    ///
    /// Check the `ACSEDGE_TEST_CONFIG` environment variable; if defined & non-empty, attempt to
    /// parse a [Configuration] from the file named therein; else return a default instance.
    pub fn new() -> Result<Configuration> {
        match env::var("ACSEDGE_TEST_CONFIG") {
            Ok(f) => fs::read_to_string(&f)
                .context(ReadSnafu { pth: f.clone() })?
                .pipe(|s| toml::from_str::<Configuration>(&s))
                .context(DeSnafu { pth: f.clone() }),
            Err(env::VarError::NotPresent) => Ok(Configuration::default()),
            Err(err) => Err(EnvSnafu.into_error(err)),
        }
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            logging: false,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct Test {
    pub name: &'static str,
    pub test_fn: fn(fixture: EdgeFixture) -> BoxFuture<'static, std::result::Result<(), Failed>>,
}

inventory::collect!(Test);
