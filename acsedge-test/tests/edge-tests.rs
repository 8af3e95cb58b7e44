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

// The edge stands up in-process, once, & every test drives it over loopback HTTP. Since all
// tests share the one fixture (one worker pool, one credential cache), each test uses its own
// device serials & they run on a single test thread.

use std::{io, process::ExitCode, sync::Arc};

use futures::FutureExt;
use itertools::Itertools;
use libtest_mimic::{Arguments, Trial};
use snafu::{ResultExt, Snafu};
use tokio::runtime::Runtime;
use tracing::debug;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

use acsedge_test::{connreq, sessions, spawn_edge, test_healthcheck};

use common::{Configuration, Test};

mod common;

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("Error obtaining test configuration: {source}"))]
    Configuration { source: common::Error },
    #[snafu(display("Failed to parse the log filter: {source}"))]
    Filter {
        source: tracing_subscriber::filter::ParseError,
    },
    #[snafu(display("Failed to set the global tracing subscriber: {source}"))]
    SetGlobalDefault {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
}

type Result<T> = std::result::Result<T, Error>;

inventory::submit!(Test {
    name: "healthcheck",
    test_fn: |fx| test_healthcheck(fx).boxed()
});

inventory::submit!(Test {
    name: "session_round_trip",
    test_fn: |fx| sessions::test_session_round_trip(fx).boxed()
});

inventory::submit!(Test {
    name: "challenge_flow",
    test_fn: |fx| sessions::test_challenge_flow(fx).boxed()
});

inventory::submit!(Test {
    name: "zero_touch_bootstrap",
    test_fn: |fx| sessions::test_zero_touch_bootstrap(fx).boxed()
});

inventory::submit!(Test {
    name: "malformed_post",
    test_fn: |fx| sessions::test_malformed_post(fx).boxed()
});

inventory::submit!(Test {
    name: "bad_cookies",
    test_fn: |fx| sessions::test_bad_cookies(fx).boxed()
});

inventory::submit!(Test {
    name: "sticky_affinity",
    test_fn: |fx| sessions::test_sticky_affinity(fx).boxed()
});

inventory::submit!(Test {
    name: "rpc_queue",
    test_fn: |fx| sessions::test_rpc_queue(fx).boxed()
});

inventory::submit!(Test {
    name: "change_feed",
    test_fn: |fx| sessions::test_change_feed(fx).boxed()
});

inventory::submit!(Test {
    name: "connreq_delivery",
    test_fn: |fx| connreq::test_connreq_delivery(fx).boxed()
});

inventory::submit!(Test {
    name: "connreq_failures",
    test_fn: |fx| connreq::test_connreq_failures(fx).boxed()
});

inventory::submit!(Test {
    name: "connreq_digest",
    test_fn: |fx| connreq::test_connreq_digest(fx).boxed()
});

inventory::submit!(Test {
    name: "connreq_coalescing",
    test_fn: |fx| connreq::test_connreq_coalescing(fx).boxed()
});

inventory::submit!(Test {
    name: "connreq_cap",
    test_fn: |fx| connreq::test_connreq_cap(fx).boxed()
});

// This will exit with status zero on test success, 101 on test failure & 1 on error.
fn main() -> Result<ExitCode> {
    let rt = Arc::new(Runtime::new().expect("Failed to build a tokio multi-threaded runtime"));

    // We have no way to augment the set of command-line arguments this program will accept, so
    // we'll examine an environment variable to determine where to get our configuration:
    let config = Configuration::new().context(ConfigurationSnafu)?;

    if config.logging {
        tracing::subscriber::set_global_default(
            Registry::default()
                .with(fmt::Layer::default().compact().with_writer(io::stdout))
                .with(EnvFilter::try_new(&config.log_level).context(FilterSnafu)?),
        )
        .context(SetGlobalDefaultSnafu)?;
    }

    debug!("Logging configured.");

    let mut args = Arguments::from_args();

    // The tests share one fixture (one worker pool, one round-robin counter); run them
    // sequentially.
    if !matches!(args.test_threads, Some(1)) {
        eprintln!("Overriding --test-threads to 1.");
        args.test_threads = Some(1);
    }

    let fixture = rt.block_on(spawn_edge());

    debug!("Fixture up at {}; executing tests.", fixture.base);

    let conclusion = libtest_mimic::run(
        &args,
        inventory::iter::<Test>
            .into_iter()
            .sorted_by_key(|t| t.name)
            .map(|test| {
                Trial::test(test.name, {
                    let fixture = fixture.clone();
                    let rt = rt.clone();
                    move || rt.block_on((test.test_fn)(fixture))
                })
            })
            .collect(),
    );

    if conclusion.has_failed() {
        Ok(ExitCode::from(101))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}
