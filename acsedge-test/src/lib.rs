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

//! # The acsedge Integration Tests
//!
//! These tests exercise the edge the way a CPE does: over HTTP. The fixture stands up the whole
//! stack in-process-- credential cache, session workers, ingress router on an ephemeral port--
//! & the tests drive it with [reqwest], playing the device. For connection requests the roles
//! flip, so the fixture also offers a [wiremock] server standing in for a CPE's tiny embedded
//! connection-request listener.
//!
//! The test *runner* replaces the default harness with [libtest-mimic] (see
//! `tests/edge-tests.rs`); shared helpers & the test functions themselves live here so any
//! future integration test binary can register them.
//!
//! [libtest-mimic]: https://docs.rs/libtest-mimic/latest/libtest_mimic/index.html

use std::sync::Arc;

use libtest_mimic::Failed;
use serde_json::json;
use tokio::sync::mpsc;
use url::Url;

use acsedge::{
    ingress::{self, make_router, Edge},
    org_cache::{self, spawn_subscriber, CredentialCache},
    session::{self, WorkerPool},
};

pub mod connreq;
pub mod sessions;

/// Everything a test needs to talk to the in-process edge.
#[derive(Clone)]
pub struct EdgeFixture {
    /// Base URL of the ingress listener
    pub base: Url,
    /// The organization change feed; what a message bus would carry in production
    pub feed: mpsc::Sender<serde_json::Value>,
    pub pool: Arc<WorkerPool>,
    pub cache: Arc<CredentialCache>,
}

/// Stand up the edge: a credential cache seeded with the "acme" organization, a worker pool, &
/// the ingress router bound to an ephemeral port.
pub async fn spawn_edge() -> EdgeFixture {
    let cache = Arc::new(CredentialCache::new(org_cache::Config::default()));
    cache.apply(&json!({"type": "upsert", "organization": {
        "id": "acme",
        "url-path": "acme",
        "acs-username": "acme",
        "acs-password": "s3cr3t",
        "https-enabled": true,
    }}));

    let (feed_tx, feed_rx) = mpsc::channel(64);
    spawn_subscriber(cache.clone(), feed_rx);

    let pool = Arc::new(WorkerPool::spawn(&session::Config::default(), "edge-test"));
    let edge = Arc::new(Edge::new(
        cache.clone(),
        pool.clone(),
        &ingress::Config::default(),
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap(/* ephemeral port */);
    let base = Url::parse(&format!("http://{}", listener.local_addr().unwrap()))
        .unwrap(/* known good */);
    let router = make_router(edge);
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap(/* serves forever */);
    });
    EdgeFixture {
        base,
        feed: feed_tx,
        pool,
        cache,
    }
}

/// Render an Inform for the given device.
pub fn inform(oui: &str, serial: &str, event: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:cwmp="urn:dslforum-org:cwmp-1-1">
  <soapenv:Header><cwmp:ID soapenv:mustUnderstand="1">1</cwmp:ID></soapenv:Header>
  <soapenv:Body>
    <cwmp:Inform>
      <DeviceId>
        <Manufacturer>Acme Networks</Manufacturer>
        <OUI>{}</OUI>
        <ProductClass>GigaHub</ProductClass>
        <SerialNumber>{}</SerialNumber>
      </DeviceId>
      <Event><EventStruct><EventCode>{}</EventCode></EventStruct></Event>
    </cwmp:Inform>
  </soapenv:Body>
</soapenv:Envelope>"#,
        oui, serial, event
    )
}

/// A basic Authorization header for the given credentials.
pub fn basic(username: &str, password: &str) -> String {
    format!(
        "Basic {}",
        base64::Engine::encode(
            &base64::prelude::BASE64_STANDARD,
            format!("{}:{}", username, password)
        )
    )
}

/// Hit the edge's healthcheck endpoint; panic on anything other than success.
pub async fn test_healthcheck(fixture: EdgeFixture) -> Result<(), Failed> {
    assert!("Hello." == reqwest::get(fixture.base.join("/healthz")?).await?.text().await?);
    Ok(())
}
