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

//! Connection-request integration tests: the edge playing HTTP client, [wiremock] playing the
//! CPE's embedded connection-request listener.

use std::{sync::Arc, time::Duration};

use libtest_mimic::Failed;
use wiremock::{
    matchers::method, Mock, MockServer, Request, Respond, ResponseTemplate,
};

use acsedge::{
    connreq::{Config, ConnectionRequest, Dispatcher, FailureCause, Outcome},
    entities::CpeKey,
};

use crate::EdgeFixture;

fn request(serial: &str, url: &str) -> ConnectionRequest {
    ConnectionRequest {
        cpe_key: CpeKey::new(&format!("acme-A1B2C3-{}", serial)).unwrap(/* known good */),
        url: url.to_string(),
        username: "cr-user".to_string(),
        password: "cr-pass".to_string().into(),
        deadline: None,
    }
}

/// A CPE that insists on digest authentication: 401 & a challenge until the caller presents a
/// Digest Authorization header.
struct DigestGate;

impl Respond for DigestGate {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        match request.headers.get("authorization") {
            Some(value) if value.to_str().map(|s| s.starts_with("Digest ")).unwrap_or(false) => {
                ResponseTemplate::new(200)
            }
            _ => ResponseTemplate::new(401).insert_header(
                "WWW-Authenticate",
                r#"Digest realm="cr", nonce="0123456789abcdef", qop="auth""#,
            ),
        }
    }
}

/// The happy path: the device answers 200 & the submitter hears `Delivered`.
pub async fn test_connreq_delivery(_fixture: EdgeFixture) -> Result<(), Failed> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dispatcher = Arc::new(Dispatcher::new(&Config::default()));
    let outcome = dispatcher.submit(request("CXNK00BB0001", &server.uri())).await?;
    assert_eq!(Outcome::Delivered, outcome);
    assert_eq!(0, dispatcher.in_flight());
    Ok(())
}

/// Each way an attempt can fail maps to a distinct, typed cause.
pub async fn test_connreq_failures(_fixture: EdgeFixture) -> Result<(), Failed> {
    let dispatcher = Arc::new(Dispatcher::new(&Config {
        attempt_timeout: Duration::from_millis(500),
        ..Config::default()
    }));

    let outcome = dispatcher
        .submit(request("CXNK00BB0002", "not a url at all"))
        .await?;
    assert_eq!(Outcome::Failed(FailureCause::BadUrl), outcome);

    let outcome = dispatcher
        .submit(request("CXNK00BB0003", "http://127.0.0.1:1/"))
        .await?;
    assert_eq!(Outcome::Failed(FailureCause::Unreachable), outcome);

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let outcome = dispatcher.submit(request("CXNK00BB0004", &server.uri())).await?;
    assert_eq!(Outcome::Failed(FailureCause::Rejected(503)), outcome);
    Ok(())
}

/// A digest challenge is answered (once); a challenge in a scheme we don't speak is an
/// authentication failure.
pub async fn test_connreq_digest(_fixture: EdgeFixture) -> Result<(), Failed> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(DigestGate)
        .mount(&server)
        .await;

    let dispatcher = Arc::new(Dispatcher::new(&Config::default()));
    let outcome = dispatcher.submit(request("CXNK00BB0005", &server.uri())).await?;
    assert_eq!(Outcome::Delivered, outcome);

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(401).insert_header("WWW-Authenticate", "Negotiate"),
        )
        .mount(&server)
        .await;
    let outcome = dispatcher.submit(request("CXNK00BB0006", &server.uri())).await?;
    assert_eq!(Outcome::Failed(FailureCause::AuthRejected), outcome);
    Ok(())
}

/// A second submission for a device already being dialed coalesces into the first.
pub async fn test_connreq_coalescing(_fixture: EdgeFixture) -> Result<(), Failed> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
        .mount(&server)
        .await;

    let dispatcher = Arc::new(Dispatcher::new(&Config::default()));
    let first = dispatcher.submit(request("CXNK00BB0007", &server.uri()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = dispatcher
        .submit(request("CXNK00BB0007", &server.uri()))
        .await?;
    assert_eq!(Outcome::Coalesced, second);
    assert_eq!(Outcome::Delivered, first.await?);
    Ok(())
}

/// The global cap bounds concurrency: with two permits & three slow devices, the third attempt
/// waits its turn, & everyone gets through in the end.
pub async fn test_connreq_cap(_fixture: EdgeFixture) -> Result<(), Failed> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
        .mount(&server)
        .await;

    let dispatcher = Arc::new(Dispatcher::new(&Config {
        max_concurrent: 2,
        ..Config::default()
    }));
    let receivers: Vec<_> = ["CXNK00BB0008", "CXNK00BB0009", "CXNK00BB000A"]
        .iter()
        .map(|serial| dispatcher.submit(request(serial, &server.uri())))
        .collect();

    tokio::time::sleep(Duration::from_millis(50)).await;
    // All three are submitted, but only two can be on the wire.
    assert_eq!(3, dispatcher.in_flight());

    for rx in receivers {
        assert_eq!(Outcome::Delivered, rx.await?);
    }
    assert_eq!(0, dispatcher.in_flight());
    Ok(())
}
