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

//! Session-layer integration tests: the CWMP conversation as a CPE sees it.

use std::time::Duration;

use libtest_mimic::Failed;
use serde_json::json;

use acsedge::{
    entities::CpeKey,
    session::OutboundRpc,
};

use crate::{basic, inform, EdgeFixture};

static GPV_RESPONSE: &str = r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:cwmp="urn:dslforum-org:cwmp-1-1"><soapenv:Header><cwmp:ID soapenv:mustUnderstand="1">7</cwmp:ID></soapenv:Header><soapenv:Body><cwmp:GetParameterValuesResponse><ParameterList/></cwmp:GetParameterValuesResponse></soapenv:Body></soapenv:Envelope>"#;

fn session_cookie(rsp: &reqwest::Response) -> Result<String, Failed> {
    Ok(rsp
        .headers()
        .get("set-cookie")
        .ok_or("no Set-Cookie header")?
        .to_str()?
        .split(';')
        .next()
        .ok_or("empty Set-Cookie header")?
        .to_string())
}

/// Inform, InformResponse, empty POST, 204: the shortest possible session.
pub async fn test_session_round_trip(fixture: EdgeFixture) -> Result<(), Failed> {
    let client = reqwest::Client::new();
    let rsp = client
        .post(fixture.base.join("/cwmp/acme")?)
        .header("Authorization", basic("acme", "s3cr3t"))
        .header("Content-Type", "text/xml; charset=utf-8")
        .body(inform("A1B2C3", "CXNK00AA0001", "2 PERIODIC"))
        .send()
        .await?;
    assert_eq!(200, rsp.status().as_u16());
    let cookie = session_cookie(&rsp)?;
    assert!(rsp.text().await?.contains("InformResponse"));

    let rsp = client
        .post(fixture.base.join("/cwmp/acme")?)
        .header("Cookie", &cookie)
        .send()
        .await?;
    assert_eq!(204, rsp.status().as_u16());
    assert!(rsp.headers().contains_key("soapaction"));
    Ok(())
}

/// No credentials: 401 bearing the organization's exact challenge; good credentials on the
/// retry are accepted.
pub async fn test_challenge_flow(fixture: EdgeFixture) -> Result<(), Failed> {
    let client = reqwest::Client::new();
    let body = inform("A1B2C3", "CXNK00AA0002", "2 PERIODIC");

    let rsp = client
        .post(fixture.base.join("/cwmp/acme")?)
        .body(body.clone())
        .send()
        .await?;
    assert_eq!(401, rsp.status().as_u16());
    assert_eq!(
        basic("acme", "s3cr3t"),
        rsp.headers().get("www-authenticate").ok_or("no challenge")?.to_str()?
    );

    let rsp = client
        .post(fixture.base.join("/cwmp/acme")?)
        .header("Authorization", basic("acme", "wrong"))
        .body(body.clone())
        .send()
        .await?;
    assert_eq!(401, rsp.status().as_u16());

    let rsp = client
        .post(fixture.base.join("/cwmp/acme")?)
        .header("Authorization", basic("acme", "s3cr3t"))
        .body(body)
        .send()
        .await?;
    assert_eq!(200, rsp.status().as_u16());
    Ok(())
}

/// An unknown organization path is forbidden-- unless the caller presents the zero-touch
/// bootstrap credential.
pub async fn test_zero_touch_bootstrap(fixture: EdgeFixture) -> Result<(), Failed> {
    let client = reqwest::Client::new();
    let body = inform("B4C5D6", "CXNK00AA0003", "0 BOOTSTRAP");

    let rsp = client
        .post(fixture.base.join("/cwmp/newco")?)
        .body(body.clone())
        .send()
        .await?;
    assert_eq!(403, rsp.status().as_u16());

    let rsp = client
        .post(fixture.base.join("/cwmp/newco")?)
        .header(
            "Authorization",
            basic("B4C5D6-ONT-CXNK00AA0003", "activate-cxnk"),
        )
        .body(body)
        .send()
        .await?;
    assert_eq!(200, rsp.status().as_u16());
    assert!(rsp.text().await?.contains("InformResponse"));
    Ok(())
}

/// Protocol-level garbage is answered with HTTP 200 & a CWMP fault envelope, per the spirit of
/// TR-069's "HTTP is just transport".
pub async fn test_malformed_post(fixture: EdgeFixture) -> Result<(), Failed> {
    let rsp = reqwest::Client::new()
        .post(fixture.base.join("/cwmp/acme")?)
        .header("Authorization", basic("acme", "s3cr3t"))
        .body("this is not a SOAP envelope")
        .send()
        .await?;
    assert_eq!(200, rsp.status().as_u16());
    let text = rsp.text().await?;
    assert!(text.contains("<FaultCode>8003</FaultCode>"));
    assert!(text.contains("Malformed CWMP Message!"));
    Ok(())
}

/// A garbled cookie gets a 400, & a well-formed token naming a worker we don't have does too.
pub async fn test_bad_cookies(fixture: EdgeFixture) -> Result<(), Failed> {
    let client = reqwest::Client::new();
    let rsp = client
        .post(fixture.base.join("/cwmp/acme")?)
        .header("Cookie", "ACSSESSIONID=garbled")
        .send()
        .await?;
    assert_eq!(400, rsp.status().as_u16());

    let rsp = client
        .post(fixture.base.join("/cwmp/acme")?)
        .header("Cookie", "ACSSESSIONID=00c0ffee~1756400000000~edge-9~99")
        .send()
        .await?;
    assert_eq!(400, rsp.status().as_u16());
    Ok(())
}

/// Two first contacts land on different workers (round-robin), & each session stays glued to
/// the worker its token names.
pub async fn test_sticky_affinity(fixture: EdgeFixture) -> Result<(), Failed> {
    let client = reqwest::Client::new();
    let mut cookies = Vec::new();
    for serial in ["CXNK00AA0004", "CXNK00AA0005"] {
        let rsp = client
            .post(fixture.base.join("/cwmp/acme")?)
            .header("Authorization", basic("acme", "s3cr3t"))
            .body(inform("A1B2C3", serial, "2 PERIODIC"))
            .send()
            .await?;
        assert_eq!(200, rsp.status().as_u16());
        cookies.push(session_cookie(&rsp)?);
    }
    let worker_of = |cookie: &str| -> Result<String, Failed> {
        Ok(cookie.rsplit('~').next().ok_or("no worker segment")?.to_string())
    };
    assert_ne!(worker_of(&cookies[0])?, worker_of(&cookies[1])?);

    // Both sessions remain live & independently closeable.
    for cookie in cookies {
        let rsp = client
            .post(fixture.base.join("/cwmp/acme")?)
            .header("Cookie", &cookie)
            .send()
            .await?;
        assert_eq!(204, rsp.status().as_u16());
    }
    Ok(())
}

/// An RPC queued mid-session goes out on the session's next empty POST, one per round trip,
/// & the response to it (with nothing left queued) closes the session.
pub async fn test_rpc_queue(fixture: EdgeFixture) -> Result<(), Failed> {
    let client = reqwest::Client::new();
    let rsp = client
        .post(fixture.base.join("/cwmp/acme")?)
        .header("Authorization", basic("acme", "s3cr3t"))
        .body(inform("A1B2C3", "CXNK00AA0006", "2 PERIODIC"))
        .send()
        .await?;
    let cookie = session_cookie(&rsp)?;

    fixture
        .pool
        .enqueue(
            &CpeKey::new("acme-A1B2C3-CXNK00AA0006")?,
            &OutboundRpc {
                name: "GetParameterValues".to_string(),
                envelope: "<fake-gpv/>".to_string(),
            },
        )
        .await;

    let rsp = client
        .post(fixture.base.join("/cwmp/acme")?)
        .header("Cookie", &cookie)
        .send()
        .await?;
    assert_eq!(200, rsp.status().as_u16());
    assert_eq!("<fake-gpv/>", rsp.text().await?);

    let rsp = client
        .post(fixture.base.join("/cwmp/acme")?)
        .header("Cookie", &cookie)
        .body(GPV_RESPONSE)
        .send()
        .await?;
    assert_eq!(204, rsp.status().as_u16());
    Ok(())
}

/// An organization arriving over the change feed becomes immediately servable; a deleted one
/// stops being served.
pub async fn test_change_feed(fixture: EdgeFixture) -> Result<(), Failed> {
    fixture
        .feed
        .send(json!({"type": "upsert", "organization": {
            "id": "umbrella",
            "url-path": "umb",
            "acs-username": "umbrella",
            "acs-password": "hive",
            "https-enabled": true,
        }}))
        .await?;

    // The feed is applied asynchronously; wait for the entry to land.
    for _ in 0..100 {
        if fixture.cache.lookup(&"umb".parse()?).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let client = reqwest::Client::new();
    let rsp = client
        .post(fixture.base.join("/cwmp/umb")?)
        .header("Authorization", basic("umbrella", "hive"))
        .body(inform("C7D8E9", "CXNK00AA0007", "1 BOOT"))
        .send()
        .await?;
    assert_eq!(200, rsp.status().as_u16());

    fixture
        .feed
        .send(json!({"type": "delete", "id": "umbrella"}))
        .await?;
    for _ in 0..100 {
        if fixture.cache.lookup(&"umb".parse()?).is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let rsp = client
        .post(fixture.base.join("/cwmp/umb")?)
        .body(inform("C7D8E9", "CXNK00AA0007", "1 BOOT"))
        .send()
        .await?;
    assert_eq!(403, rsp.status().as_u16());
    Ok(())
}
