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

//! # acsedge ingress
//!
//! The HTTP face of the edge: one route, `POST /cwmp/{org}`. Ingress itself is thin on purpose.
//! It parses the sticky cookie, resolves the organization, picks the worker (the cookie's
//! worker for an established session, round-robin for first contact), forwards the POST over
//! the worker's channel, & translates the worker's reply back into HTTP. All protocol & session
//! judgment lives on the worker.
//!
//! The affinity rule is strict: a sticky token routes to one worker for the life of its
//! session, & is never re-homed. If that worker is gone the CPE gets a 400, abandons the
//! session, & Informs afresh.

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::{Path, State},
    response::Response,
    routing::{get, post},
    Router,
};
use http::{header, HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{
    authn::is_zero_touch_credential,
    cwmp::{self, CwmpVersion, FaultCode},
    entities::{OrgPath, StickyToken},
    org_cache::CredentialCache,
    session::{ForwardedRequest, WorkerMsg, WorkerPool, WorkerReply},
};

/// The session-affinity cookie.
pub static COOKIE_NAME: &str = "ACSSESSIONID";

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          configuration                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// How long to wait on a worker before answering for it
    #[serde(rename = "forward-timeout")]
    pub forward_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            forward_timeout: Duration::from_secs(30),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          shared state                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub struct Edge {
    pub cache: Arc<CredentialCache>,
    pub pool: Arc<WorkerPool>,
    pub forward_timeout: Duration,
}

impl Edge {
    pub fn new(cache: Arc<CredentialCache>, pool: Arc<WorkerPool>, cfg: &Config) -> Edge {
        Edge {
            cache,
            pool,
            forward_timeout: cfg.forward_timeout,
        }
    }
}

pub fn make_router(edge: Arc<Edge>) -> Router {
    Router::new()
        .route("/cwmp/{org}", post(cwmp_post))
        .route("/healthz", get(healthcheck))
        .with_state(edge)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            handlers                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn healthcheck() -> &'static str {
    "Hello."
}

fn empty_status(status: StatusCode) -> Response {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .unwrap(/* known-good builder */)
}

/// The answer when a worker can't be reached in time: HTTP 200 bearing an ACS-internal fault
/// envelope, so the CPE treats it as a protocol-level failure & retries on its own schedule.
fn worker_timeout_response() -> Response {
    let body = cwmp::fault(
        &None,
        CwmpVersion::default(),
        FaultCode::AcsInternalError,
        "ACS timeout",
    );
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, cwmp::CONTENT_TYPE)
        .header("SOAPAction", cwmp::SOAP_ACTION)
        .body(Body::from(body))
        .unwrap(/* known-good builder */)
}

/// Dig the sticky token out of the Cookie header(s).
///
/// Ok(None) means no session cookie at all (first contact); Err means the cookie is there but
/// doesn't parse, which gets a 400-- resynchronizing a garbled session is not worth attempting.
fn sticky_token(headers: &HeaderMap) -> std::result::Result<Option<StickyToken>, ()> {
    for value in headers.get_all(header::COOKIE) {
        let value = value.to_str().map_err(|_| ())?;
        for cookie in value.split(';') {
            if let Some(token) = cookie.trim().strip_prefix(COOKIE_NAME) {
                let token = token.strip_prefix('=').ok_or(())?;
                return token.parse::<StickyToken>().map(Some).map_err(|_| ());
            }
        }
    }
    Ok(None)
}

async fn cwmp_post(
    State(edge): State<Arc<Edge>>,
    Path(org): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let path = match org.parse::<OrgPath>() {
        Ok(path) => path,
        Err(_) => return empty_status(StatusCode::NOT_FOUND),
    };

    let token = match sticky_token(&headers) {
        Ok(token) => token,
        Err(_) => {
            debug!("rejecting a malformed session cookie");
            return empty_status(StatusCode::BAD_REQUEST);
        }
    };

    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let entry = edge.cache.lookup(&path);
    if entry.is_none() {
        // Only a factory-fresh device gets past an unknown organization path.
        let zero_touch = authorization
            .as_deref()
            .map(is_zero_touch_credential)
            .unwrap_or(false);
        if !zero_touch {
            debug!("no organization at path {}", path);
            return empty_status(StatusCode::FORBIDDEN);
        }
    }

    let index = match &token {
        Some(token) => token.worker(),
        None => edge.pool.pick(),
    };
    let sender = match edge.pool.sender(index) {
        Some(sender) => sender,
        None => {
            // The cookie names a worker this process doesn't have; the session is lost.
            warn!("a session cookie names worker {}, which we don't have", index);
            return empty_status(StatusCode::BAD_REQUEST);
        }
    };

    let (tx, rx) = oneshot::channel();
    let forwarded = WorkerMsg::Request(ForwardedRequest {
        org: entry,
        path,
        token,
        authorization,
        body,
        reply: tx,
    });
    if sender.send(forwarded).await.is_err() {
        warn!("worker {} is gone; failing the session", index);
        return empty_status(StatusCode::BAD_REQUEST);
    }
    match tokio::time::timeout(edge.forward_timeout, rx).await {
        Ok(Ok(reply)) => render(reply),
        Ok(Err(_)) => {
            warn!("worker {} dropped a request on the floor", index);
            worker_timeout_response()
        }
        Err(_) => {
            warn!("worker {} failed to answer within {:?}", index, edge.forward_timeout);
            worker_timeout_response()
        }
    }
}

fn render(reply: WorkerReply) -> Response {
    let mut builder = Response::builder().status(reply.status);
    // Some CPE HTTP stacks want the CWMP headers even on bodiless replies.
    builder = builder
        .header(header::CONTENT_TYPE, cwmp::CONTENT_TYPE)
        .header("SOAPAction", cwmp::SOAP_ACTION);
    if let Some(challenge) = reply.www_authenticate {
        builder = builder.header(header::WWW_AUTHENTICATE, challenge);
    }
    if let Some(token) = reply.set_cookie {
        builder = builder.header(
            header::SET_COOKIE,
            format!("{}={}; Path=/; HttpOnly", COOKIE_NAME, token),
        );
    }
    builder
        .body(reply.body.map(Body::from).unwrap_or_else(Body::empty))
        .unwrap(/* known-good builder */)
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::{org_cache, session};

    async fn serve() -> (String, Arc<Edge>) {
        let cache = Arc::new(CredentialCache::new(org_cache::Config::default()));
        cache.apply(&json!({"type": "upsert", "organization": {
            "id": "acme",
            "url-path": "acme",
            "acs-username": "acme",
            "acs-password": "s3cr3t",
            "https-enabled": true,
        }}));
        let pool = Arc::new(WorkerPool::spawn(&session::Config::default(), "edge-1"));
        let edge = Arc::new(Edge::new(cache, pool, &Config::default()));
        let router = make_router(edge.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (base, edge)
    }

    static INFORM: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:cwmp="urn:dslforum-org:cwmp-1-1">
  <soapenv:Header><cwmp:ID soapenv:mustUnderstand="1">1</cwmp:ID></soapenv:Header>
  <soapenv:Body>
    <cwmp:Inform>
      <DeviceId>
        <Manufacturer>Acme Networks</Manufacturer>
        <OUI>A1B2C3</OUI>
        <ProductClass>GigaHub</ProductClass>
        <SerialNumber>CXNK0011AABB</SerialNumber>
      </DeviceId>
      <Event><EventStruct><EventCode>0 BOOTSTRAP</EventCode></EventStruct></Event>
    </cwmp:Inform>
  </soapenv:Body>
</soapenv:Envelope>"#;

    #[tokio::test]
    async fn the_full_session_round_trip() {
        let (base, _edge) = serve().await;
        let client = reqwest::Client::new();

        let rsp = client
            .post(format!("{}/cwmp/acme", base))
            .header("Authorization", "Basic YWNtZTpzM2NyM3Q=")
            .header("Content-Type", cwmp::CONTENT_TYPE)
            .body(INFORM)
            .send()
            .await
            .unwrap();
        assert_eq!(200, rsp.status().as_u16());
        let cookie = rsp
            .headers()
            .get("set-cookie")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(cookie.starts_with(COOKIE_NAME));
        assert!(rsp.text().await.unwrap().contains("InformResponse"));

        // Empty POST, nothing queued: the session closes with a bodiless 204 that still
        // carries the CWMP headers.
        let session_cookie = cookie.split(';').next().unwrap().to_string();
        let rsp = client
            .post(format!("{}/cwmp/acme", base))
            .header("Cookie", session_cookie)
            .send()
            .await
            .unwrap();
        assert_eq!(204, rsp.status().as_u16());
        assert!(rsp.headers().contains_key("soapaction"));
    }

    #[tokio::test]
    async fn missing_credentials_get_the_challenge_through() {
        let (base, _edge) = serve().await;
        let rsp = reqwest::Client::new()
            .post(format!("{}/cwmp/acme", base))
            .body(INFORM)
            .send()
            .await
            .unwrap();
        assert_eq!(401, rsp.status().as_u16());
        assert_eq!(
            "Basic YWNtZTpzM2NyM3Q=",
            rsp.headers().get("www-authenticate").unwrap()
        );
    }

    #[tokio::test]
    async fn unknown_organizations_are_forbidden_except_to_zero_touch() {
        let (base, _edge) = serve().await;
        let client = reqwest::Client::new();

        let rsp = client
            .post(format!("{}/cwmp/nonesuch", base))
            .body(INFORM)
            .send()
            .await
            .unwrap();
        assert_eq!(403, rsp.status().as_u16());

        let credential = format!(
            "Basic {}",
            base64::Engine::encode(
                &base64::prelude::BASE64_STANDARD,
                "A1B2C3-ONT-CXNK0011AABB:activate-cxnk"
            )
        );
        let rsp = client
            .post(format!("{}/cwmp/nonesuch", base))
            .header("Authorization", credential)
            .body(INFORM)
            .send()
            .await
            .unwrap();
        assert_eq!(200, rsp.status().as_u16());
        assert!(rsp.text().await.unwrap().contains("InformResponse"));
    }

    #[tokio::test]
    async fn malformed_cookies_and_paths_are_rejected() {
        let (base, _edge) = serve().await;
        let client = reqwest::Client::new();

        let rsp = client
            .post(format!("{}/cwmp/acme", base))
            .header("Cookie", format!("{}=not-a-token", COOKIE_NAME))
            .body(INFORM)
            .send()
            .await
            .unwrap();
        assert_eq!(400, rsp.status().as_u16());

        let rsp = client
            .post(format!("{}/cwmp/bad.path!", base))
            .body(INFORM)
            .send()
            .await
            .unwrap();
        assert_eq!(404, rsp.status().as_u16());
    }

    #[tokio::test]
    async fn a_cookie_naming_a_dead_worker_fails_the_session() {
        let (base, _edge) = serve().await;
        // A well-formed token whose worker index is out of range.
        let rsp = reqwest::Client::new()
            .post(format!("{}/cwmp/acme", base))
            .header(
                "Cookie",
                format!("{}=00c0ffee~1756400000000~edge-9~99", COOKIE_NAME),
            )
            .send()
            .await
            .unwrap();
        assert_eq!(400, rsp.status().as_u16());
    }

    #[test]
    fn the_timeout_answer_is_a_cwmp_fault_not_an_http_error() {
        let rsp = worker_timeout_response();
        assert_eq!(StatusCode::OK, rsp.status());
        assert!(rsp.headers().contains_key("soapaction"));
    }

    #[test]
    fn sticky_tokens_parse_out_of_cookie_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            "other=1; ACSSESSIONID=00c0ffee~1756400000000~edge-1~2; another=x"
                .parse()
                .unwrap(),
        );
        let token = sticky_token(&headers).unwrap().unwrap();
        assert_eq!(crate::entities::WorkerIndex(2), token.worker());

        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, "other=1".parse().unwrap());
        assert!(sticky_token(&headers).unwrap().is_none());

        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, "ACSSESSIONID=mangled".parse().unwrap());
        assert!(sticky_token(&headers).is_err());
    }
}
