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

//! # acsedge connection requests
//!
//! The one place the roles flip back: to reach a CPE *now* (rather than waiting for its next
//! periodic check-in), the ACS sends an HTTP GET to the device's connection-request URL. The
//! device answers 200 & then checks in over the usual channel with a "6 CONNECTION REQUEST"
//! event; the GET itself carries no payload & its body is ignored.
//!
//! CPE connection-request servers are tiny embedded HTTP listeners, so we hold a global cap on
//! concurrent attempts. Submissions past the cap *queue* (they wait on the semaphore) rather
//! than being rejected. One attempt per submission: if the device is unreachable the caller
//! hears about it & can queue a retry at its own cadence. A task may carry a deadline; one
//! that lapses while still queued is failed as expired, not attempted stale.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{oneshot, Semaphore},
    time::Instant,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{authn::answer_digest_challenge, entities::CpeKey};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      requests & outcomes                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One request to reach out & touch a device.
#[derive(Clone, Debug)]
pub struct ConnectionRequest {
    pub cpe_key: CpeKey,
    /// The device's connection-request URL, as it last reported it
    pub url: String,
    pub username: String,
    pub password: SecretString,
    /// Don't bother attempting past this instant; None means the task never goes stale
    pub deadline: Option<Instant>,
}

// Identity for queueing purposes; the password doesn't participate.
impl PartialEq for ConnectionRequest {
    fn eq(&self, other: &Self) -> bool {
        self.cpe_key == other.cpe_key && self.url == other.url && self.username == other.username
    }
}

impl Eq for ConnectionRequest {}

/// Why a connection request didn't get through.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FailureCause {
    /// The device's reported URL doesn't parse; no attempt was made
    BadUrl,
    /// The device didn't answer within the attempt timeout
    TimedOut,
    /// TCP-level failure (refused, unroutable, reset)
    Unreachable,
    /// The device challenged & rejected our credentials
    AuthRejected,
    /// The device answered with a non-2xx status
    Rejected(u16),
    /// The task's deadline lapsed before an attempt could be made
    Expired,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// The device acknowledged the request; expect a check-in shortly
    Delivered,
    /// An attempt for this device was already in flight; ride that one
    Coalesced,
    Failed(FailureCause),
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          configuration                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Global cap on concurrent connection-request attempts
    #[serde(rename = "max-concurrent")]
    pub max_concurrent: usize,
    /// Per-attempt deadline, connect through response
    #[serde(rename = "attempt-timeout")]
    pub attempt_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_concurrent: 32,
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Dispatcher                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub struct Dispatcher {
    client: reqwest::Client,
    permits: Arc<Semaphore>,
    in_flight: Mutex<HashSet<CpeKey>>,
}

impl Dispatcher {
    pub fn new(cfg: &Config) -> Dispatcher {
        Dispatcher {
            client: reqwest::Client::builder()
                .timeout(cfg.attempt_timeout)
                // Embedded CR servers mishandle keep-alive; one connection per attempt.
                .pool_max_idle_per_host(0)
                .build()
                .unwrap(/* known-good builder */),
            permits: Arc::new(Semaphore::new(cfg.max_concurrent)),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// How many attempts are on the wire right now.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().expect("lock poisoned").len()
    }

    /// Submit a connection request; the returned channel yields the outcome.
    ///
    /// A submission for a device that already has an attempt in flight resolves immediately to
    /// [Outcome::Coalesced]-- the point of a connection request is "check in now", & one nudge
    /// suffices.
    pub fn submit(self: &Arc<Self>, req: ConnectionRequest) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        {
            let mut in_flight = self.in_flight.lock().expect("lock poisoned");
            if !in_flight.insert(req.cpe_key.clone()) {
                debug!("coalescing connection request for {}", req.cpe_key);
                let _ = tx.send(Outcome::Coalesced);
                return rx;
            }
        }
        let this = self.clone();
        tokio::spawn(async move {
            // A task queued behind the cap can go stale waiting its turn; its deadline bounds
            // the wait as well as the attempt.
            let permit = match req.deadline {
                Some(deadline) => {
                    tokio::time::timeout_at(deadline, this.permits.clone().acquire_owned())
                        .await
                        .ok()
                }
                None => Some(this.permits.clone().acquire_owned().await),
            };
            let outcome = match permit {
                Some(permit) => {
                    let _permit = permit.unwrap(/* never closed */);
                    this.attempt(&req).await
                }
                None => {
                    debug!("connection request for {} expired awaiting capacity", req.cpe_key);
                    Outcome::Failed(FailureCause::Expired)
                }
            };
            this.in_flight
                .lock()
                .expect("lock poisoned")
                .remove(&req.cpe_key);
            match &outcome {
                Outcome::Delivered => info!("connection request delivered to {}", req.cpe_key),
                _ => warn!("connection request to {} failed: {:?}", req.cpe_key, outcome),
            }
            // The caller may have lost interest; that's fine.
            let _ = tx.send(outcome);
        });
        rx
    }

    async fn attempt(&self, req: &ConnectionRequest) -> Outcome {
        let url = match Url::parse(&req.url) {
            Ok(url) => url,
            Err(_) => return Outcome::Failed(FailureCause::BadUrl),
        };
        let rsp = match self.client.get(url.clone()).send().await {
            Ok(rsp) => rsp,
            Err(err) => return Outcome::Failed(classify(err)),
        };
        // Most CR servers demand digest authentication; answer the challenge & retry once.
        if rsp.status() == StatusCode::UNAUTHORIZED {
            let challenge = match rsp
                .headers()
                .get(http::header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
            {
                Some(challenge) => challenge.to_string(),
                None => return Outcome::Failed(FailureCause::AuthRejected),
            };
            let authorization = match answer_digest_challenge(
                &req.username,
                req.password.expose_secret(),
                "GET",
                url.path(),
                &challenge,
            ) {
                Some(authorization) => authorization,
                None => return Outcome::Failed(FailureCause::AuthRejected),
            };
            let rsp = match self
                .client
                .get(url)
                .header(http::header::AUTHORIZATION, authorization)
                .send()
                .await
            {
                Ok(rsp) => rsp,
                Err(err) => return Outcome::Failed(classify(err)),
            };
            return grade(rsp.status());
        }
        grade(rsp.status())
    }
}

fn classify(err: reqwest::Error) -> FailureCause {
    if err.is_timeout() {
        FailureCause::TimedOut
    } else {
        FailureCause::Unreachable
    }
}

fn grade(status: StatusCode) -> Outcome {
    if status.is_success() {
        Outcome::Delivered
    } else if status == StatusCode::UNAUTHORIZED {
        Outcome::Failed(FailureCause::AuthRejected)
    } else {
        Outcome::Failed(FailureCause::Rejected(status.as_u16()))
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     queued-dispatch adapter                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Lets queued connection requests ride the background-dispatch poller.
pub struct QueuedDelivery {
    dispatcher: Arc<Dispatcher>,
}

impl QueuedDelivery {
    pub fn new(dispatcher: Arc<Dispatcher>) -> QueuedDelivery {
        QueuedDelivery { dispatcher }
    }
}

#[async_trait]
impl crate::dispatch::Dispatcher<ConnectionRequest> for QueuedDelivery {
    async fn dispatch(&self, item: ConnectionRequest) {
        // Fire & forget; the queue owner learns the result from the device's check-in (or
        // absence thereof).
        let _ = self.dispatcher.submit(item).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, Request, Respond, ResponseTemplate,
    };

    fn request(key: &str, url: &str) -> ConnectionRequest {
        ConnectionRequest {
            cpe_key: CpeKey::new(key).unwrap(),
            url: url.to_string(),
            username: "A1B2C3-ONT-CXNK0011AABB".to_string(),
            password: "cr-secret".to_string().into(),
            deadline: None,
        }
    }

    #[tokio::test]
    async fn a_successful_attempt_is_delivered() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cr"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let dispatcher = Arc::new(Dispatcher::new(&Config::default()));
        let outcome = dispatcher
            .submit(request(
                "acme-A1B2C3-CXNK0011AABB",
                &format!("{}/cr", server.uri()),
            ))
            .await
            .unwrap();
        assert_eq!(Outcome::Delivered, outcome);
        assert_eq!(0, dispatcher.in_flight());
    }

    #[tokio::test]
    async fn a_bad_url_fails_without_an_attempt() {
        let dispatcher = Arc::new(Dispatcher::new(&Config::default()));
        let outcome = dispatcher
            .submit(request("acme-A1B2C3-CXNK0011AABB", "not a url"))
            .await
            .unwrap();
        assert_eq!(Outcome::Failed(FailureCause::BadUrl), outcome);
    }

    #[tokio::test]
    async fn a_non_2xx_is_a_typed_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let dispatcher = Arc::new(Dispatcher::new(&Config::default()));
        let outcome = dispatcher
            .submit(request("acme-A1B2C3-CXNK0011AABB", &server.uri()))
            .await
            .unwrap();
        assert_eq!(Outcome::Failed(FailureCause::Rejected(503)), outcome);
    }

    #[tokio::test]
    async fn a_refused_connection_is_unreachable() {
        // Nothing listens on this port (reserved, unassigned).
        let dispatcher = Arc::new(Dispatcher::new(&Config::default()));
        let outcome = dispatcher
            .submit(request("acme-A1B2C3-CXNK0011AABB", "http://127.0.0.1:1/cr"))
            .await
            .unwrap();
        assert_eq!(Outcome::Failed(FailureCause::Unreachable), outcome);
    }

    /// 401 + digest challenge on the first GET; 200 if the second carries a good response.
    struct DigestGate;

    impl Respond for DigestGate {
        fn respond(&self, req: &Request) -> ResponseTemplate {
            match req.headers.get(http::header::AUTHORIZATION) {
                Some(value) if value.to_str().unwrap().starts_with("Digest ") => {
                    ResponseTemplate::new(200)
                }
                _ => ResponseTemplate::new(401).insert_header(
                    "WWW-Authenticate",
                    r#"Digest realm="cr", qop="auth", nonce="deadbeef", opaque="cafe""#,
                ),
            }
        }
    }

    #[tokio::test]
    async fn a_digest_challenge_is_answered_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cr"))
            .respond_with(DigestGate)
            .mount(&server)
            .await;

        let dispatcher = Arc::new(Dispatcher::new(&Config::default()));
        let outcome = dispatcher
            .submit(request(
                "acme-A1B2C3-CXNK0011AABB",
                &format!("{}/cr", server.uri()),
            ))
            .await
            .unwrap();
        assert_eq!(Outcome::Delivered, outcome);
    }

    #[tokio::test]
    async fn an_unanswerable_challenge_is_auth_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(401).insert_header("WWW-Authenticate", "Negotiate"),
            )
            .mount(&server)
            .await;

        let dispatcher = Arc::new(Dispatcher::new(&Config::default()));
        let outcome = dispatcher
            .submit(request("acme-A1B2C3-CXNK0011AABB", &server.uri()))
            .await
            .unwrap();
        assert_eq!(Outcome::Failed(FailureCause::AuthRejected), outcome);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn the_cap_holds_submissions_back() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
            .mount(&server)
            .await;

        let dispatcher = Arc::new(Dispatcher::new(&Config {
            max_concurrent: 2,
            attempt_timeout: Duration::from_secs(5),
        }));
        let serials = ["CXNK00000001", "CXNK00000002", "CXNK00000003"];
        let pending: Vec<_> = serials
            .iter()
            .map(|serial| {
                dispatcher.submit(request(
                    &format!("acme-A1B2C3-{}", serial),
                    &format!("{}/cr", server.uri()),
                ))
            })
            .collect();

        // All three are tracked, but only two can be on the wire at once; everyone completes.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(3, dispatcher.in_flight());
        assert_eq!(0, dispatcher.permits.available_permits());
        for rx in pending {
            assert_eq!(Outcome::Delivered, rx.await.unwrap());
        }
        assert_eq!(0, dispatcher.in_flight());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_submissions_expire_awaiting_capacity() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
            .mount(&server)
            .await;

        let dispatcher = Arc::new(Dispatcher::new(&Config {
            max_concurrent: 1,
            attempt_timeout: Duration::from_secs(5),
        }));
        let first = dispatcher.submit(request(
            "acme-A1B2C3-CXNK00000001",
            &format!("{}/cr", server.uri()),
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The slot is taken for another 250ms; this one can only wait 50.
        let mut stale = request("acme-A1B2C3-CXNK00000002", &format!("{}/cr", server.uri()));
        stale.deadline = Some(Instant::now() + Duration::from_millis(50));
        let second = dispatcher.submit(stale);

        assert_eq!(Outcome::Failed(FailureCause::Expired), second.await.unwrap());
        assert_eq!(Outcome::Delivered, first.await.unwrap());
        assert_eq!(0, dispatcher.in_flight());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_submissions_coalesce() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(100)))
            .mount(&server)
            .await;

        let dispatcher = Arc::new(Dispatcher::new(&Config::default()));
        let req = request("acme-A1B2C3-CXNK0011AABB", &format!("{}/cr", server.uri()));
        let first = dispatcher.submit(req.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = dispatcher.submit(req);

        assert_eq!(Outcome::Coalesced, second.await.unwrap());
        assert_eq!(Outcome::Delivered, first.await.unwrap());
    }
}
