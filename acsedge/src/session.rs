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

//! # acsedge session workers
//!
//! TR-069 inverts the usual arrangement: the CPE is the HTTP *client*. A session is a series of
//! POSTs from one device-- Inform first, then the device's responses to whatever RPCs we send,
//! then an empty POST when it has nothing more to say. All state for a session lives on exactly
//! one worker (the sticky cookie sees to that), so a worker owns its sessions outright & runs
//! without locks: it's a task draining an mpsc channel, each request answered over a oneshot.
//!
//! Authentication happens here rather than at ingress: the challenge needs the organization's
//! authenticator, & the 401 round trips are part of the session conversation. Once a session is
//! established its POSTs are not re-verified-- the cookie is the credential for the remainder.

use std::{
    collections::{HashMap, VecDeque},
    sync::atomic::{AtomicUsize, Ordering},
    sync::Arc,
    time::{Duration, Instant},
};

use http::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    cwmp::{self, CpeMessage, CwmpVersion, FaultCode},
    entities::{CpeKey, OrgId, OrgPath, StickyToken, WorkerIndex},
    org_cache::OrgEntry,
};

static MALFORMED: &str = "Malformed CWMP Message!";

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          configuration                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Number of session workers
    pub workers: usize,
    /// Sessions idle longer than this are swept
    #[serde(rename = "idle-timeout")]
    pub idle_timeout: Duration,
    /// Depth of each worker's inbound channel
    #[serde(rename = "channel-depth")]
    pub channel_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            workers: 4,
            idle_timeout: Duration::from_secs(180),
            channel_depth: 64,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       messages & replies                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC queued for delivery to a device, one per session round trip.
#[derive(Clone, Debug)]
pub struct OutboundRpc {
    pub name: String,
    /// The complete SOAP envelope, ready for the wire
    pub envelope: String,
}

/// A CPE POST, as forwarded by ingress.
pub struct ForwardedRequest {
    /// The organization, if its URL path resolved in the credential cache
    pub org: Option<Arc<OrgEntry>>,
    pub path: OrgPath,
    pub token: Option<StickyToken>,
    pub authorization: Option<String>,
    pub body: String,
    pub reply: oneshot::Sender<WorkerReply>,
}

/// What the worker tells ingress to send back.
#[derive(Debug)]
pub struct WorkerReply {
    pub status: StatusCode,
    pub body: Option<String>,
    pub www_authenticate: Option<String>,
    pub set_cookie: Option<StickyToken>,
}

impl WorkerReply {
    fn envelope(body: String) -> WorkerReply {
        WorkerReply {
            status: StatusCode::OK,
            body: Some(body),
            www_authenticate: None,
            set_cookie: None,
        }
    }
    fn closed() -> WorkerReply {
        WorkerReply {
            status: StatusCode::NO_CONTENT,
            body: None,
            www_authenticate: None,
            set_cookie: None,
        }
    }
    fn challenge(challenge: String) -> WorkerReply {
        WorkerReply {
            status: StatusCode::UNAUTHORIZED,
            body: None,
            www_authenticate: Some(challenge),
            set_cookie: None,
        }
    }
    fn session_lost() -> WorkerReply {
        WorkerReply {
            status: StatusCode::BAD_REQUEST,
            body: None,
            www_authenticate: None,
            set_cookie: None,
        }
    }
}

pub enum WorkerMsg {
    Request(ForwardedRequest),
    /// Queue an RPC for a device's session, wherever (& whether) it lives
    Enqueue { cpe_key: CpeKey, rpc: OutboundRpc },
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            sessions                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

enum Phase {
    /// Inform acknowledged; waiting for the CPE's next POST
    Established,
    /// We've sent an RPC & owe the CPE nothing until it answers
    RpcOutstanding { name: String },
}

struct Session {
    cpe_key: CpeKey,
    token: StickyToken,
    version: CwmpVersion,
    zero_touch: bool,
    queue: VecDeque<OutboundRpc>,
    phase: Phase,
    last_activity: Instant,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         the worker loop                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

struct WorkerState {
    index: WorkerIndex,
    host: String,
    idle_timeout: Duration,
    sessions: HashMap<CpeKey, Session>,
    by_token: HashMap<String, CpeKey>,
}

impl WorkerState {
    fn handle(&mut self, req: ForwardedRequest) {
        let reply = self.dispatch(&req);
        // Ingress may have timed out & walked away; nothing to do about it.
        let _ = req.reply.send(reply);
    }

    fn dispatch(&mut self, req: &ForwardedRequest) -> WorkerReply {
        if let Some(token) = &req.token {
            if let Some(cpe_key) = self.by_token.get(token.as_ref()).cloned() {
                return self.in_session(&cpe_key, req);
            }
            // The cookie outlived its session (idle sweep, or a worker restart). An Inform can
            // open a fresh session; anything else is unrecoverable from here.
            if !matches!(cwmp::parse(&req.body), Ok(CpeMessage::Inform(_))) {
                debug!("dropping a request bearing a stale token {}", token);
                return WorkerReply::session_lost();
            }
        }
        self.open_session(req)
    }

    fn open_session(&mut self, req: &ForwardedRequest) -> WorkerReply {
        let zero_touch = match (&req.org, &req.authorization) {
            (Some(entry), Some(header)) if entry.authn.verify(header) => false,
            (Some(entry), Some(header)) if entry.authn.is_zero_touch(header) => true,
            (Some(entry), _) => return WorkerReply::challenge(entry.authn.challenge()),
            // No organization on record: ingress admitted this POST on the zero-touch
            // bootstrap credential alone.
            (None, _) => true,
        };

        let inform = match cwmp::parse(&req.body) {
            Ok(CpeMessage::Inform(inform)) => inform,
            Ok(_) => {
                // Sessions open with an Inform; nothing else.
                return WorkerReply::envelope(cwmp::fault(
                    &None,
                    CwmpVersion::default(),
                    FaultCode::AcsInvalidArgs,
                    MALFORMED,
                ));
            }
            Err(err) => {
                debug!("failed to parse a session-opening POST: {}", err);
                return WorkerReply::envelope(cwmp::fault(
                    &None,
                    CwmpVersion::default(),
                    FaultCode::AcsInvalidArgs,
                    MALFORMED,
                ));
            }
        };

        let org_id = match &req.org {
            Some(entry) => entry.org.id.clone(),
            None => OrgId::new(req.path.as_ref()),
        };
        let cpe_key = match CpeKey::from_parts(
            &org_id,
            &inform.device_id.oui,
            &inform.device_id.serial_number,
        ) {
            Ok(cpe_key) => cpe_key,
            Err(err) => {
                warn!("Inform carried an unusable device identity: {}", err);
                return WorkerReply::envelope(cwmp::fault(
                    &inform.id,
                    inform.version,
                    FaultCode::AcsInvalidArgs,
                    MALFORMED,
                ));
            }
        };

        if inform.triggered_by_connection_request() {
            info!("{} checked in on a connection request", cpe_key);
        }
        if zero_touch {
            info!("{} checked in on zero-touch credentials", cpe_key);
        }

        // A re-Inform for a device we already have a session with supersedes it.
        if let Some(old) = self.sessions.remove(&cpe_key) {
            self.by_token.remove(old.token.as_ref());
        }

        let token = StickyToken::mint(&self.host, self.index);
        let reply = WorkerReply {
            status: StatusCode::OK,
            body: Some(cwmp::inform_response(&inform.id, inform.version)),
            www_authenticate: None,
            set_cookie: Some(token.clone()),
        };
        self.by_token.insert(token.as_ref().to_string(), cpe_key.clone());
        self.sessions.insert(
            cpe_key.clone(),
            Session {
                cpe_key,
                token,
                version: inform.version,
                zero_touch,
                queue: VecDeque::new(),
                phase: Phase::Established,
                last_activity: Instant::now(),
            },
        );
        reply
    }

    fn in_session(&mut self, cpe_key: &CpeKey, req: &ForwardedRequest) -> WorkerReply {
        // Split-borrow dance: decide, then mutate.
        let session = self.sessions.get_mut(cpe_key).unwrap(/* keyed by by_token */);
        session.last_activity = Instant::now();

        if req.body.trim().is_empty() {
            return match session.queue.pop_front() {
                Some(rpc) => {
                    debug!("sending {} to {}", rpc.name, session.cpe_key);
                    session.phase = Phase::RpcOutstanding { name: rpc.name };
                    WorkerReply::envelope(rpc.envelope)
                }
                None => {
                    debug!("closing the session with {}", session.cpe_key);
                    self.close(cpe_key);
                    WorkerReply::closed()
                }
            };
        }

        match cwmp::parse(&req.body) {
            Ok(CpeMessage::Inform(inform)) => {
                // A mid-session Inform (value change, reboot) just restarts the conversation.
                session.version = inform.version;
                session.phase = Phase::Established;
                WorkerReply::envelope(cwmp::inform_response(&inform.id, inform.version))
            }
            Ok(CpeMessage::Response { name, .. }) => {
                match &session.phase {
                    Phase::RpcOutstanding { name: sent } => {
                        info!("{} completed {} for {}", name, sent, session.cpe_key)
                    }
                    Phase::Established => {
                        warn!("unsolicited {} from {}", name, session.cpe_key)
                    }
                }
                session.phase = Phase::Established;
                self.next_or_close(cpe_key)
            }
            Ok(CpeMessage::Fault { code, detail, .. }) => {
                warn!(
                    "{} faulted ({}): {}",
                    session.cpe_key,
                    code.map(|c| c.to_string()).unwrap_or_else(|| "?".to_string()),
                    detail
                );
                session.phase = Phase::Established;
                self.next_or_close(cpe_key)
            }
            Ok(CpeMessage::Rpc { name, id }) => {
                info!("{} sent {}", session.cpe_key, name);
                let version = session.version;
                WorkerReply::envelope(cwmp::rpc_response(&name, &id, version))
            }
            Err(err) => {
                debug!("failed to parse a POST from {}: {}", session.cpe_key, err);
                let version = session.version;
                WorkerReply::envelope(cwmp::fault(
                    &None,
                    version,
                    FaultCode::AcsInvalidArgs,
                    MALFORMED,
                ))
            }
        }
    }

    fn next_or_close(&mut self, cpe_key: &CpeKey) -> WorkerReply {
        let session = self.sessions.get_mut(cpe_key).unwrap(/* keyed by by_token */);
        match session.queue.pop_front() {
            Some(rpc) => {
                debug!("sending {} to {}", rpc.name, session.cpe_key);
                session.phase = Phase::RpcOutstanding { name: rpc.name };
                WorkerReply::envelope(rpc.envelope)
            }
            None => {
                self.close(cpe_key);
                WorkerReply::closed()
            }
        }
    }

    fn close(&mut self, cpe_key: &CpeKey) {
        if let Some(session) = self.sessions.remove(cpe_key) {
            if session.zero_touch {
                info!("the zero-touch session with {} ended", session.cpe_key);
            }
            self.by_token.remove(session.token.as_ref());
        }
    }

    fn enqueue(&mut self, cpe_key: &CpeKey, rpc: OutboundRpc) {
        match self.sessions.get_mut(cpe_key) {
            Some(session) => {
                debug!("queueing {} for {}", rpc.name, cpe_key);
                session.queue.push_back(rpc);
            }
            // Not ours (or no session at all); a connection request is the way to reach a
            // device that isn't mid-session.
            None => debug!("no session for {} on worker {}", cpe_key, self.index),
        }
    }

    fn sweep(&mut self) {
        let idle_timeout = self.idle_timeout;
        let stale: Vec<CpeKey> = self
            .sessions
            .values()
            .filter(|s| s.last_activity.elapsed() >= idle_timeout)
            .map(|s| s.cpe_key.clone())
            .collect();
        for cpe_key in stale {
            info!("sweeping the idle session with {}", cpe_key);
            self.close(&cpe_key);
        }
    }
}

async fn run_worker(
    index: WorkerIndex,
    host: String,
    idle_timeout: Duration,
    mut rx: mpsc::Receiver<WorkerMsg>,
) {
    let mut state = WorkerState {
        index,
        host,
        idle_timeout,
        sessions: HashMap::new(),
        by_token: HashMap::new(),
    };
    // interval() panics on a zero period; a zero idle-timeout just sweeps eagerly.
    let mut sweeper = tokio::time::interval((idle_timeout / 2).max(Duration::from_millis(1)));
    sweeper.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(WorkerMsg::Request(req)) => state.handle(req),
                Some(WorkerMsg::Enqueue { cpe_key, rpc }) => state.enqueue(&cpe_key, rpc),
                None => {
                    debug!("worker {} shutting down", state.index);
                    break;
                },
            },
            _ = sweeper.tick() => state.sweep(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           WorkerPool                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The fixed set of session workers.
///
/// First-contact requests are assigned round-robin; every request after that is routed by the
/// worker index baked into the sticky token. If a worker dies its sessions die with it-- the
/// affected CPEs re-Inform on their retry timers & land on live workers.
pub struct WorkerPool {
    senders: Vec<mpsc::Sender<WorkerMsg>>,
    next: AtomicUsize,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(cfg: &Config, host: &str) -> WorkerPool {
        let count = cfg.workers.max(1);
        let mut senders = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let (tx, rx) = mpsc::channel(cfg.channel_depth);
            senders.push(tx);
            handles.push(tokio::spawn(run_worker(
                WorkerIndex(i),
                host.to_string(),
                cfg.idle_timeout,
                rx,
            )));
        }
        info!("spawned {} session worker(s)", count);
        WorkerPool {
            senders,
            next: AtomicUsize::new(0),
            handles,
        }
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// The worker for a device's first contact; round-robin.
    pub fn pick(&self) -> WorkerIndex {
        WorkerIndex(self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len())
    }

    /// The channel to a given worker, or None if the token names a worker we don't have.
    pub fn sender(&self, index: WorkerIndex) -> Option<mpsc::Sender<WorkerMsg>> {
        self.senders.get(index.0).cloned()
    }

    /// Queue an RPC for a device; the worker owning its session (if any) will deliver it on the
    /// session's next empty POST.
    pub async fn enqueue(&self, cpe_key: &CpeKey, rpc: &OutboundRpc) {
        // Sessions aren't tracked centrally; offer it to every worker & let the owner keep it.
        for sender in &self.senders {
            let _ = sender
                .send(WorkerMsg::Enqueue {
                    cpe_key: cpe_key.clone(),
                    rpc: rpc.clone(),
                })
                .await;
        }
    }

    pub async fn shutdown(self) {
        drop(self.senders);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::entities::Organization;

    static INFORM: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:cwmp="urn:dslforum-org:cwmp-1-1">
  <soapenv:Header><cwmp:ID soapenv:mustUnderstand="1">42</cwmp:ID></soapenv:Header>
  <soapenv:Body>
    <cwmp:Inform>
      <DeviceId>
        <Manufacturer>Acme Networks</Manufacturer>
        <OUI>A1B2C3</OUI>
        <ProductClass>GigaHub</ProductClass>
        <SerialNumber>CXNK0011AABB</SerialNumber>
      </DeviceId>
      <Event><EventStruct><EventCode>2 PERIODIC</EventCode></EventStruct></Event>
    </cwmp:Inform>
  </soapenv:Body>
</soapenv:Envelope>"#;

    static GPV_RESPONSE: &str = r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:cwmp="urn:dslforum-org:cwmp-1-1"><soapenv:Header><cwmp:ID soapenv:mustUnderstand="1">7</cwmp:ID></soapenv:Header><soapenv:Body><cwmp:GetParameterValuesResponse><ParameterList/></cwmp:GetParameterValuesResponse></soapenv:Body></soapenv:Envelope>"#;

    fn acme_entry() -> Arc<OrgEntry> {
        Arc::new(OrgEntry::new(
            Organization {
                id: OrgId::new("acme"),
                url_path: "acme".parse().unwrap(),
                acs_username: "acme".to_string(),
                acs_password: "s3cr3t".to_string().into(),
                https_enabled: true,
            },
            Duration::from_secs(300),
        ))
    }

    async fn post(
        pool: &WorkerPool,
        org: Option<Arc<OrgEntry>>,
        token: Option<StickyToken>,
        authorization: Option<&str>,
        body: &str,
    ) -> WorkerReply {
        let index = token.as_ref().map(|t| t.worker()).unwrap_or_else(|| pool.pick());
        let (tx, rx) = oneshot::channel();
        pool.sender(index)
            .unwrap()
            .send(WorkerMsg::Request(ForwardedRequest {
                org,
                path: "acme".parse().unwrap(),
                token,
                authorization: authorization.map(str::to_string),
                body: body.to_string(),
                reply: tx,
            }))
            .await
            .unwrap();
        rx.await.unwrap()
    }

    const GOOD_AUTH: Option<&str> = Some("Basic YWNtZTpzM2NyM3Q=");

    #[tokio::test]
    async fn a_session_opens_with_an_inform_and_closes_on_an_empty_post() {
        let pool = WorkerPool::spawn(&Config::default(), "edge-1");

        let reply = post(&pool, Some(acme_entry()), None, GOOD_AUTH, INFORM).await;
        assert_eq!(StatusCode::OK, reply.status);
        assert!(reply.body.unwrap().contains("InformResponse"));
        let token = reply.set_cookie.unwrap();

        let reply = post(&pool, Some(acme_entry()), Some(token.clone()), None, "").await;
        assert_eq!(StatusCode::NO_CONTENT, reply.status);
        assert!(reply.body.is_none());

        // The session is gone; the token is now stale.
        let reply = post(&pool, Some(acme_entry()), Some(token), None, "").await;
        assert_eq!(StatusCode::BAD_REQUEST, reply.status);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn missing_credentials_draw_a_challenge() {
        let pool = WorkerPool::spawn(&Config::default(), "edge-1");

        let reply = post(&pool, Some(acme_entry()), None, None, INFORM).await;
        assert_eq!(StatusCode::UNAUTHORIZED, reply.status);
        assert_eq!(
            Some("Basic YWNtZTpzM2NyM3Q="),
            reply.www_authenticate.as_deref()
        );

        let reply = post(&pool, Some(acme_entry()), None, Some("Basic d3Jvbmc="), INFORM).await;
        assert_eq!(StatusCode::UNAUTHORIZED, reply.status);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn zero_touch_is_admitted_without_an_organization() {
        let pool = WorkerPool::spawn(&Config::default(), "edge-1");
        let reply = post(&pool, None, None, None, INFORM).await;
        assert_eq!(StatusCode::OK, reply.status);
        assert!(reply.set_cookie.is_some());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn protocol_faults_ride_http_200() {
        let pool = WorkerPool::spawn(&Config::default(), "edge-1");

        let reply = post(&pool, Some(acme_entry()), None, GOOD_AUTH, "not xml <<<").await;
        assert_eq!(StatusCode::OK, reply.status);
        let body = reply.body.unwrap();
        assert!(body.contains("<FaultCode>8003</FaultCode>"));
        assert!(body.contains(MALFORMED));

        // Sessions open with an Inform; a response out of the blue is a fault too.
        let reply = post(&pool, Some(acme_entry()), None, GOOD_AUTH, GPV_RESPONSE).await;
        assert_eq!(StatusCode::OK, reply.status);
        assert!(reply.body.unwrap().contains("<FaultCode>8003</FaultCode>"));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn queued_rpcs_go_out_one_per_round_trip() {
        let pool = WorkerPool::spawn(&Config::default(), "edge-1");

        let reply = post(&pool, Some(acme_entry()), None, GOOD_AUTH, INFORM).await;
        let token = reply.set_cookie.unwrap();
        let cpe_key = CpeKey::new("acme-A1B2C3-CXNK0011AABB").unwrap();
        pool.enqueue(
            &cpe_key,
            &OutboundRpc {
                name: "GetParameterValues".to_string(),
                envelope: "<fake-gpv/>".to_string(),
            },
        )
        .await;

        // Empty POST drains one RPC...
        let reply = post(&pool, Some(acme_entry()), Some(token.clone()), None, "").await;
        assert_eq!(StatusCode::OK, reply.status);
        assert_eq!(Some("<fake-gpv/>"), reply.body.as_deref());

        // ...& its response, with nothing left queued, closes the session.
        let reply = post(&pool, Some(acme_entry()), Some(token), None, GPV_RESPONSE).await;
        assert_eq!(StatusCode::NO_CONTENT, reply.status);
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn idle_sessions_are_swept() {
        let pool = WorkerPool::spawn(
            &Config {
                workers: 1,
                idle_timeout: Duration::from_millis(50),
                channel_depth: 16,
            },
            "edge-1",
        );
        let reply = post(&pool, Some(acme_entry()), None, GOOD_AUTH, INFORM).await;
        let token = reply.set_cookie.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let reply = post(&pool, Some(acme_entry()), Some(token), None, "").await;
        assert_eq!(StatusCode::BAD_REQUEST, reply.status);
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn a_zero_idle_timeout_still_serves() {
        let pool = WorkerPool::spawn(
            &Config {
                workers: 1,
                idle_timeout: Duration::ZERO,
                channel_depth: 16,
            },
            "edge-1",
        );
        let reply = post(&pool, Some(acme_entry()), None, GOOD_AUTH, INFORM).await;
        assert_eq!(StatusCode::OK, reply.status);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn first_contacts_round_robin() {
        let pool = WorkerPool::spawn(
            &Config {
                workers: 3,
                ..Config::default()
            },
            "edge-1",
        );
        assert_eq!(WorkerIndex(0), pool.pick());
        assert_eq!(WorkerIndex(1), pool.pick());
        assert_eq!(WorkerIndex(2), pool.pick());
        assert_eq!(WorkerIndex(0), pool.pick());
        pool.shutdown().await;
    }
}
