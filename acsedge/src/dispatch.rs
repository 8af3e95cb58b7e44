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

//! # acsedge background dispatch
//!
//! A reusable polling dispatcher for work that arrives in a shared queue & must be executed
//! with bounded concurrency. On a fixed cadence the [Poller] peeks at up to `cap - outstanding`
//! items, *claims* each one (the queue is shared among edge nodes; a claim succeeds on exactly
//! one of them), & hands claimed items to the dispatcher on their own tasks. The outstanding
//! count is incremented before dispatch & decremented on every completion path, so the cap
//! holds even when dispatch panics.
//!
//! Queued connection requests ride this; so could any future deferred-work feature.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace};
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, error};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Work queue error: {source}"))]
    Queue {
        source: Box<dyn std::error::Error + Send + Sync>,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             traits                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A queue of pending work, shared among edge nodes.
#[async_trait]
pub trait WorkQueue: Send + Sync + 'static {
    type Item: Send + 'static;
    /// Up to `max` pending items, without removing them.
    async fn peek(&self, max: usize) -> Result<Vec<Self::Item>>;
    /// Atomically take ownership of `item`; false means another node got there first.
    async fn claim(&self, item: &Self::Item) -> Result<bool>;
}

/// The work itself.
#[async_trait]
pub trait Dispatcher<T: Send + 'static>: Send + Sync + 'static {
    async fn dispatch(&self, item: T);
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          configuration                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Time between polls of the work queue
    #[serde(rename = "poll-interval")]
    pub poll_interval: Duration,
    /// Maximum number of items in flight at once
    #[serde(rename = "max-outstanding")]
    pub max_outstanding: usize,
    /// How long `shutdown` waits for in-flight work to finish
    #[serde(rename = "shutdown-timeout")]
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            poll_interval: Duration::from_secs(10),
            max_outstanding: 32,
            shutdown_timeout: Duration::from_millis(500),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Poller                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

// Decrements on drop, so a panicking dispatch still releases its slot.
struct Slot(Arc<AtomicUsize>);

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Poller {
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
    outstanding: Arc<AtomicUsize>,
    shutdown_timeout: Duration,
}

impl Poller {
    pub fn spawn<Q, D>(queue: Arc<Q>, dispatcher: Arc<D>, cfg: Config) -> Poller
    where
        Q: WorkQueue,
        D: Dispatcher<Q::Item>,
    {
        let shutdown = Arc::new(Notify::new());
        let outstanding = Arc::new(AtomicUsize::new(0));
        let handle = tokio::spawn(Poller::poll(
            queue,
            dispatcher,
            cfg.clone(),
            shutdown.clone(),
            outstanding.clone(),
        ));
        Poller {
            handle,
            shutdown,
            outstanding,
            shutdown_timeout: cfg.shutdown_timeout,
        }
    }

    async fn poll<Q, D>(
        queue: Arc<Q>,
        dispatcher: Arc<D>,
        cfg: Config,
        shutdown: Arc<Notify>,
        outstanding: Arc<AtomicUsize>,
    ) where
        Q: WorkQueue,
        D: Dispatcher<Q::Item>,
    {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(cfg.poll_interval) => { },
                _ = shutdown.notified() => {
                    debug!("poller shutting down");
                    break;
                },
            }
            let in_flight = outstanding.load(Ordering::SeqCst);
            if in_flight >= cfg.max_outstanding {
                debug!("at capacity ({} outstanding); skipping this poll", in_flight);
                continue;
            }
            let batch = match queue.peek(cfg.max_outstanding - in_flight).await {
                Ok(batch) => batch,
                Err(err) => {
                    error!("failed to peek the work queue: {}", err);
                    continue;
                }
            };
            for item in batch {
                match queue.claim(&item).await {
                    Ok(true) => {
                        outstanding.fetch_add(1, Ordering::SeqCst);
                        let slot = Slot(outstanding.clone());
                        let dispatcher = dispatcher.clone();
                        tokio::spawn(async move {
                            let _slot = slot;
                            dispatcher.dispatch(item).await;
                        });
                    }
                    // Another node claimed it; nothing to do.
                    Ok(false) => { }
                    Err(err) => error!("failed to claim a work item: {}", err),
                }
            }
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Stop polling & give in-flight work until the configured timeout to drain.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if tokio::time::timeout(self.shutdown_timeout, self.handle)
            .await
            .is_err()
        {
            error!("the poller failed to stop in time");
        }
        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        while self.outstanding.load(Ordering::SeqCst) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      in-memory work queue                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A [WorkQueue] held entirely in this process; tests & single-node deployments.
pub struct InMemoryQueue<T> {
    items: std::sync::Mutex<Vec<T>>,
}

impl<T: Clone + PartialEq + Send + 'static> InMemoryQueue<T> {
    pub fn new() -> InMemoryQueue<T> {
        InMemoryQueue {
            items: std::sync::Mutex::new(Vec::new()),
        }
    }
    pub fn push(&self, item: T) {
        self.items.lock().expect("lock poisoned").push(item);
    }
    pub fn len(&self) -> usize {
        self.items.lock().expect("lock poisoned").len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone + PartialEq + Send + 'static> Default for InMemoryQueue<T> {
    fn default() -> Self {
        InMemoryQueue::new()
    }
}

#[async_trait]
impl<T: Clone + PartialEq + Send + Sync + 'static> WorkQueue for InMemoryQueue<T> {
    type Item = T;
    async fn peek(&self, max: usize) -> Result<Vec<T>> {
        Ok(self
            .items
            .lock()
            .expect("lock poisoned")
            .iter()
            .take(max)
            .cloned()
            .collect())
    }
    async fn claim(&self, item: &T) -> Result<bool> {
        let mut items = self.items.lock().expect("lock poisoned");
        match items.iter().position(|x| x == item) {
            Some(idx) => {
                items.remove(idx);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
