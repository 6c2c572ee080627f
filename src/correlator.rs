// Copyright (C) 2025 the chronicle authors
//
// This file is part of chronicle.
//
// chronicle is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// chronicle is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with chronicle.  If not,
// see <http://www.gnu.org/licenses/>.

//! # correlator
//!
//! Turn the asynchronous, fire-and-eventually-respond notification log into a
//! synchronous-looking, tri-state answer for a request handler: did my request succeed, fail, or
//! is the dispatcher still chewing on it?
//!
//! The system this replaces implemented the wait as a sleep-poll loop, pinning a web worker for
//! the full timeout on every pending request. Here the wait is event-driven: terminal appends
//! made by *this* process wake waiters immediately through a [Signals] registry of per-request
//! [Notify] handles, and a periodic re-check of the log covers terminals appended by a dispatcher
//! running in some other process. Either way the contract is identical: a terminal notification
//! resolves the wait, and a deadline bounds it.
//!
//! A [ReplyState::Pending] answer is a designed-for outcome under load or dispatcher lag, *not*
//! an error; callers must present it as "still pending", never as "failed".

use std::{collections::HashMap, sync::Arc, sync::Mutex, time::Duration};

use serde::Deserialize;
use snafu::prelude::*;
use tokio::{
    sync::Notify,
    time::{sleep, sleep_until, Instant},
};
use tracing::debug;

use crate::{
    counter_add,
    entities::{Phase, RequestId},
    metrics::{self, Instruments, Sort},
    storage::{self, Backend},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to query the notification log: {source}"))]
    Log { source: storage::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           ReplyState                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The three observable states of a request, derived from the log.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReplyState {
    Succeeded,
    Failed,
    Pending,
}

impl ReplyState {
    /// The integer codes callers of the historical API grew up with: 0 succeeded, 1 failed, 2
    /// pending.
    pub fn code(&self) -> i32 {
        match self {
            ReplyState::Succeeded => 0,
            ReplyState::Failed => 1,
            ReplyState::Pending => 2,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Signals                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Registry of per-request wakeups.
///
/// Whoever appends a terminal notification in this process calls [Signals::raise]; waiters
/// blocked in [Correlator::wait_response] wake immediately instead of sleeping out their re-check
/// interval. Appends made by other processes are not signalled here, which is why the correlator
/// re-checks the log periodically regardless.
#[derive(Default)]
pub struct Signals {
    waiters: Mutex<HashMap<RequestId, Arc<Notify>>>,
}

impl Signals {
    pub fn new() -> Signals {
        Signals::default()
    }

    pub fn raise(&self, req_id: RequestId) {
        if let Some(notify) = self.waiters.lock().unwrap().get(&req_id) {
            notify.notify_waiters();
        }
    }

    fn waiter(&self, req_id: RequestId) -> Arc<Notify> {
        self.waiters
            .lock()
            .unwrap()
            .entry(req_id)
            .or_default()
            .clone()
    }

    fn release(&self, req_id: RequestId) {
        let mut waiters = self.waiters.lock().unwrap();
        // Drop the map entry once we hold the last outside reference; concurrent waiters on the
        // same req_id keep it alive.
        if let Some(notify) = waiters.get(&req_id) {
            if Arc::strong_count(notify) <= 2 {
                waiters.remove(&req_id);
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Correlator                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Configuration parameters for the correlated wait
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// How long `wait_response` blocks before conceding Pending, absent a caller override
    #[serde(rename = "default-timeout")]
    pub default_timeout: Duration,
    /// How often to re-check the log for terminals appended out-of-process
    #[serde(rename = "recheck-interval")]
    pub recheck_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(5),
            recheck_interval: Duration::from_millis(500),
        }
    }
}

inventory::submit! { metrics::Registration::new("correlator.waits.succeeded", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("correlator.waits.failed", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("correlator.waits.pending", Sort::IntegralCounter) }

pub struct Correlator {
    storage: Arc<dyn Backend + Send + Sync>,
    signals: Arc<Signals>,
    config: Config,
    instruments: Arc<Instruments>,
}

impl Correlator {
    pub fn new(
        storage: Arc<dyn Backend + Send + Sync>,
        signals: Arc<Signals>,
        config: Config,
        instruments: Arc<Instruments>,
    ) -> Correlator {
        Correlator {
            storage,
            signals,
            config,
            instruments,
        }
    }

    /// Block until a terminal notification for `req_id` is visible, or `timeout` (the configured
    /// default if None) elapses.
    ///
    /// Pure read path: no side effects beyond log reads. The answer is stable: whichever terminal
    /// the log reports first (earliest by log order, per the [Backend] contract) is the answer
    /// for that `req_id`, forever.
    pub async fn wait_response(
        &self,
        req_id: RequestId,
        timeout: Option<Duration>,
    ) -> Result<ReplyState> {
        let deadline = Instant::now() + timeout.unwrap_or(self.config.default_timeout);
        let notify = self.signals.waiter(req_id);
        // Balance the registration on *every* exit path, error included; req_ids are unique, so
        // an entry stranded by an early return would sit in the map forever.
        let result = self.wait_until(req_id, &notify, deadline).await;
        self.signals.release(req_id);

        if let Ok(state) = result.as_ref() {
            debug!("wait_response({}) resolved {:?}", req_id, state);
            match state {
                ReplyState::Succeeded => {
                    counter_add!(self.instruments, "correlator.waits.succeeded", 1, &[])
                }
                ReplyState::Failed => {
                    counter_add!(self.instruments, "correlator.waits.failed", 1, &[])
                }
                ReplyState::Pending => {
                    counter_add!(self.instruments, "correlator.waits.pending", 1, &[])
                }
            }
        }
        result
    }

    /// The wait loop proper; [wait_response](Correlator::wait_response) owns the [Signals]
    /// bookkeeping around it.
    async fn wait_until(
        &self,
        req_id: RequestId,
        notify: &Notify,
        deadline: Instant,
    ) -> Result<ReplyState> {
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            // Register for a wakeup *before* checking the log, so a signal raised between the
            // check & the select below isn't lost.
            notified.as_mut().enable();

            match self
                .storage
                .find_by_request_id(req_id)
                .await
                .context(LogSnafu)?
            {
                Some(n) if n.phase == Phase::Success => return Ok(ReplyState::Succeeded),
                Some(n) if n.phase == Phase::Fail => return Ok(ReplyState::Failed),
                _ => (), // nothing yet, or only the request notification
            }
            // The check above runs once more after the deadline fires, so a terminal landing at
            // the buzzer is reported rather than conceded Pending.
            if Instant::now() >= deadline {
                return Ok(ReplyState::Pending);
            }

            tokio::select! {
                _ = &mut notified => (),
                _ = sleep(self.config.recheck_interval) => (),
                _ = sleep_until(deadline) => (),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        entities::{Notification, ObjectKind, Operation, Phase, Sender},
        memory::Memory,
        payload::Payload,
    };
    use chrono::Utc;

    fn notification(req_id: RequestId, phase: Phase) -> Notification {
        let mut obj = serde_json::Map::new();
        obj.insert("name".to_string(), serde_json::json!("foo"));
        obj.insert("container".to_string(), serde_json::json!("/"));
        Notification {
            req_id,
            object_type: ObjectKind::Collection,
            operation: Operation::Create,
            phase,
            sender: Sender::new("alice").unwrap(),
            object_key: "/foo".to_string(),
            payload: Payload::new(obj, None),
            date: Utc::now(),
            message: None,
        }
    }

    fn correlator(storage: Arc<Memory>, signals: Arc<Signals>) -> Correlator {
        Correlator::new(
            storage,
            signals,
            Config {
                default_timeout: Duration::from_millis(250),
                recheck_interval: Duration::from_millis(50),
            },
            Arc::new(Instruments::new("chronicle")),
        )
    }

    // No notifications at all: Pending, once the timeout has elapsed.
    #[tokio::test]
    async fn pending_when_log_is_silent() {
        let correlator = correlator(Arc::new(Memory::new()), Arc::new(Signals::new()));
        let begin = std::time::Instant::now();
        let state = correlator
            .wait_response(RequestId::new(), None)
            .await
            .unwrap();
        assert_eq!(state, ReplyState::Pending);
        assert!(begin.elapsed() >= Duration::from_millis(250));
    }

    // A signalled terminal resolves the wait well before the timeout.
    #[tokio::test]
    async fn success_resolves_promptly() {
        let storage = Arc::new(Memory::new());
        let signals = Arc::new(Signals::new());
        let req_id = RequestId::new();
        {
            use crate::storage::Backend;
            storage
                .append(notification(req_id, Phase::Request))
                .await
                .unwrap();
        }

        let appender = {
            let storage = storage.clone();
            let signals = signals.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                use crate::storage::Backend;
                storage
                    .append(notification(req_id, Phase::Success))
                    .await
                    .unwrap();
                signals.raise(req_id);
            })
        };

        let correlator = correlator(storage, signals);
        let begin = std::time::Instant::now();
        let state = correlator
            .wait_response(req_id, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(state, ReplyState::Succeeded);
        assert!(begin.elapsed() < Duration::from_secs(1));
        appender.await.unwrap();
    }

    // Same, for a failure appended *without* an in-process signal: the re-check interval picks
    // it up, the way it would were the dispatcher a separate process.
    #[tokio::test]
    async fn unsignalled_fail_resolves_within_recheck() {
        let storage = Arc::new(Memory::new());
        let req_id = RequestId::new();
        {
            use crate::storage::Backend;
            storage
                .append(notification(req_id, Phase::Request))
                .await
                .unwrap();
            storage
                .append(notification(req_id, Phase::Fail))
                .await
                .unwrap();
        }
        let correlator = correlator(storage, Arc::new(Signals::new()));
        let state = correlator
            .wait_response(req_id, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(state, ReplyState::Failed);
    }

    // Double-processed dispatch: two terminals, and the answer never alternates.
    #[tokio::test]
    async fn first_terminal_is_sticky() {
        let storage = Arc::new(Memory::new());
        let req_id = RequestId::new();
        {
            use crate::storage::Backend;
            storage
                .append(notification(req_id, Phase::Request))
                .await
                .unwrap();
            storage
                .append(notification(req_id, Phase::Fail))
                .await
                .unwrap();
            storage
                .append(notification(req_id, Phase::Success))
                .await
                .unwrap();
        }
        let correlator = correlator(storage, Arc::new(Signals::new()));
        for _ in 0..4 {
            assert_eq!(
                correlator.wait_response(req_id, None).await.unwrap(),
                ReplyState::Failed
            );
        }
    }

    // A terminal already on the log must be reported even when the deadline has effectively
    // elapsed; the loop checks the log once more before conceding Pending.
    #[tokio::test]
    async fn terminal_at_the_deadline_still_resolves() {
        let storage = Arc::new(Memory::new());
        let req_id = RequestId::new();
        storage
            .append(notification(req_id, Phase::Request))
            .await
            .unwrap();
        storage
            .append(notification(req_id, Phase::Success))
            .await
            .unwrap();
        let correlator = correlator(storage, Arc::new(Signals::new()));
        assert_eq!(
            correlator
                .wait_response(req_id, Some(Duration::ZERO))
                .await
                .unwrap(),
            ReplyState::Succeeded
        );
    }

    struct Unavailable;

    fn outage() -> storage::Error {
        storage::Error::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "storage offline",
        ))
    }

    #[async_trait::async_trait]
    impl Backend for Unavailable {
        async fn append(&self, _: Notification) -> storage::Result<Notification> {
            Err(outage())
        }
        async fn find_by_request_id(
            &self,
            _: RequestId,
        ) -> storage::Result<Option<Notification>> {
            Err(outage())
        }
        async fn recent(&self, _: usize) -> storage::Result<Vec<Notification>> {
            Err(outage())
        }
        async fn lease_request(
            &self,
            _: chrono::Duration,
        ) -> storage::Result<Option<Notification>> {
            Err(outage())
        }
        async fn close_request(&self, _: RequestId) -> storage::Result<()> {
            Err(outage())
        }
        async fn get_object(
            &self,
            _: ObjectKind,
            _: &str,
        ) -> storage::Result<Option<storage::ObjectRecord>> {
            Err(outage())
        }
        async fn put_object(&self, _: storage::ObjectRecord) -> storage::Result<()> {
            Err(outage())
        }
        async fn delete_object(&self, _: ObjectKind, _: &str) -> storage::Result<bool> {
            Err(outage())
        }
    }

    // A storage outage fails the wait, but must not strand wakeup registrations; req_ids are
    // unique, so nothing would ever clean a leaked entry.
    #[tokio::test]
    async fn failed_waits_release_their_signals() {
        let signals = Arc::new(Signals::new());
        let correlator = Correlator::new(
            Arc::new(Unavailable),
            signals.clone(),
            Config::default(),
            Arc::new(Instruments::new("chronicle")),
        );
        for _ in 0..10 {
            assert!(correlator
                .wait_response(RequestId::new(), None)
                .await
                .is_err());
        }
        assert!(signals.waiters.lock().unwrap().is_empty());
    }

    #[test]
    fn codes() {
        assert_eq!(ReplyState::Succeeded.code(), 0);
        assert_eq!(ReplyState::Failed.code(), 1);
        assert_eq!(ReplyState::Pending.code(), 2);
    }
}
