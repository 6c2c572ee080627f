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

//! # memory
//!
//! In-process [Backend] implementation: a `Mutex<Vec>` standing in for the notification log, and
//! hash maps for the object store & lease table. This is what the test suite runs against, and
//! what a single-node deployment gets with `storage-config = "Memory"`; it makes no pretense of
//! durability.
//!
//! [Backend]: crate::storage::Backend

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;
use snafu::{prelude::*, Backtrace};

use crate::{
    entities::{Notification, ObjectKind, Phase, RequestId},
    storage::{self, ObjectRecord},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("A {phase} notification already exists for request {req_id}"))]
    Duplicate {
        req_id: RequestId,
        phase: Phase,
        backtrace: Backtrace,
    },
}

type StdResult<T, E> = std::result::Result<T, E>;

#[derive(Default)]
pub struct Memory {
    /// Append-ordered; the log order *is* the Vec order, which gives us the earliest-terminal
    /// tie-break for free.
    log: Mutex<Vec<Notification>>,
    leases: Mutex<HashMap<RequestId, DateTime<Utc>>>,
    closed: Mutex<HashSet<RequestId>>,
    objects: Mutex<HashMap<(ObjectKind, String), ObjectRecord>>,
}

impl Memory {
    pub fn new() -> Memory {
        Memory::default()
    }
}

#[async_trait]
impl storage::Backend for Memory {
    async fn append(&self, notification: Notification) -> storage::Result<Notification> {
        let mut log = self.log.lock().unwrap(/* poisoned only if a holder panicked */);
        if log
            .iter()
            .any(|n| n.req_id == notification.req_id && n.phase == notification.phase)
        {
            return Err(storage::Error::new(
                DuplicateSnafu {
                    req_id: notification.req_id,
                    phase: notification.phase,
                }
                .build(),
            ));
        }
        log.push(notification.clone());
        Ok(notification)
    }

    async fn find_by_request_id(
        &self,
        req_id: RequestId,
    ) -> storage::Result<Option<Notification>> {
        let log = self.log.lock().unwrap();
        let terminal = log
            .iter()
            .find(|n| n.req_id == req_id && n.is_terminal())
            .cloned();
        Ok(terminal.or_else(|| {
            log.iter()
                .find(|n| n.req_id == req_id && n.phase == Phase::Request)
                .cloned()
        }))
    }

    async fn recent(&self, n: usize) -> storage::Result<Vec<Notification>> {
        let log = self.log.lock().unwrap();
        Ok(log
            .iter()
            .sorted_by(|a, b| b.date.cmp(&a.date))
            .take(n)
            .cloned()
            .collect())
    }

    async fn lease_request(&self, lease: Duration) -> storage::Result<Option<Notification>> {
        let log = self.log.lock().unwrap();
        let closed = self.closed.lock().unwrap();
        let mut leases = self.leases.lock().unwrap();
        let now = Utc::now();
        let candidate = log
            .iter()
            .find(|n| {
                n.phase == Phase::Request
                    && !closed.contains(&n.req_id)
                    && leases.get(&n.req_id).map_or(true, |until| *until <= now)
            })
            .cloned();
        if let Some(ref request) = candidate {
            leases.insert(request.req_id, now + lease);
        }
        Ok(candidate)
    }

    async fn close_request(&self, req_id: RequestId) -> storage::Result<()> {
        self.closed.lock().unwrap().insert(req_id);
        self.leases.lock().unwrap().remove(&req_id);
        Ok(())
    }

    async fn get_object(
        &self,
        kind: ObjectKind,
        key: &str,
    ) -> storage::Result<Option<ObjectRecord>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(&(kind, key.to_owned()))
            .cloned())
    }

    async fn put_object(&self, record: ObjectRecord) -> storage::Result<()> {
        self.objects
            .lock()
            .unwrap()
            .insert((record.kind, record.key.clone()), record);
        Ok(())
    }

    async fn delete_object(&self, kind: ObjectKind, key: &str) -> storage::Result<bool> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .remove(&(kind, key.to_owned()))
            .is_some())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        entities::{Operation, Sender},
        payload::Payload,
        storage::Backend,
    };
    use serde_json::json;

    fn notification(req_id: RequestId, phase: Phase) -> Notification {
        let mut obj = serde_json::Map::new();
        obj.insert("name".to_string(), json!("g"));
        Notification {
            req_id,
            object_type: ObjectKind::Group,
            operation: Operation::Create,
            phase,
            sender: Sender::new("alice").unwrap(),
            object_key: "g".to_string(),
            payload: Payload::new(obj, None),
            date: Utc::now(),
            message: None,
        }
    }

    #[tokio::test]
    async fn append_is_insert_only() {
        let backend = Memory::new();
        let req_id = RequestId::new();
        backend
            .append(notification(req_id, Phase::Request))
            .await
            .unwrap();
        assert!(backend
            .append(notification(req_id, Phase::Request))
            .await
            .is_err());
        // A different phase for the same request is fine.
        backend
            .append(notification(req_id, Phase::Success))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn terminal_preferred_over_request() {
        let backend = Memory::new();
        let req_id = RequestId::new();
        backend
            .append(notification(req_id, Phase::Request))
            .await
            .unwrap();
        assert_eq!(
            backend
                .find_by_request_id(req_id)
                .await
                .unwrap()
                .unwrap()
                .phase,
            Phase::Request
        );
        backend
            .append(notification(req_id, Phase::Fail))
            .await
            .unwrap();
        assert_eq!(
            backend
                .find_by_request_id(req_id)
                .await
                .unwrap()
                .unwrap()
                .phase,
            Phase::Fail
        );
    }

    // Two terminals for one req_id (a double-processed dispatch): the first-appended one wins,
    // consistently.
    #[tokio::test]
    async fn earliest_terminal_wins() {
        let backend = Memory::new();
        let req_id = RequestId::new();
        backend
            .append(notification(req_id, Phase::Request))
            .await
            .unwrap();
        backend
            .append(notification(req_id, Phase::Success))
            .await
            .unwrap();
        backend
            .append(notification(req_id, Phase::Fail))
            .await
            .unwrap();
        for _ in 0..3 {
            assert_eq!(
                backend
                    .find_by_request_id(req_id)
                    .await
                    .unwrap()
                    .unwrap()
                    .phase,
                Phase::Success
            );
        }
    }

    #[tokio::test]
    async fn leases_expire() {
        let backend = Memory::new();
        let req_id = RequestId::new();
        backend
            .append(notification(req_id, Phase::Request))
            .await
            .unwrap();

        let leased = backend
            .lease_request(Duration::milliseconds(-1)) // already expired
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.req_id, req_id);
        // The lease lapsed immediately, so the request comes around again...
        assert!(backend
            .lease_request(Duration::minutes(5))
            .await
            .unwrap()
            .is_some());
        // ...but now it's held for five minutes.
        assert!(backend
            .lease_request(Duration::minutes(5))
            .await
            .unwrap()
            .is_none());
        backend.close_request(req_id).await.unwrap();
        assert!(backend
            .lease_request(Duration::minutes(5))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn recent_is_most_recent_first() {
        let backend = Memory::new();
        let mut expected = Vec::new();
        for i in 0..5 {
            let mut n = notification(RequestId::new(), Phase::Request);
            n.date = Utc::now() + Duration::seconds(i);
            expected.push(n.req_id);
            backend.append(n).await.unwrap();
        }
        expected.reverse();
        let recent = backend.recent(3).await.unwrap();
        assert_eq!(
            recent.iter().map(|n| n.req_id).collect::<Vec<_>>(),
            expected[..3]
        );
    }
}
