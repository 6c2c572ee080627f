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

//! # storage
//!
//! Abstractions for the chronicle storage layer: the append-only notification log, the dispatcher
//! pickup queue, and the backing object store the dispatcher applies mutations to.
//!
//! Application code writes to this generic API; at startup a particular *implementation* is
//! chosen according to configuration ([crate::memory] in-process, or [crate::scylla] against a
//! ScyllaDB/Cassandra cluster).

use async_trait::async_trait;
use chrono::Duration;
use serde_json::{Map, Value};

use crate::entities::{Notification, ObjectKind, RequestId};

/// Opaque storage error.
///
/// Each backend has its own rich error type; at this seam all the caller can do with a storage
/// failure is log it & abort the current request, so the trait erases the details.
#[derive(Debug)]
pub struct Error {
    source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error {
            source: Box::new(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A stored archive object, as the dispatcher & activity feed see it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObjectRecord {
    pub kind: ObjectKind,
    pub key: String,
    pub fields: Map<String, Value>,
}

/// Object-safe trait abstracting over the chronicle backends.
///
/// Contract, over and above the signatures:
///
/// - `append` is durable & never overwrites an existing notification; at most one notification
///   exists per `(req_id, phase)`. A storage failure here is fatal to the calling request.
/// - Reads are monotonic per `req_id`: a terminal notification appended after a request
///   notification is never observed while the request notification is not.
/// - `find_by_request_id` returns the *earliest-appended* terminal notification for the id if one
///   exists (the fixed tie-break should a double-processed dispatch ever append two), else the
///   request notification, else None.
/// - `lease_request` hands out a request notification not currently under lease and without a
///   terminal notification, marking it leased for `lease`; a worker that crashes mid-apply simply
///   lets the lease lapse and the request is picked up again. `close_request` retires it.
#[async_trait]
pub trait Backend {
    async fn append(&self, notification: Notification) -> Result<Notification>;
    async fn find_by_request_id(&self, req_id: RequestId) -> Result<Option<Notification>>;
    /// Most-recent-first, at most `n`; feeds the activity view & nothing else.
    async fn recent(&self, n: usize) -> Result<Vec<Notification>>;
    async fn lease_request(&self, lease: Duration) -> Result<Option<Notification>>;
    async fn close_request(&self, req_id: RequestId) -> Result<()>;
    async fn get_object(&self, kind: ObjectKind, key: &str) -> Result<Option<ObjectRecord>>;
    async fn put_object(&self, record: ObjectRecord) -> Result<()>;
    /// Returns true if the object existed.
    async fn delete_object(&self, kind: ObjectKind, key: &str) -> Result<bool>;
}
