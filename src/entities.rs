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

//! # chronicle entities
//!
//! I hate these sort of "catch-all" modules named "models" or "entities", but these types are
//! truly foundational: every other module in the crate traffics in them.
//!
//! The historical system this crate replaces drifted between several spellings for what was
//! logically the same record (`uuid` versus `object_key`, `when` versus `date`, `sender` versus
//! `username`). This module fixes the canonical schema: `req_id`, `object_type`, `operation`,
//! `phase`, `sender`, `object_key`, `payload`, `date`, `message`.

use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use scylla::{
    deserialize::{DeserializationError, DeserializeValue, FrameSlice, TypeCheckError},
    frame::response::result::ColumnType,
    serialize::{
        value::SerializeValue,
        writers::{CellWriter, WrittenCellProof},
        SerializationError,
    },
};
use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace};
use uuid::Uuid;

use crate::payload::Payload;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{text} is not a recognized object kind"))]
    BadObjectKind { text: String, backtrace: Backtrace },
    #[snafu(display("{text} is not a recognized operation"))]
    BadOperation { text: String, backtrace: Backtrace },
    #[snafu(display("{text} is not a recognized notification phase"))]
    BadPhase { text: String, backtrace: Backtrace },
    #[snafu(display("{text} is not a valid request id: {source}"))]
    BadRequestId {
        text: String,
        source: uuid::Error,
        backtrace: Backtrace,
    },
}

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           RequestId                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Correlation identifier linking a request notification to its eventual terminal notification.
///
/// A newtype over [Uuid]; the wrapper exists so that a request id can't be confused with any other
/// identifier floating around the system. The derive macros for the ScyllaDB traits don't work
/// with newtype structs, so those are implemented by hand below.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> RequestId {
        RequestId(Uuid::new_v4())
    }
    pub fn from_raw_string(s: &str) -> StdResult<RequestId, uuid::Error> {
        Ok(RequestId(Uuid::parse_str(s)?))
    }
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.as_hyphenated())
    }
}

impl FromStr for RequestId {
    type Err = Error;
    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(RequestId)
            .context(BadRequestIdSnafu { text: s.to_owned() })
    }
}

impl<'frame, 'metadata> DeserializeValue<'frame, 'metadata> for RequestId {
    fn type_check(typ: &ColumnType<'_>) -> StdResult<(), TypeCheckError> {
        Uuid::type_check(typ)
    }
    fn deserialize(
        typ: &'metadata ColumnType<'metadata>,
        v: Option<FrameSlice<'frame>>,
    ) -> StdResult<Self, DeserializationError> {
        Ok(Self(<Uuid as DeserializeValue>::deserialize(typ, v)?))
    }
}

impl SerializeValue for RequestId {
    fn serialize<'b>(
        &self,
        typ: &ColumnType<'_>,
        writer: CellWriter<'b>,
    ) -> StdResult<WrittenCellProof<'b>, SerializationError> {
        SerializeValue::serialize(&self.0, typ, writer)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                  object kinds and operations                                   //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The four kinds of archive object a mutation can target.
///
/// Per-kind behavior (required payload fields, key extraction, whether a parent container must
/// exist) hangs off this enum rather than being re-derived with `if`/`else` chains at every call
/// site; the methods below are the single source of truth.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Collection,
    Resource,
    Group,
    User,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Collection => "collection",
            ObjectKind::Resource => "resource",
            ObjectKind::Group => "group",
            ObjectKind::User => "user",
        }
    }
    /// Payload fields that identify an object of this kind; these are mandatory for every
    /// operation (create, update & delete alike).
    pub fn key_fields(&self) -> &'static [&'static str] {
        match self {
            ObjectKind::Collection | ObjectKind::Resource => &["name", "container"],
            ObjectKind::Group => &["name"],
            ObjectKind::User => &["login"],
        }
    }
    /// Collections & resources live in a parent container which must exist before they can be
    /// created.
    pub fn has_container(&self) -> bool {
        matches!(self, ObjectKind::Collection | ObjectKind::Resource)
    }
    /// The payload field carrying this kind's display name.
    pub fn name_field(&self) -> &'static str {
        match self {
            ObjectKind::User => "login",
            _ => "name",
        }
    }
    /// Derive the canonical `object_key` (path, name or login) from an `obj` mapping, if the
    /// identifying fields are all present.
    pub fn object_key(&self, obj: &serde_json::Map<String, serde_json::Value>) -> Option<String> {
        fn text<'a>(
            obj: &'a serde_json::Map<String, serde_json::Value>,
            field: &str,
        ) -> Option<&'a str> {
            obj.get(field)
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
        }
        match self {
            ObjectKind::Collection | ObjectKind::Resource => Some(crate::payload::merge_path(
                text(obj, "container")?,
                text(obj, "name")?,
            )),
            ObjectKind::Group => text(obj, "name").map(String::from),
            ObjectKind::User => text(obj, "login").map(String::from),
        }
    }
}

impl Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = Error;
    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        match s {
            "collection" => Ok(ObjectKind::Collection),
            "resource" => Ok(ObjectKind::Resource),
            "group" => Ok(ObjectKind::Group),
            "user" => Ok(ObjectKind::User),
            _ => BadObjectKindSnafu { text: s.to_owned() }.fail(),
        }
    }
}

/// The three mutations the archive supports.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
    /// Noun form, for human-readable activity entries ("creation of...").
    pub fn noun(&self) -> &'static str {
        match self {
            Operation::Create => "creation",
            Operation::Update => "modification",
            Operation::Delete => "deletion",
        }
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;
    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            _ => BadOperationSnafu { text: s.to_owned() }.fail(),
        }
    }
}

/// Where a notification sits in a request's lifecycle.
///
/// The historical schema called this column `operation_type`, which collided confusingly with
/// `operation`; `phase` is the canonical name here. `Success` and `Fail` are the two *terminal*
/// phases: observing either ends the lifecycle of a `req_id`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Request,
    Success,
    Fail,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Request => "request",
            Phase::Success => "success",
            Phase::Fail => "fail",
        }
    }
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Success | Phase::Fail)
    }
}

impl Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Phase {
    type Err = Error;
    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        match s {
            "request" => Ok(Phase::Request),
            "success" => Ok(Phase::Success),
            "fail" => Ok(Phase::Fail),
            _ => BadPhaseSnafu { text: s.to_owned() }.fail(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Sender                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The identity of the actor behind a mutation.
///
/// Just a string, refined only enough to rule out the empty case; senders come from the
/// authentication tier, which is outside this crate, so there's nothing more to validate here.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Sender(String);

impl Sender {
    pub fn new(s: impl Into<String>) -> Option<Sender> {
        let s = s.into();
        if s.is_empty() {
            None
        } else {
            Some(Sender(s))
        }
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Notification                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One immutable record in the append-only notification log.
///
/// Created exactly once, by the request path (`phase` Request, or Fail on local validation
/// failure) or by the dispatcher (`phase` Success or Fail); read many times by the correlator &
/// the activity feed; never mutated, never deleted by this core.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Notification {
    pub req_id: RequestId,
    pub object_type: ObjectKind,
    pub operation: Operation,
    pub phase: Phase,
    pub sender: Sender,
    pub object_key: String,
    pub payload: Payload,
    pub date: DateTime<Utc>,
    /// Human-readable reason on Fail; None otherwise.
    pub message: Option<String>,
}

impl Notification {
    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}
