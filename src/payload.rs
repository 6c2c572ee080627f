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

//! # payload
//!
//! A [Payload] is the envelope describing one requested mutation: `{obj: {...}, meta: {sender}}`,
//! optionally carrying pre-/post-images of the affected object. An [Intent] tags a payload with
//! the (operation, object kind) pair it's meant to effect, and [Intent::validate] is the *only*
//! gatekeeper between a payload and the notification log.
//!
//! Validation is deliberately pure: it never touches storage, and it can't tell you whether the
//! target object exists, whether the name conflicts, or anything else the dispatcher will discover
//! at apply time. It answers exactly one question: are the fields that identify the target present
//! and non-empty?

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snafu::{prelude::*, Backtrace};

use crate::entities::{ObjectKind, Operation, Sender};

#[derive(Debug, Snafu)]
pub enum Error {
    // These display strings are load-bearing: callers and tests match on them, and they're the
    // messages users have seen for years.
    #[snafu(display("Information is missing for the {kind}: {fields}"))]
    MissingInformation {
        kind: ObjectKind,
        fields: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Missing object in payload"))]
    MissingObject { backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Join a container path & a name into a single path, collapsing the separator.
pub fn merge_path(container: &str, name: &str) -> String {
    format!("{}/{}", container.trim_end_matches('/'), name)
}

/// `meta` portion of a payload: bookkeeping about the mutation rather than its content.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Meta {
    /// Identity of the actor requesting the mutation; when absent, the notifier substitutes its
    /// configured system sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<Sender>,
}

/// The structured description of one requested mutation.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Payload {
    /// Field name → value for the mutation itself. Which fields are *required* depends on the
    /// operation & object kind; anything else rides along untouched.
    #[serde(default)]
    pub obj: Map<String, Value>,
    #[serde(default)]
    pub meta: Meta,
    /// Pre-image of the target, echoed into terminal notifications by the dispatcher for updates
    /// & deletes; the activity feed falls back on it once the object itself is gone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre: Option<Map<String, Value>>,
    /// Post-image, echoed for creates & updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post: Option<Map<String, Value>>,
}

impl Payload {
    pub fn new(obj: Map<String, Value>, sender: Option<Sender>) -> Payload {
        Payload {
            obj,
            meta: Meta { sender },
            pre: None,
            post: None,
        }
    }

    /// The best available image of the affected object for a given operation.
    ///
    /// The historical payloads kept the pre-image under `pre` for deletes & updates and the
    /// post-image under `post` for creates; consumers guessed which key to read on a per-kind
    /// basis, which is exactly the sort of ad-hoc divination this accessor replaces. Falls back
    /// to `obj`, the requested mutation itself, which is better than nothing.
    pub fn image(&self, operation: Operation) -> Option<&Map<String, Value>> {
        let preferred = match operation {
            Operation::Create | Operation::Update => self.post.as_ref(),
            Operation::Delete => self.pre.as_ref(),
        };
        preferred.or(if self.obj.is_empty() {
            None
        } else {
            Some(&self.obj)
        })
    }
}

/// A payload tagged with the (operation, kind) pair it intends to effect.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Intent {
    pub operation: Operation,
    pub kind: ObjectKind,
    pub payload: Payload,
}

impl Intent {
    pub fn new(operation: Operation, kind: ObjectKind, payload: Payload) -> Intent {
        Intent {
            operation,
            kind,
            payload,
        }
    }

    /// Check that every field identifying the target of this mutation is present & non-empty.
    ///
    /// Pure; no storage access. Create, update & delete all require the same identifying fields
    /// (name + container, name, or login, per kind); any further fields are optional and ignored
    /// here if absent.
    pub fn validate(&self) -> Result<()> {
        let obj = &self.payload.obj;
        if obj.is_empty() {
            return MissingObjectSnafu.fail();
        }
        let missing = self
            .kind
            .key_fields()
            .iter()
            .filter(|field| {
                !matches!(obj.get(**field), Some(Value::String(s)) if !s.is_empty())
            })
            .copied()
            .collect::<Vec<&str>>();
        if missing.is_empty() {
            Ok(())
        } else {
            MissingInformationSnafu {
                kind: self.kind,
                fields: missing.join(", "),
            }
            .fail()
        }
    }

    /// The canonical key (path, name or login) of the target; None if validation would fail.
    pub fn object_key(&self) -> Option<String> {
        self.kind.object_key(&self.payload.obj)
    }

    pub fn sender(&self) -> Option<&Sender> {
        self.payload.meta.sender.as_ref()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn obj(pairs: &[(&str, &str)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    // Every (operation, kind) pair rejects a payload missing any identifying field, and accepts
    // one with all of them present.
    #[test]
    fn validation_totality() {
        let ops = [Operation::Create, Operation::Update, Operation::Delete];
        let cases: &[(ObjectKind, &[(&str, &str)])] = &[
            (ObjectKind::Collection, &[("name", "foo"), ("container", "/")]),
            (ObjectKind::Resource, &[("name", "r.dat"), ("container", "/foo")]),
            (ObjectKind::Group, &[("name", "admins")]),
            (ObjectKind::User, &[("login", "alice")]),
        ];
        for op in ops {
            for (kind, complete) in cases {
                let good = Intent::new(op, *kind, Payload::new(obj(complete), None));
                assert!(good.validate().is_ok(), "{op} {kind} should validate");
                assert!(good.object_key().is_some());

                // Drop each identifying field in turn.
                for (drop, _) in complete.iter() {
                    let partial = complete
                        .iter()
                        .filter(|(k, _)| k != drop)
                        .cloned()
                        .collect::<Vec<_>>();
                    let mut fields = obj(&partial);
                    // Keep the payload non-empty so we exercise the per-field message, not the
                    // missing-object one.
                    fields.insert("extra".to_string(), json!("x"));
                    let bad = Intent::new(op, *kind, Payload::new(fields, None));
                    let err = bad.validate().unwrap_err();
                    assert!(
                        err.to_string()
                            .starts_with(&format!("Information is missing for the {kind}: ")),
                        "unexpected message: {err}"
                    );
                    assert!(err.to_string().contains(drop));
                }
            }
        }
    }

    #[test]
    fn empty_fields_are_missing() {
        let intent = Intent::new(
            Operation::Delete,
            ObjectKind::User,
            Payload::new(obj(&[("login", "")]), None),
        );
        assert_eq!(
            intent.validate().unwrap_err().to_string(),
            "Information is missing for the user: login"
        );
    }

    #[test]
    fn empty_object_rejected() {
        let intent = Intent::new(
            Operation::Create,
            ObjectKind::Group,
            Payload::new(Map::new(), None),
        );
        assert_eq!(
            intent.validate().unwrap_err().to_string(),
            "Missing object in payload"
        );
    }

    #[test]
    fn image_preference() {
        let mut payload = Payload::new(obj(&[("name", "g")]), None);
        payload.pre = Some(obj(&[("name", "old")]));
        payload.post = Some(obj(&[("name", "new")]));
        assert_eq!(
            payload.image(Operation::Create).unwrap().get("name"),
            Some(&json!("new"))
        );
        assert_eq!(
            payload.image(Operation::Delete).unwrap().get("name"),
            Some(&json!("old"))
        );
        let bare = Payload::new(obj(&[("name", "g")]), None);
        assert_eq!(
            bare.image(Operation::Delete).unwrap().get("name"),
            Some(&json!("g"))
        );
        assert!(Payload::default().image(Operation::Create).is_none());
    }

    #[test]
    fn merge_paths() {
        assert_eq!(merge_path("/", "foo"), "/foo");
        assert_eq!(merge_path("/foo/", "bar"), "/foo/bar");
        assert_eq!(merge_path("/foo", "bar"), "/foo/bar");
    }
}
