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

//! # feed
//!
//! The activity feed: the most recent N notifications, rendered as a human-readable audit trail.
//! This is a secondary, strictly read-only consumer of the log — it shares no correlation
//! semantics with the request path.
//!
//! The interesting part is degradation. A notification refers to its object by key, but the
//! object may have been deleted (or renamed) since; in that case we reconstruct a best-effort
//! description from the notification's own payload, using the normalized pre-/post-image accessor
//! on [Payload] rather than guessing which key to read per object kind. When even that image is
//! missing the entry gets the `"ERROR"` placeholder name instead of being dropped or blowing up:
//! an audit trail that omits entries it can't prettify isn't much of an audit trail.
//!
//! [Payload]: crate::payload::Payload

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use snafu::prelude::*;

use crate::{
    entities::{Notification, ObjectKind, Operation},
    storage::{self, Backend},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to read the notification log: {source}"))]
    Log { source: storage::Error },
    #[snafu(display("Failed to resolve an object reference: {source}"))]
    Resolve { source: storage::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Name used when neither the object store nor the notification payload can describe the target.
pub const FALLBACK_NAME: &str = "ERROR";

/// The actor behind an activity entry, resolved to a live user when possible.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Profile {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// False when the sender's account no longer exists & this is a placeholder synthesized from
    /// the raw sender string.
    pub resolved: bool,
}

/// One entry in the activity feed.
#[derive(Clone, Debug, Serialize)]
pub struct Activity {
    pub date: DateTime<Utc>,
    pub operation: Operation,
    pub object_type: ObjectKind,
    pub object_name: String,
    /// Current object description, or the best-effort reconstruction from the payload.
    pub object: Map<String, Value>,
    /// False when `object` was reconstructed rather than read from the store.
    pub live: bool,
    pub sender: Profile,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub struct Feed {
    storage: Arc<dyn Backend + Send + Sync>,
}

impl Feed {
    pub fn new(storage: Arc<dyn Backend + Send + Sync>) -> Feed {
        Feed { storage }
    }

    /// The `n` most recent notifications, most recent first, rendered.
    pub async fn recent(&self, n: usize) -> Result<Vec<Activity>> {
        let notifications = self.storage.recent(n).await.context(LogSnafu)?;
        let mut activities = Vec::with_capacity(notifications.len());
        for notification in notifications {
            activities.push(self.render(&notification).await?);
        }
        Ok(activities)
    }

    async fn render(&self, notification: &Notification) -> Result<Activity> {
        let kind = notification.object_type;

        let (object, live) = match self
            .storage
            .get_object(kind, &notification.object_key)
            .await
            .context(ResolveSnafu)?
        {
            Some(record) => (record.fields, true),
            // Deleted (or never applied): fall back to the notification's own image of the
            // object.
            None => (
                notification
                    .payload
                    .image(notification.operation)
                    .cloned()
                    .unwrap_or_default(),
                false,
            ),
        };
        let object_name = match object.get(kind.name_field()).and_then(Value::as_str) {
            Some(name) if !name.is_empty() => name.to_owned(),
            _ => FALLBACK_NAME.to_owned(),
        };

        let sender = self.resolve_sender(notification).await?;
        let summary = format!(
            "{} of {} '{}' by {}",
            notification.operation.noun(),
            kind,
            object_name,
            sender.name
        );

        Ok(Activity {
            date: notification.date,
            operation: notification.operation,
            object_type: kind,
            object_name,
            object,
            live,
            sender,
            summary,
            message: notification.message.clone(),
        })
    }

    async fn resolve_sender(&self, notification: &Notification) -> Result<Profile> {
        let raw = notification.sender.as_str();
        Ok(match self
            .storage
            .get_object(ObjectKind::User, raw)
            .await
            .context(ResolveSnafu)?
        {
            Some(record) => Profile {
                name: record
                    .fields
                    .get("login")
                    .and_then(Value::as_str)
                    .unwrap_or(raw)
                    .to_owned(),
                email: record
                    .fields
                    .get("email")
                    .and_then(Value::as_str)
                    .map(String::from),
                resolved: true,
            },
            None => Profile {
                name: raw.to_owned(),
                email: None,
                resolved: false,
            },
        })
    }
}
