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

//! # notifier
//!
//! The request-issuing half of the protocol: validate a mutation [Intent], stamp it with a fresh
//! [RequestId] & a sender, and append it to the notification log as a `request` notification for
//! the dispatcher to find.
//!
//! One wrinkle worth spelling out: when a payload fails *validation*, no request notification is
//! ever appended and the dispatcher never hears about the attempt. The audit trail must still
//! record it, so this is the one case in which the request path appends a terminal `fail`
//! notification itself. That fail never reaches the dispatcher & the caller short-circuits to a
//! failed outcome without consulting the correlator.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use snafu::prelude::*;
use tracing::{debug, info};

use crate::{
    correlator::Signals,
    counter_add,
    entities::{Notification, ObjectKind, Operation, Phase, RequestId, Sender},
    metrics::{self, Instruments, Sort},
    payload::{self, Intent, Payload},
    storage::{self, Backend},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to append a notification: {source}"))]
    Append { source: storage::Error },
    #[snafu(display("{source}"))]
    Validation { source: payload::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Configuration parameters for the request path
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Sender recorded when a payload's `meta.sender` is absent. The system this replaces read
    /// an ambient global for this; here it's an explicit, injected value.
    #[serde(rename = "default-sender")]
    pub default_sender: Sender,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_sender: Sender::new("chronicle").unwrap(/* known good */),
        }
    }
}

inventory::submit! { metrics::Registration::new("notifier.requests", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("notifier.validation-failures", Sort::IntegralCounter) }

pub struct Notifier {
    storage: Arc<dyn Backend + Send + Sync>,
    signals: Arc<Signals>,
    config: Config,
    instruments: Arc<Instruments>,
}

impl Notifier {
    pub fn new(
        storage: Arc<dyn Backend + Send + Sync>,
        signals: Arc<Signals>,
        config: Config,
        instruments: Arc<Instruments>,
    ) -> Notifier {
        Notifier {
            storage,
            signals,
            config,
            instruments,
        }
    }

    /// Validate `intent` & append it to the log as a request notification, returning the
    /// just-appended record (whose `req_id` the caller hands to the correlator).
    ///
    /// On validation failure, appends the audit `fail` notification & returns
    /// [Error::Validation]; the caller's outcome is failed, immediately, with no wait.
    pub async fn request(&self, intent: Intent) -> Result<Notification> {
        let req_id = RequestId::new();
        let sender = intent
            .sender()
            .cloned()
            .unwrap_or_else(|| self.config.default_sender.clone());

        if let Err(err) = intent.validate() {
            info!(
                "rejecting {} {} request: {}",
                intent.operation, intent.kind, err
            );
            counter_add!(self.instruments, "notifier.validation-failures", 1, &[]);
            // Best-effort object key; an invalid payload may well not have one.
            let object_key = intent.object_key().unwrap_or_default();
            self.storage
                .append(Notification {
                    req_id,
                    object_type: intent.kind,
                    operation: intent.operation,
                    phase: Phase::Fail,
                    sender,
                    object_key,
                    payload: intent.payload,
                    date: Utc::now(),
                    message: Some(err.to_string()),
                })
                .await
                .context(AppendSnafu)?;
            // The fail above is terminal & local; raise it anyway in case anyone is (wrongly)
            // waiting on this id.
            self.signals.raise(req_id);
            return Err(Error::Validation { source: err });
        }

        let notification = self
            .storage
            .append(Notification {
                req_id,
                object_type: intent.kind,
                operation: intent.operation,
                phase: Phase::Request,
                sender,
                object_key: intent.object_key().unwrap_or_default(),
                payload: intent.payload,
                date: Utc::now(),
                message: None,
            })
            .await
            .context(AppendSnafu)?;
        debug!(
            "appended {} {} request {}",
            notification.operation, notification.object_type, notification.req_id
        );
        counter_add!(self.instruments, "notifier.requests", 1, &[]);
        Ok(notification)
    }

    // The twelve named request operations of the old API, expressed through `request` rather
    // than twelve hand-rolled bodies.
    pub async fn create_collection_request(&self, payload: Payload) -> Result<Notification> {
        self.request(Intent::new(Operation::Create, ObjectKind::Collection, payload))
            .await
    }
    pub async fn update_collection_request(&self, payload: Payload) -> Result<Notification> {
        self.request(Intent::new(Operation::Update, ObjectKind::Collection, payload))
            .await
    }
    pub async fn delete_collection_request(&self, payload: Payload) -> Result<Notification> {
        self.request(Intent::new(Operation::Delete, ObjectKind::Collection, payload))
            .await
    }
    pub async fn create_resource_request(&self, payload: Payload) -> Result<Notification> {
        self.request(Intent::new(Operation::Create, ObjectKind::Resource, payload))
            .await
    }
    pub async fn update_resource_request(&self, payload: Payload) -> Result<Notification> {
        self.request(Intent::new(Operation::Update, ObjectKind::Resource, payload))
            .await
    }
    pub async fn delete_resource_request(&self, payload: Payload) -> Result<Notification> {
        self.request(Intent::new(Operation::Delete, ObjectKind::Resource, payload))
            .await
    }
    pub async fn create_group_request(&self, payload: Payload) -> Result<Notification> {
        self.request(Intent::new(Operation::Create, ObjectKind::Group, payload))
            .await
    }
    pub async fn update_group_request(&self, payload: Payload) -> Result<Notification> {
        self.request(Intent::new(Operation::Update, ObjectKind::Group, payload))
            .await
    }
    pub async fn delete_group_request(&self, payload: Payload) -> Result<Notification> {
        self.request(Intent::new(Operation::Delete, ObjectKind::Group, payload))
            .await
    }
    pub async fn create_user_request(&self, payload: Payload) -> Result<Notification> {
        self.request(Intent::new(Operation::Create, ObjectKind::User, payload))
            .await
    }
    pub async fn update_user_request(&self, payload: Payload) -> Result<Notification> {
        self.request(Intent::new(Operation::Update, ObjectKind::User, payload))
            .await
    }
    pub async fn delete_user_request(&self, payload: Payload) -> Result<Notification> {
        self.request(Intent::new(Operation::Delete, ObjectKind::User, payload))
            .await
    }
}
