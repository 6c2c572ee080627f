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

//! # dispatcher
//!
//! The other writer of the notification log: a background worker that consumes `request`
//! notifications, applies the requested mutation to the backing object store, and appends exactly
//! one terminal notification (`success` or `fail`) under the same `req_id`.
//!
//! The dispatcher is decoupled in time & failure domain from the request handlers that feed it;
//! it may lag arbitrarily (which is why a pending wait is a designed-for outcome upstream). Two
//! properties matter more than throughput:
//!
//! 1. **Idempotence on replay.** Delivery is at-least-once: a worker may crash after applying a
//!    mutation but before closing the request, and the lapsed lease will hand the same request to
//!    another worker. Before applying, a worker checks for an existing terminal notification for
//!    the `req_id` and skips reapplication if one is present.
//! 2. **No request left behind.** Short of a crash in the narrow window between apply & append,
//!    every leased request ends in a terminal notification; apply-time rejections (name conflict,
//!    missing parent, missing target) are `fail` terminals with a human-readable reason, not
//!    errors.
//!
//! Shutdown follows the shape used elsewhere in this codebase: the worker loop `select!`s over
//! work and an [Notify] instance, and the [Dispatcher] handle resolves to the loop's result.

use std::{future::Future, pin::Pin, sync::Arc, task::Poll, time::Duration};

use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value};
use snafu::{prelude::*, Backtrace};
use tokio::{
    sync::Notify,
    task::{JoinError, JoinHandle},
};
use tracing::{debug, error, info};

use crate::{
    correlator::Signals,
    counter_add,
    entities::{Notification, ObjectKind, Operation, Phase},
    metrics::{self, Instruments, Sort},
    payload::Payload,
    storage::{self, Backend, ObjectRecord},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to append a terminal notification: {source}"))]
    Append { source: storage::Error },
    #[snafu(display("Failed to apply a mutation to the object store: {source}"))]
    Apply { source: storage::Error },
    #[snafu(display("Failed to close-out a request: {source}"))]
    Close { source: storage::Error },
    #[snafu(display("The configured lease duration is unusable: {source}"))]
    Lease {
        source: chrono::OutOfRangeError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to lease a request: {source}"))]
    Pickup { source: storage::Error },
    #[snafu(display("The dispatcher failed to run to completion: {source}"))]
    Join {
        source: JoinError,
        backtrace: Backtrace,
    },
    #[snafu(display("Timeout shutting-down the dispatcher: {source}"))]
    ShutdownTimeout {
        source: tokio::time::error::Elapsed,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         configuration                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Configuration parameters for dispatching requests
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Amount of time to sleep when there are no requests to pick up
    #[serde(rename = "poll-interval")]
    pub poll_interval: Duration,
    /// How long a leased request is considered "taken" before other workers may retry it
    pub lease: Duration,
    /// Amount of time to wait for an in-flight request on shutdown
    #[serde(rename = "shutdown-timeout")]
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            lease: Duration::from_secs(60),
            shutdown_timeout: Duration::from_millis(500),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        applying requests                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The business-level outcome of attempting a mutation; distinct from [Error], which is reserved
/// for infrastructure failures.
enum ApplyOutcome {
    /// The mutation took; `echo` is the payload to carry on the success notification, with pre-
    /// and/or post-images filled in.
    Applied { echo: Payload },
    /// The mutation is unapplyable (conflict, missing parent, missing target); `reason` becomes
    /// the fail notification's message.
    Rejected { reason: String },
}

fn container_of(obj: &Map<String, Value>) -> Option<&str> {
    obj.get("container").and_then(|v| v.as_str())
}

/// Apply one request to the object store.
///
/// Uniform across object kinds: the only kind-specific behavior (identifying fields, parent
/// containers) comes off [ObjectKind]'s own methods, not a per-kind code path here.
async fn apply(
    storage: &(dyn Backend + Send + Sync),
    request: &Notification,
) -> storage::Result<ApplyOutcome> {
    let kind = request.object_type;
    let key = request.object_key.as_str();
    let obj = &request.payload.obj;
    let existing = storage.get_object(kind, key).await?;

    match request.operation {
        Operation::Create => {
            if existing.is_some() {
                return Ok(ApplyOutcome::Rejected {
                    reason: format!("{} '{}' already exists", kind, key),
                });
            }
            if kind.has_container() {
                // "/" is the root; it always exists. Anything else must be a collection we know.
                let container = container_of(obj).unwrap_or("/");
                if container != "/"
                    && storage
                        .get_object(ObjectKind::Collection, container)
                        .await?
                        .is_none()
                {
                    return Ok(ApplyOutcome::Rejected {
                        reason: format!("Container '{}' doesn't exist", container),
                    });
                }
            }
            storage
                .put_object(ObjectRecord {
                    kind,
                    key: key.to_owned(),
                    fields: obj.clone(),
                })
                .await?;
            let mut echo = request.payload.clone();
            echo.post = Some(obj.clone());
            Ok(ApplyOutcome::Applied { echo })
        }
        Operation::Update => match existing {
            None => Ok(ApplyOutcome::Rejected {
                reason: format!("{} '{}' doesn't exist", kind, key),
            }),
            Some(record) => {
                let mut merged = record.fields.clone();
                merged.extend(obj.clone().into_iter());
                storage
                    .put_object(ObjectRecord {
                        kind,
                        key: key.to_owned(),
                        fields: merged.clone(),
                    })
                    .await?;
                let mut echo = request.payload.clone();
                echo.pre = Some(record.fields);
                echo.post = Some(merged);
                Ok(ApplyOutcome::Applied { echo })
            }
        },
        Operation::Delete => match existing {
            None => Ok(ApplyOutcome::Rejected {
                reason: format!("{} '{}' doesn't exist", kind, key),
            }),
            Some(record) => {
                storage.delete_object(kind, key).await?;
                let mut echo = request.payload.clone();
                echo.pre = Some(record.fields);
                Ok(ApplyOutcome::Applied { echo })
            }
        },
    }
}

inventory::submit! { metrics::Registration::new("dispatcher.requests.applied", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("dispatcher.requests.failed", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("dispatcher.requests.skipped", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("dispatcher.requests.inflight", Sort::IntegralGauge) }

/// Drive one leased request to its terminal notification.
///
/// Public so that a deployment can run dispatch workers in a separate process from the web tier;
/// such a process calls `lease_request`/`handle_request` itself on whatever schedule suits it.
pub async fn handle_request(
    storage: &(dyn Backend + Send + Sync),
    signals: &Signals,
    instruments: &Instruments,
    request: Notification,
) -> Result<()> {
    // At-least-once delivery: if some other worker (or an earlier incarnation of this one)
    // already recorded a terminal for this id, do *not* reapply.
    if let Some(n) = storage
        .find_by_request_id(request.req_id)
        .await
        .context(PickupSnafu)?
    {
        if n.is_terminal() {
            debug!(
                "request {} already has a {} notification; skipping",
                request.req_id, n.phase
            );
            counter_add!(instruments, "dispatcher.requests.skipped", 1, &[]);
            return storage
                .close_request(request.req_id)
                .await
                .context(CloseSnafu);
        }
    }

    let (phase, payload, message) = match apply(storage, &request).await.context(ApplySnafu)? {
        ApplyOutcome::Applied { echo } => (Phase::Success, echo, None),
        ApplyOutcome::Rejected { reason } => {
            info!("request {} rejected: {}", request.req_id, reason);
            (Phase::Fail, request.payload.clone(), Some(reason))
        }
    };

    storage
        .append(Notification {
            req_id: request.req_id,
            object_type: request.object_type,
            operation: request.operation,
            phase,
            sender: request.sender.clone(),
            object_key: request.object_key.clone(),
            payload,
            date: Utc::now(),
            message,
        })
        .await
        .context(AppendSnafu)?;
    signals.raise(request.req_id);
    storage
        .close_request(request.req_id)
        .await
        .context(CloseSnafu)?;

    match phase {
        Phase::Success => counter_add!(instruments, "dispatcher.requests.applied", 1, &[]),
        _ => counter_add!(instruments, "dispatcher.requests.failed", 1, &[]),
    }
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        the worker loop                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn process(
    storage: Arc<dyn Backend + Send + Sync>,
    signals: Arc<Signals>,
    config: Config,
    shutdown: Arc<Notify>,
    instruments: Arc<Instruments>,
) -> Result<()> {
    let lease = chrono::Duration::from_std(config.lease).context(LeaseSnafu)?;
    let mut done = false;
    while !done {
        match storage.lease_request(lease).await.context(PickupSnafu)? {
            Some(request) => {
                crate::gauge_setu!(instruments, "dispatcher.requests.inflight", 1, &[]);
                handle_request(storage.as_ref(), &signals, &instruments, request).await?;
                crate::gauge_setu!(instruments, "dispatcher.requests.inflight", 0, &[]);
            }
            None => {
                // Nothing to do; hang out a bit, while remaining mindful of our shutdown
                // notification.
                tokio::select! {
                    _ = tokio::time::sleep(config.poll_interval) => (),
                    _ = shutdown.notified() => {
                        done = true;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Handle to the running dispatch worker; drop-in analog of a `JoinHandle`, with an orderly
/// `shutdown`.
pub struct Dispatcher {
    worker: JoinHandle<Result<()>>,
    shutdown: Arc<Notify>,
}

impl Future for Dispatcher {
    type Output = std::result::Result<Result<()>, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().worker).poll(cx)
    }
}

impl Dispatcher {
    /// Signal the worker to exit & wait (up to the configured shutdown timeout) for it to do so.
    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        self.shutdown.notify_one();
        tokio::time::timeout(timeout, self.worker)
            .await
            .context(ShutdownTimeoutSnafu)?
            .context(JoinSnafu)?
    }
    /// Split the instance back into it's parts
    ///
    /// This is convenient when waiting on the worker along with other futures (in a
    /// `tokio::select!` invocation, e.g.)
    pub fn into_parts(self) -> (JoinHandle<Result<()>>, Arc<Notify>) {
        (self.worker, self.shutdown)
    }
}

/// Spawn the dispatch worker.
pub fn new(
    storage: Arc<dyn Backend + Send + Sync>,
    signals: Arc<Signals>,
    config: Option<Config>,
    instruments: Arc<Instruments>,
) -> Dispatcher {
    let shutdown = Arc::new(Notify::new());
    let worker = tokio::spawn(process(
        storage,
        signals,
        config.unwrap_or_default(),
        shutdown.clone(),
        instruments,
    ));
    Dispatcher { worker, shutdown }
}

/// Convenience for operators watching a dispatcher from a supervisory task: log & swallow the
/// worker's exit status.
pub fn log_exit(result: std::result::Result<Result<()>, JoinError>) {
    match result {
        Ok(Ok(())) => info!("dispatcher exited cleanly"),
        Ok(Err(err)) => error!("dispatcher failed: {}", err),
        Err(err) => error!("dispatcher panicked: {}", err),
    }
}
