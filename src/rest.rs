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

//! # rest
//!
//! The administrative REST surface over the request/notification core. Each write endpoint does
//! the same dance: build an [Intent] from the request body, hand it to the [Notifier], then block
//! on the [Correlator] (bounded by the configured timeout) & translate the tri-state answer into
//! HTTP:
//!
//! - Succeeded → 200 (201 for creates), with the terminal notification's detail
//! - Failed → 409, with the dispatcher's (or validator's) human-readable reason
//! - Pending → **202 Accepted** with the `req_id`: the mutation is *in flight*, not refused, and
//!   the client can poll `/requests/{req_id}` for the eventual outcome
//!
//! Authentication & authorization live in middleware outside this crate; these handlers trust
//! the payload's `meta.sender`.
//!
//! [Intent]: crate::payload::Intent
//! [Notifier]: crate::notifier::Notifier
//! [Correlator]: crate::correlator::Correlator

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer};
use tracing::error;

use crate::{
    correlator::{self, ReplyState},
    entities::{Notification, ObjectKind, Operation, RequestId},
    feed,
    http::{Chronicle, ErrorResponseBody},
    notifier,
    payload::{Intent, Payload},
    storage,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to render the activity feed: {source}"))]
    Activity { source: feed::Error },
    #[snafu(display("Failed to issue a request: {source}"))]
    Issue { source: notifier::Error },
    #[snafu(display("Failed to read the notification log: {source}"))]
    Log { source: storage::Error },
    #[snafu(display("Failed waiting on a reply: {source}"))]
    Wait { source: correlator::Error },
}

impl Error {
    pub fn as_status_and_msg(&self) -> (StatusCode, String) {
        match self {
            // Validation failures are the caller's to fix; everything else is on us.
            Error::Issue {
                source: notifier::Error::Validation { source },
            } => (StatusCode::BAD_REQUEST, format!("{}", source)),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error".to_string(),
            ),
        }
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let (code, msg) = self.as_status_and_msg();
        if code == StatusCode::INTERNAL_SERVER_ERROR {
            error!("request failed: {}", self);
        }
        (code, Json(ErrorResponseBody { error: msg })).into_response()
    }
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         write endpoints                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// What a write endpoint tells its caller.
#[derive(Debug, Deserialize, Serialize)]
pub struct RequestOutcome {
    pub req_id: RequestId,
    /// "succeeded", "failed" or "pending"
    pub state: String,
    /// The historical integer code: 0 succeeded, 1 failed, 2 pending
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn outcome(req_id: RequestId, state: ReplyState, message: Option<String>) -> RequestOutcome {
    RequestOutcome {
        req_id,
        state: match state {
            ReplyState::Succeeded => "succeeded",
            ReplyState::Failed => "failed",
            ReplyState::Pending => "pending",
        }
        .to_string(),
        code: state.code(),
        message,
    }
}

/// The common path: issue the intent, wait, translate.
async fn issue_and_wait(
    state: &Chronicle,
    intent: Intent,
) -> Result<(StatusCode, Json<RequestOutcome>)> {
    let operation = intent.operation;
    let request = state.notifier.request(intent).await.context(IssueSnafu)?;
    let reply = state
        .correlator
        .wait_response(request.req_id, None)
        .await
        .context(WaitSnafu)?;
    // For failed (and occasionally succeeded) replies the terminal notification carries the
    // human-readable detail.
    let message = match reply {
        ReplyState::Pending => None,
        _ => state
            .storage
            .find_by_request_id(request.req_id)
            .await
            .context(LogSnafu)?
            .and_then(|n| n.message),
    };
    let status = match (reply, operation) {
        (ReplyState::Succeeded, Operation::Create) => StatusCode::CREATED,
        (ReplyState::Succeeded, _) => StatusCode::OK,
        (ReplyState::Failed, _) => StatusCode::CONFLICT,
        (ReplyState::Pending, _) => StatusCode::ACCEPTED,
    };
    Ok((status, Json(outcome(request.req_id, reply, message))))
}

// One handler per (operation, kind) route; the bodies are uniform by construction, the
// per-kind/per-operation knowledge having been pushed down into `Intent`.
macro_rules! write_handler {
    ($name:ident, $op:expr, $kind:expr) => {
        async fn $name(
            State(state): State<Arc<Chronicle>>,
            Json(payload): Json<Payload>,
        ) -> Result<(StatusCode, Json<RequestOutcome>)> {
            issue_and_wait(&state, Intent::new($op, $kind, payload)).await
        }
    };
}

write_handler!(create_collection, Operation::Create, ObjectKind::Collection);
write_handler!(update_collection, Operation::Update, ObjectKind::Collection);
write_handler!(delete_collection, Operation::Delete, ObjectKind::Collection);
write_handler!(create_resource, Operation::Create, ObjectKind::Resource);
write_handler!(update_resource, Operation::Update, ObjectKind::Resource);
write_handler!(delete_resource, Operation::Delete, ObjectKind::Resource);
write_handler!(create_group, Operation::Create, ObjectKind::Group);
write_handler!(update_group, Operation::Update, ObjectKind::Group);
write_handler!(delete_group, Operation::Delete, ObjectKind::Group);
write_handler!(create_user, Operation::Create, ObjectKind::User);
write_handler!(update_user, Operation::Update, ObjectKind::User);
write_handler!(delete_user, Operation::Delete, ObjectKind::User);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         read endpoints                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Deserialize)]
struct ActivityParams {
    /// Number of entries to return; clamped to something sane server-side.
    n: Option<usize>,
}

const MAX_ACTIVITY_ENTRIES: usize = 100;
const DEFAULT_ACTIVITY_ENTRIES: usize = 10;

async fn activity(
    State(state): State<Arc<Chronicle>>,
    Query(params): Query<ActivityParams>,
) -> Result<Json<Vec<feed::Activity>>> {
    let n = params
        .n
        .unwrap_or(DEFAULT_ACTIVITY_ENTRIES)
        .min(MAX_ACTIVITY_ENTRIES);
    Ok(Json(
        state.feed.recent(n).await.context(ActivitySnafu)?,
    ))
}

/// Poll the state of an earlier request; the recourse of a caller who got a 202.
async fn request_state(
    State(state): State<Arc<Chronicle>>,
    Path(req_id): Path<RequestId>,
) -> Result<Json<RequestOutcome>> {
    let found: Option<Notification> = state
        .storage
        .find_by_request_id(req_id)
        .await
        .context(LogSnafu)?;
    let (reply, message) = match found {
        Some(n) if n.phase == crate::entities::Phase::Success => (ReplyState::Succeeded, n.message),
        Some(n) if n.phase == crate::entities::Phase::Fail => (ReplyState::Failed, n.message),
        // Request-only, or nothing yet visible: pending either way.
        _ => (ReplyState::Pending, None),
    };
    Ok(Json(outcome(req_id, reply, message)))
}

pub fn make_router(state: Arc<Chronicle>) -> Router {
    use axum::routing::{delete, post, put};
    Router::new()
        .route("/api/admin/collections", post(create_collection))
        .route("/api/admin/collections", put(update_collection))
        .route("/api/admin/collections", delete(delete_collection))
        .route("/api/admin/resources", post(create_resource))
        .route("/api/admin/resources", put(update_resource))
        .route("/api/admin/resources", delete(delete_resource))
        .route("/api/admin/groups", post(create_group))
        .route("/api/admin/groups", put(update_group))
        .route("/api/admin/groups", delete(delete_group))
        .route("/api/admin/users", post(create_user))
        .route("/api/admin/users", put(update_user))
        .route("/api/admin/users", delete(delete_user))
        .route("/api/requests/:req_id", get(request_state))
        .route("/api/activity", get(activity))
        // All responses are JSON; add the appropriate Content-Type header (but leave the
        // existing Content-Type header should a handler set it specially).
        .layer(SetResponseHeaderLayer::if_not_present(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        correlator::{Correlator, Signals},
        dispatcher::{self, Dispatcher},
        feed::Feed,
        memory::Memory,
        metrics::Instruments,
        notifier::Notifier,
    };
    use axum::{
        body::{to_bytes, Body},
        http::Request,
    };
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    #[test]
    fn outcome_codes() {
        assert_eq!(outcome(RequestId::new(), ReplyState::Succeeded, None).code, 0);
        assert_eq!(outcome(RequestId::new(), ReplyState::Failed, None).code, 1);
        assert_eq!(outcome(RequestId::new(), ReplyState::Pending, None).code, 2);
    }

    struct Stack {
        router: Router,
        storage: Arc<Memory>,
        dispatcher: Option<Dispatcher>,
    }

    fn stack(default_timeout: Duration, with_dispatcher: bool) -> Stack {
        let storage = Arc::new(Memory::new());
        let signals = Arc::new(Signals::new());
        let instruments = Arc::new(Instruments::new("chronicle"));
        let dispatcher = with_dispatcher.then(|| {
            dispatcher::new(
                storage.clone(),
                signals.clone(),
                Some(dispatcher::Config {
                    poll_interval: Duration::from_millis(25),
                    ..Default::default()
                }),
                instruments.clone(),
            )
        });
        let router = make_router(Arc::new(Chronicle {
            storage: storage.clone(),
            notifier: Notifier::new(
                storage.clone(),
                signals.clone(),
                notifier::Config::default(),
                instruments.clone(),
            ),
            correlator: Correlator::new(
                storage.clone(),
                signals,
                correlator::Config {
                    default_timeout,
                    recheck_interval: Duration::from_millis(25),
                },
                instruments,
            ),
            feed: Feed::new(storage.clone()),
        }));
        Stack {
            router,
            storage,
            dispatcher,
        }
    }

    fn write(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn read(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn outcome_of(response: axum::response::Response) -> RequestOutcome {
        serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await.unwrap())
            .unwrap()
    }

    // The write contract: 201 on an applied create, 409 + the terminal's reason on an apply-time
    // rejection, and the feed endpoint shows both attempts.
    #[tokio::test]
    async fn create_maps_to_201_and_rejection_to_409() {
        let stack = stack(Duration::from_secs(5), true);

        let response = stack
            .router
            .clone()
            .oneshot(write(
                "POST",
                "/api/admin/collections",
                json!({"obj": {"name": "foo", "container": "/"}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let outcome = outcome_of(response).await;
        assert_eq!(outcome.state, "succeeded");
        assert_eq!(outcome.code, 0);

        let response = stack
            .router
            .clone()
            .oneshot(write(
                "POST",
                "/api/admin/resources",
                json!({"obj": {"name": "r.dat", "container": "/nowhere"}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let outcome = outcome_of(response).await;
        assert_eq!(outcome.state, "failed");
        assert_eq!(outcome.code, 1);
        assert_eq!(
            outcome.message.as_deref(),
            Some("Container '/nowhere' doesn't exist")
        );

        let response = stack
            .router
            .clone()
            .oneshot(read("/api/activity?n=10"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let entries: Value =
            serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await.unwrap())
                .unwrap();
        // Request + terminal for each of the two writes.
        assert_eq!(entries.as_array().unwrap().len(), 4);

        stack
            .dispatcher
            .unwrap()
            .shutdown(Duration::from_secs(1))
            .await
            .unwrap();
    }

    // Validation failures are the caller's to fix: 400 with the canonical message, resolved
    // before the correlator is ever consulted.
    #[tokio::test]
    async fn validation_failures_map_to_400() {
        let stack = stack(Duration::from_secs(5), false);
        let response = stack
            .router
            .clone()
            .oneshot(write(
                "DELETE",
                "/api/admin/users",
                json!({"obj": {"email": "x@example.com"}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ErrorResponseBody =
            serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await.unwrap())
                .unwrap();
        assert_eq!(body.error, "Information is missing for the user: login");
    }

    // No dispatcher: the write concedes 202 Accepted with the req_id, and the poll endpoint
    // tracks the request from pending to succeeded once a dispatcher drains the backlog.
    #[tokio::test]
    async fn pending_writes_get_202_and_poll_resolves() {
        let stack = stack(Duration::from_millis(100), false);

        let response = stack
            .router
            .clone()
            .oneshot(write(
                "POST",
                "/api/admin/groups",
                json!({"obj": {"name": "admins"}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let outcome = outcome_of(response).await;
        assert_eq!(outcome.state, "pending");
        assert_eq!(outcome.code, 2);

        let uri = format!("/api/requests/{}", outcome.req_id);
        let response = stack.router.clone().oneshot(read(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(outcome_of(response).await.state, "pending");

        // A dispatcher finally comes up & applies the backlog.
        let dispatcher = dispatcher::new(
            stack.storage.clone(),
            Arc::new(Signals::new()),
            Some(dispatcher::Config {
                poll_interval: Duration::from_millis(25),
                ..Default::default()
            }),
            Arc::new(Instruments::new("chronicle")),
        );
        let mut state = String::new();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let response = stack.router.clone().oneshot(read(&uri)).await.unwrap();
            state = outcome_of(response).await.state;
            if state != "pending" {
                break;
            }
        }
        assert_eq!(state, "succeeded");
        dispatcher.shutdown(Duration::from_secs(1)).await.unwrap();
    }
}
