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

//! Whole-pipeline tests over the in-process backend: notifier, dispatcher & correlator wired
//! together the way `chronicled` wires them.

use std::{sync::Arc, time::Duration};

use serde_json::{json, Map, Value};

use chronicle::{
    correlator::{self, Correlator, ReplyState, Signals},
    dispatcher,
    entities::{ObjectKind, Phase},
    feed::Feed,
    memory::Memory,
    metrics::Instruments,
    notifier::{self, Notifier},
    payload::Payload,
    storage::Backend,
};

struct Harness {
    storage: Arc<Memory>,
    notifier: Notifier,
    correlator: Correlator,
    dispatcher: dispatcher::Dispatcher,
}

fn obj(pairs: &[(&str, &str)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), json!(v)))
        .collect()
}

fn harness() -> Harness {
    let storage = Arc::new(Memory::new());
    let signals = Arc::new(Signals::new());
    let instruments = Arc::new(Instruments::new("chronicle"));
    Harness {
        storage: storage.clone(),
        notifier: Notifier::new(
            storage.clone(),
            signals.clone(),
            notifier::Config::default(),
            instruments.clone(),
        ),
        correlator: Correlator::new(
            storage.clone(),
            signals.clone(),
            correlator::Config {
                default_timeout: Duration::from_secs(5),
                recheck_interval: Duration::from_millis(50),
            },
            instruments.clone(),
        ),
        dispatcher: dispatcher::new(
            storage,
            signals,
            Some(dispatcher::Config {
                poll_interval: Duration::from_millis(25),
                ..Default::default()
            }),
            instruments,
        ),
    }
}

// Create a collection as "alice"; the dispatcher applies it, the wait resolves SUCCEEDED well
// inside the timeout, and both the object store & the feed reflect the mutation.
#[tokio::test]
async fn create_collection_round_trip() {
    let h = harness();

    let payload = Payload::new(
        obj(&[("name", "foo"), ("container", "/")]),
        chronicle::entities::Sender::new("alice"),
    );
    let request = h.notifier.create_collection_request(payload).await.unwrap();
    assert_eq!(request.phase, Phase::Request);
    assert_eq!(request.sender.as_str(), "alice");

    let state = h
        .correlator
        .wait_response(request.req_id, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(state, ReplyState::Succeeded);

    let record = h
        .storage
        .get_object(ObjectKind::Collection, "/foo")
        .await
        .unwrap()
        .expect("collection not applied");
    assert_eq!(record.fields.get("name"), Some(&json!("foo")));

    let activities = Feed::new(h.storage.clone()).recent(10).await.unwrap();
    // Terminal first (most recent), then the request.
    assert_eq!(activities.len(), 2);
    assert_eq!(activities[0].summary, "creation of collection 'foo' by alice");

    h.dispatcher.shutdown(Duration::from_secs(1)).await.unwrap();
}

// A delete-user payload missing `login`: rejected locally with the canonical message, never seen
// by the dispatcher, and still on the log as an audit fail.
#[tokio::test]
async fn invalid_delete_user_fails_fast() {
    let h = harness();

    let err = h
        .notifier
        .delete_user_request(Payload::new(obj(&[("email", "x@example.com")]), None))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Information is missing for the user: login");

    let log = h.storage.recent(10).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].phase, Phase::Fail);
    assert_eq!(
        log[0].message.as_deref(),
        Some("Information is missing for the user: login")
    );
    // The correlator agrees: the audit fail is this request's terminal.
    assert_eq!(
        h.correlator
            .wait_response(log[0].req_id, None)
            .await
            .unwrap(),
        ReplyState::Failed
    );

    // Give the dispatcher a couple of poll intervals; it must find nothing to do.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let log = h.storage.recent(10).await.unwrap();
    assert_eq!(log.len(), 1);

    h.dispatcher.shutdown(Duration::from_secs(1)).await.unwrap();
}

// Apply-time failure: the dispatcher rejects a resource whose parent collection doesn't exist,
// and the caller sees FAILED with the dispatcher-supplied reason.
#[tokio::test]
async fn missing_parent_surfaces_as_failed() {
    let h = harness();

    let request = h
        .notifier
        .create_resource_request(Payload::new(
            obj(&[("name", "r.dat"), ("container", "/nowhere")]),
            None,
        ))
        .await
        .unwrap();

    let state = h
        .correlator
        .wait_response(request.req_id, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(state, ReplyState::Failed);

    let terminal = h
        .storage
        .find_by_request_id(request.req_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        terminal.message.as_deref(),
        Some("Container '/nowhere' doesn't exist")
    );

    h.dispatcher.shutdown(Duration::from_secs(1)).await.unwrap();
}

// No dispatcher at all: the wait runs out its (short) timeout & concedes PENDING, which is not an
// error, and a later wait on the same id still resolves once a terminal lands.
#[tokio::test]
async fn lagging_dispatcher_means_pending_then_resolution() {
    let storage = Arc::new(Memory::new());
    let signals = Arc::new(Signals::new());
    let instruments = Arc::new(Instruments::new("chronicle"));
    let notifier = Notifier::new(
        storage.clone(),
        signals.clone(),
        notifier::Config::default(),
        instruments.clone(),
    );
    let correlator = Correlator::new(
        storage.clone(),
        signals.clone(),
        correlator::Config {
            default_timeout: Duration::from_millis(200),
            recheck_interval: Duration::from_millis(50),
        },
        instruments.clone(),
    );

    let request = notifier
        .create_group_request(Payload::new(obj(&[("name", "admins")]), None))
        .await
        .unwrap();
    assert_eq!(
        correlator.wait_response(request.req_id, None).await.unwrap(),
        ReplyState::Pending
    );

    // The dispatcher finally comes up & drains the backlog.
    let dispatcher = dispatcher::new(
        storage.clone(),
        signals,
        Some(dispatcher::Config {
            poll_interval: Duration::from_millis(25),
            ..Default::default()
        }),
        instruments,
    );
    assert_eq!(
        correlator
            .wait_response(request.req_id, Some(Duration::from_secs(5)))
            .await
            .unwrap(),
        ReplyState::Succeeded
    );
    dispatcher.shutdown(Duration::from_secs(1)).await.unwrap();
}
