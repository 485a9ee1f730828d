//! Routing of accepted inbox activities to defaults and handlers

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use common::{
    CountingCallbacks, FailingHook, FixedBlocklist, MockTransport, actor_doc, alice, alice_inbox,
    counting_handler, engine, inbox_request, iri, local_store, permissive_ports,
};
use fedengine::activity::ActivityType;
use fedengine::config::OnFollow;
use fedengine::context::RequestContext;
use fedengine::error::AppError;
use fedengine::federation::{OtherHandler, Store, WrappedCallbacks, handler_fn};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const BOB: &str = "https://remote.example/users/bob";
const BOB_INBOX: &str = "https://remote.example/users/bob/inbox";
const LOCAL_NOTE: &str = "https://local.example/users/alice/notes/1";
const NOTE_LIKES: &str = "https://local.example/users/alice/notes/1/likes";

fn like(id: &str) -> serde_json::Value {
    json!({
        "id": id,
        "type": "Like",
        "actor": BOB,
        "object": LOCAL_NOTE
    })
}

#[tokio::test]
async fn wrapped_default_and_override_each_run_once() {
    let store = local_store().await;
    let (calls, handler) = counting_handler();
    let callbacks = CountingCallbacks::new(
        WrappedCallbacks {
            like: Some(handler),
            ..WrappedCallbacks::default()
        },
        Vec::new(),
    );
    let engine = engine(
        store.clone(),
        MockTransport::new(),
        permissive_ports(store.clone(), callbacks.clone()),
    );

    let response = engine
        .post_inbox(
            RequestContext::new(),
            &inbox_request(&alice_inbox(), &like("https://remote.example/likes/1")),
        )
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(callbacks.default_calls(), 0);
    // The default recorded the like on the local note
    assert_eq!(
        store
            .collection_items(&RequestContext::new(), &iri(NOTE_LIKES))
            .await
            .unwrap(),
        Some(vec![iri("https://remote.example/likes/1")])
    );
}

#[tokio::test]
async fn unclaimed_types_reach_the_default_callback() {
    let store = local_store().await;
    let callbacks = CountingCallbacks::new(WrappedCallbacks::default(), Vec::new());
    let engine = engine(
        store.clone(),
        MockTransport::new(),
        permissive_ports(store, callbacks.clone()),
    );

    let question = json!({
        "id": "https://remote.example/questions/1",
        "type": "Question",
        "actor": BOB,
        "name": "Tea or coffee?"
    });
    let response = engine
        .post_inbox(
            RequestContext::new(),
            &inbox_request(&alice_inbox(), &question),
        )
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(callbacks.default_calls(), 1);
}

#[tokio::test]
async fn extension_types_route_to_their_handler() {
    let store = local_store().await;
    let (calls, handler) = counting_handler();
    let callbacks = CountingCallbacks::new(
        WrappedCallbacks::default(),
        vec![OtherHandler::for_type("EmojiReact", handler)],
    );
    let engine = engine(
        store.clone(),
        MockTransport::new(),
        permissive_ports(store, callbacks.clone()),
    );

    let react = json!({
        "id": "https://remote.example/reacts/1",
        "type": "EmojiReact",
        "actor": BOB,
        "object": LOCAL_NOTE,
        "content": "🎉"
    });
    engine
        .post_inbox(RequestContext::new(), &inbox_request(&alice_inbox(), &react))
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(callbacks.default_calls(), 0);
}

#[tokio::test]
async fn other_handler_replaces_the_wrapped_default() {
    let store = local_store().await;
    let (override_calls, override_handler) = counting_handler();
    let (other_calls, other_handler) = counting_handler();
    let callbacks = CountingCallbacks::new(
        WrappedCallbacks {
            like: Some(override_handler),
            ..WrappedCallbacks::default()
        },
        vec![OtherHandler::matching(
            "reactions",
            |kind| *kind == ActivityType::Like,
            other_handler,
        )],
    );
    let engine = engine(
        store.clone(),
        MockTransport::new(),
        permissive_ports(store.clone(), callbacks),
    );

    engine
        .post_inbox(
            RequestContext::new(),
            &inbox_request(&alice_inbox(), &like("https://remote.example/likes/2")),
        )
        .await
        .unwrap();

    assert_eq!(other_calls.load(Ordering::SeqCst), 1);
    assert_eq!(override_calls.load(Ordering::SeqCst), 0);
    // No default side effect either
    assert_eq!(
        store
            .collection_items(&RequestContext::new(), &iri(NOTE_LIKES))
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn blocked_actor_is_never_dispatched() {
    let store = local_store().await;
    let transport = MockTransport::new();
    let callbacks = CountingCallbacks::new(WrappedCallbacks::default(), Vec::new());
    let blocklist = FixedBlocklist::new(true);
    let mut ports = permissive_ports(store.clone(), callbacks.clone());
    ports.blocklist = blocklist.clone();
    let engine = engine(store.clone(), transport.clone(), ports);

    let response = engine
        .post_inbox(
            RequestContext::new(),
            &inbox_request(&alice_inbox(), &like("https://remote.example/likes/3")),
        )
        .await
        .unwrap();

    assert_eq!(response.status, 403);
    assert_eq!(blocklist.calls.load(Ordering::SeqCst), 1);
    assert_eq!(callbacks.provider_calls(), 0);
    assert_eq!(callbacks.default_calls(), 0);
    assert_eq!(transport.total_fetches(), 0);
    assert!(
        !store
            .inbox_contains(
                &RequestContext::new(),
                &alice_inbox(),
                &iri("https://remote.example/likes/3")
            )
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn duplicate_delivery_is_not_dispatched_again() {
    let store = local_store().await;
    let (calls, handler) = counting_handler();
    let callbacks = CountingCallbacks::new(
        WrappedCallbacks {
            like: Some(handler),
            ..WrappedCallbacks::default()
        },
        Vec::new(),
    );
    let engine = engine(
        store.clone(),
        MockTransport::new(),
        permissive_ports(store, callbacks.clone()),
    );
    let request = inbox_request(&alice_inbox(), &like("https://remote.example/likes/4"));

    let first = engine
        .post_inbox(RequestContext::new(), &request)
        .await
        .unwrap();
    let second = engine
        .post_inbox(RequestContext::new(), &request)
        .await
        .unwrap();

    assert_eq!(first.status, 200);
    assert_eq!(second.status, 200);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(callbacks.provider_calls(), 1);
}

#[tokio::test]
async fn callback_table_is_built_once() {
    let store = local_store().await;
    let callbacks = CountingCallbacks::new(WrappedCallbacks::default(), Vec::new());
    let engine = engine(
        store.clone(),
        MockTransport::new(),
        permissive_ports(store, callbacks.clone()),
    );

    for n in 0..3 {
        engine
            .post_inbox(
                RequestContext::new(),
                &inbox_request(
                    &alice_inbox(),
                    &like(&format!("https://remote.example/likes/table-{}", n)),
                ),
            )
            .await
            .unwrap();
    }

    assert_eq!(callbacks.provider_calls(), 1);
}

#[tokio::test]
async fn handler_errors_are_returned_unchanged() {
    let store = local_store().await;
    let callbacks = CountingCallbacks::new(
        WrappedCallbacks {
            like: Some(handler_fn(|_ctx, _activity| async {
                Err(AppError::Forbidden)
            })),
            ..WrappedCallbacks::default()
        },
        Vec::new(),
    );
    let engine = engine(
        store.clone(),
        MockTransport::new(),
        permissive_ports(store, callbacks),
    );

    let result = engine
        .post_inbox(
            RequestContext::new(),
            &inbox_request(&alice_inbox(), &like("https://remote.example/likes/5")),
        )
        .await;

    assert!(matches!(result, Err(AppError::Forbidden)));
}

#[tokio::test]
async fn missing_object_is_answered_with_bad_request() {
    let store = local_store().await;
    let (calls, handler) = counting_handler();
    let callbacks = CountingCallbacks::new(
        WrappedCallbacks {
            like: Some(handler),
            ..WrappedCallbacks::default()
        },
        Vec::new(),
    );
    let engine = engine(
        store.clone(),
        MockTransport::new(),
        permissive_ports(store, callbacks),
    );

    let bare = json!({
        "id": "https://remote.example/likes/6",
        "type": "Like",
        "actor": BOB
    });
    let response = engine
        .post_inbox(RequestContext::new(), &inbox_request(&alice_inbox(), &bare))
        .await
        .unwrap();

    assert_eq!(response.status, 400);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn reject_without_object_reaches_its_handler() {
    let store = local_store().await;
    let (calls, handler) = counting_handler();
    let callbacks = CountingCallbacks::new(
        WrappedCallbacks {
            reject: Some(handler),
            ..WrappedCallbacks::default()
        },
        Vec::new(),
    );
    let engine = engine(
        store.clone(),
        MockTransport::new(),
        permissive_ports(store, callbacks),
    );

    let bare = json!({
        "id": "https://remote.example/rejects/1",
        "type": "Reject",
        "actor": BOB
    });
    let response = engine
        .post_inbox(RequestContext::new(), &inbox_request(&alice_inbox(), &bare))
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn add_without_target_is_answered_with_bad_request() {
    let store = local_store().await;
    let callbacks = CountingCallbacks::new(WrappedCallbacks::default(), Vec::new());
    let engine = engine(
        store.clone(),
        MockTransport::new(),
        permissive_ports(store, callbacks),
    );

    let add = json!({
        "id": "https://remote.example/adds/1",
        "type": "Add",
        "actor": BOB,
        "object": "https://remote.example/notes/1"
    });
    let response = engine
        .post_inbox(RequestContext::new(), &inbox_request(&alice_inbox(), &add))
        .await
        .unwrap();

    assert_eq!(response.status, 400);
}

#[tokio::test]
async fn body_hook_failure_aborts_before_authentication() {
    let store = local_store().await;
    let callbacks = CountingCallbacks::new(WrappedCallbacks::default(), Vec::new());
    let blocklist = FixedBlocklist::new(false);
    let mut ports = permissive_ports(store.clone(), callbacks.clone());
    ports.body_hook = Arc::new(FailingHook);
    ports.blocklist = blocklist.clone();
    let engine = engine(store, MockTransport::new(), ports);

    let result = engine
        .post_inbox(
            RequestContext::new(),
            &inbox_request(&alice_inbox(), &like("https://remote.example/likes/7")),
        )
        .await;

    assert!(matches!(result, Err(AppError::Store(_))));
    assert_eq!(blocklist.calls.load(Ordering::SeqCst), 0);
    assert_eq!(callbacks.provider_calls(), 0);
}

#[tokio::test]
async fn cancelled_request_is_not_dispatched() {
    let store = local_store().await;
    let (calls, handler) = counting_handler();
    let callbacks = CountingCallbacks::new(
        WrappedCallbacks {
            like: Some(handler),
            ..WrappedCallbacks::default()
        },
        Vec::new(),
    );
    let engine = engine(
        store.clone(),
        MockTransport::new(),
        permissive_ports(store, callbacks),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = engine
        .post_inbox(
            RequestContext::with_cancellation(cancel),
            &inbox_request(&alice_inbox(), &like("https://remote.example/likes/8")),
        )
        .await;

    assert!(matches!(result, Err(AppError::Cancelled)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn follow_of_local_actor_is_accepted() {
    let store = local_store().await;
    let transport = MockTransport::new();
    transport.insert(actor_doc(BOB, BOB_INBOX, None));
    let callbacks = CountingCallbacks::new(
        WrappedCallbacks {
            on_follow: OnFollow::Accept,
            ..WrappedCallbacks::default()
        },
        Vec::new(),
    );
    let engine = engine(
        store.clone(),
        transport.clone(),
        permissive_ports(store.clone(), callbacks),
    );

    let follow = json!({
        "id": "https://remote.example/follows/1",
        "type": "Follow",
        "actor": BOB,
        "object": alice().as_str()
    });
    engine
        .post_inbox(RequestContext::new(), &inbox_request(&alice_inbox(), &follow))
        .await
        .unwrap();

    assert_eq!(
        store
            .collection_items(&RequestContext::new(), &common::alice_followers())
            .await
            .unwrap(),
        Some(vec![iri(BOB)])
    );
    let deliveries = transport.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].0, iri(BOB_INBOX));
    assert_eq!(deliveries[0].1["type"], "Accept");
    assert_eq!(deliveries[0].1["actor"], alice().as_str());
}

#[tokio::test]
async fn follow_is_rejected_by_policy() {
    let store = local_store().await;
    let transport = MockTransport::new();
    transport.insert(actor_doc(BOB, BOB_INBOX, None));
    let callbacks = CountingCallbacks::new(
        WrappedCallbacks {
            on_follow: OnFollow::Reject,
            ..WrappedCallbacks::default()
        },
        Vec::new(),
    );
    let engine = engine(
        store.clone(),
        transport.clone(),
        permissive_ports(store.clone(), callbacks),
    );

    let follow = json!({
        "id": "https://remote.example/follows/2",
        "type": "Follow",
        "actor": BOB,
        "object": alice().as_str()
    });
    engine
        .post_inbox(RequestContext::new(), &inbox_request(&alice_inbox(), &follow))
        .await
        .unwrap();

    assert_eq!(
        store
            .collection_items(&RequestContext::new(), &common::alice_followers())
            .await
            .unwrap(),
        Some(Vec::new())
    );
    let deliveries = transport.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].1["type"], "Reject");
}
