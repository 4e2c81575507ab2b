#![allow(clippy::unwrap_used, clippy::expect_used)]

//! End-to-end behaviour of the manager over the in-process messaging backend.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    async_trait::async_trait,
    feedlink_assistant::{
        AssistantEngine, AssistantManager, AssistantReceiver, Error, HANDSHAKE_SESSION_KEY,
        LinkState, ManagerOptions,
    },
    feedlink_common::{FeedId, UserId},
    feedlink_feeds::FeedEventKind,
    feedlink_messaging::{
        ApiKey, CREDENTIALS_KEY, CollectionName, CredentialStore, FeedMessage,
        MemoryCredentialStore, memory::MemoryBackend,
    },
    tokio::sync::Notify,
    url::Url,
};

#[derive(Default)]
struct EchoEngine {
    commands: Mutex<Vec<String>>,
    receiver: Mutex<Option<Arc<dyn AssistantReceiver>>>,
    receiver_sets: Mutex<usize>,
    notify: Notify,
}

#[async_trait]
impl AssistantEngine for EchoEngine {
    async fn handle_command(&self, text: &str) -> anyhow::Result<()> {
        self.commands.lock().unwrap().push(text.to_string());
        let receiver = self.receiver.lock().unwrap().clone();
        if let Some(receiver) = receiver {
            receiver.send(&format!("echo: {text}")).await?;
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn set_receiver(&self, receiver: Option<Arc<dyn AssistantReceiver>>) -> anyhow::Result<()> {
        if receiver.is_some() {
            *self.receiver_sets.lock().unwrap() += 1;
        }
        *self.receiver.lock().unwrap() = receiver;
        Ok(())
    }
}

impl EchoEngine {
    async fn wait_for(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.commands.lock().unwrap().len() < count {
                self.notify.notified().await;
            }
        })
        .await
        .expect("engine did not receive commands in time");
    }
}

fn options() -> ManagerOptions {
    ManagerOptions {
        instance: "assistant".into(),
        sync: true,
        api_key: ApiKey::new("id", "secret"),
        return_url: Url::parse("http://localhost:3000/assistant/setup/callback").unwrap(),
        scopes: vec!["PublicProfile".into(), "OmletChat".into()],
    }
}

fn linked_manager() -> (MemoryBackend, AssistantManager) {
    let backend = MemoryBackend::new();
    backend.own_account("assistant");
    let storage = Arc::new(MemoryCredentialStore::new());
    storage.set(CREDENTIALS_KEY, "{}".into()).unwrap();
    let manager = AssistantManager::new(Arc::new(backend.clone()), storage, options()).unwrap();
    (backend, manager)
}

#[tokio::test]
async fn new_feed_is_opened_and_classifies_incoming() {
    let (backend, manager) = linked_manager();
    let descriptor = backend.add_feed("F1", &["assistant", "other"]);
    manager.start().await.unwrap();
    let registry = manager.registry().unwrap();

    assert!(!registry.contains(&FeedId::new("F1")));
    let feed = registry.get_feed(&FeedId::new("F1"));
    assert!(!feed.is_open());
    feed.open().await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _sub = feed.on(
        FeedEventKind::Incoming,
        Arc::new(move |m: &FeedMessage| sink.lock().unwrap().push(m.text.clone())),
    );
    backend.inject_message(&descriptor, FeedMessage::text("other", "hi"));

    assert_eq!(*seen.lock().unwrap(), vec![Some("hi".to_string())]);
    feed.close().await.unwrap();
    manager.stop().await;
}

#[tokio::test]
async fn repeated_create_feed_binds_same_feed() {
    let (backend, manager) = linked_manager();
    manager.start().await.unwrap();
    let engine = Arc::new(EchoEngine::default());
    let user = UserId::new("u1");

    let first = manager
        .create_feed_for_engine(user.clone(), engine.clone(), "contactX")
        .await
        .unwrap();
    let second = manager
        .create_feed_for_engine(user.clone(), engine.clone(), "contactX")
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(backend.feed_count(), 1);
    assert_eq!(manager.feed_for_user(&user), Some(first));
    assert!(manager.has_active_binding(&user));
    manager.stop().await;
}

#[tokio::test]
async fn restart_does_not_duplicate_bindings() {
    let (backend, manager) = linked_manager();
    let descriptor = backend.add_feed("F1", &["assistant", "bob"]);
    let engine = Arc::new(EchoEngine::default());
    manager
        .add_engine(UserId::new("u1"), engine.clone(), FeedId::new("F1"))
        .await
        .unwrap();

    manager.start().await.unwrap();
    manager.stop().await;
    manager.start().await.unwrap();

    let objects = CollectionName::FeedObjects(descriptor.object_id.clone());
    assert_eq!(backend.listener_count(&objects), 1);
    assert_eq!(manager.registered_users(), vec![UserId::new("u1")]);
    assert_eq!(*engine.receiver_sets.lock().unwrap(), 2);

    backend.inject_message(&descriptor, FeedMessage::text("bob", "status"));
    engine.wait_for(1).await;
    tokio::task::yield_now().await;
    assert_eq!(engine.commands.lock().unwrap().len(), 1);

    manager.stop().await;
    assert_eq!(backend.listener_count(&objects), 0);
    assert_eq!(backend.enabled_clients(), 0);
}

#[tokio::test]
async fn mismatched_handshake_key_fails_without_promotion() {
    let backend = MemoryBackend::new();
    let manager = AssistantManager::new(
        Arc::new(backend.clone()),
        Arc::new(MemoryCredentialStore::new()),
        options(),
    )
    .unwrap();

    let mut session: HashMap<String, String> = HashMap::new();
    let link = manager.begin_link(&mut session).await.unwrap();
    session.insert(HANDSHAKE_SESSION_KEY.to_string(), "not-the-key".to_string());

    let query: HashMap<String, String> = link.query_pairs().into_owned().collect();
    let err = manager.complete_link(&query, &mut session).await.unwrap_err();

    assert!(matches!(err, Error::HandshakeFailed { .. }));
    assert_eq!(manager.state(), LinkState::NoCredentials);
    assert!(manager.client().is_none());
    assert_eq!(backend.enabled_clients(), 0);
}

#[tokio::test]
async fn engine_replies_flow_back_to_the_feed() {
    let (backend, manager) = linked_manager();
    let descriptor = backend.add_feed("F1", &["assistant", "bob"]);
    manager.start().await.unwrap();
    let engine = Arc::new(EchoEngine::default());
    manager
        .add_engine(UserId::new("u1"), engine.clone(), FeedId::new("F1"))
        .await
        .unwrap();

    backend.inject_message(&descriptor, FeedMessage::text("bob", "ping"));
    engine.wait_for(1).await;

    let sent = backend.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].feed_id, FeedId::new("F1"));
    assert_eq!(sent[0].text, "echo: ping");
    // The echoed reply is outgoing and must not loop back into the engine.
    tokio::task::yield_now().await;
    assert_eq!(engine.commands.lock().unwrap().len(), 1);
    manager.stop().await;
}

#[tokio::test]
async fn hidden_messages_never_reach_the_engine() {
    let (backend, manager) = linked_manager();
    let descriptor = backend.add_feed("F1", &["assistant", "bob"]);
    let engine = Arc::new(EchoEngine::default());
    manager
        .add_engine(UserId::new("u1"), engine.clone(), FeedId::new("F1"))
        .await
        .unwrap();
    manager.start().await.unwrap();

    backend.inject_message(&descriptor, FeedMessage::text("bob", "meta").hidden());
    backend.inject_message(
        &descriptor,
        FeedMessage::text(manager.registry().unwrap().own_id().unwrap().as_str(), "x").hidden(),
    );
    backend.inject_message(&descriptor, FeedMessage::text("bob", "visible"));

    engine.wait_for(1).await;
    tokio::task::yield_now().await;
    assert_eq!(*engine.commands.lock().unwrap(), vec!["visible"]);
    manager.stop().await;
}

#[tokio::test]
async fn second_user_cannot_take_over_a_bound_feed() {
    let (backend, manager) = linked_manager();
    let descriptor = backend.add_feed("F1", &["assistant", "bob"]);
    manager.start().await.unwrap();
    let owner = Arc::new(EchoEngine::default());
    let intruder = Arc::new(EchoEngine::default());
    manager
        .add_engine(UserId::new("u1"), owner.clone(), FeedId::new("F1"))
        .await
        .unwrap();

    let err = manager
        .add_engine(UserId::new("u2"), intruder.clone(), FeedId::new("F1"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::FeedInUse { .. }));

    assert!(manager.has_active_binding(&UserId::new("u1")));
    assert!(!manager.has_active_binding(&UserId::new("u2")));
    let binding = manager.binding(&UserId::new("u1")).unwrap();
    assert!(binding.feed().is_open());
    assert!(manager.registry().unwrap().contains(&FeedId::new("F1")));

    backend.inject_message(&descriptor, FeedMessage::text("bob", "hi"));
    owner.wait_for(1).await;
    assert_eq!(*owner.commands.lock().unwrap(), vec!["hi"]);
    assert!(intruder.commands.lock().unwrap().is_empty());
    manager.stop().await;
}

#[tokio::test]
async fn deleted_feed_is_evicted_from_registry() {
    let (backend, manager) = linked_manager();
    backend.add_feed("F1", &["assistant", "bob"]);
    manager.start().await.unwrap();
    let registry = manager.registry().unwrap();
    let _feed = registry.get_feed(&FeedId::new("F1"));

    backend.remove_feed("F1");
    assert!(!registry.contains(&FeedId::new("F1")));
    manager.stop().await;
}

#[tokio::test]
async fn removing_unknown_engine_is_a_no_op() {
    let (_backend, manager) = linked_manager();
    assert!(!manager.remove_engine(&UserId::new("ghost")).await);
    manager.start().await.unwrap();
    assert!(!manager.remove_engine(&UserId::new("ghost")).await);
    manager.stop().await;
}

#[tokio::test]
async fn linking_then_registering_runs_end_to_end() {
    let backend = MemoryBackend::new();
    let manager = AssistantManager::new(
        Arc::new(backend.clone()),
        Arc::new(MemoryCredentialStore::new()),
        options(),
    )
    .unwrap();

    let mut session: HashMap<String, String> = HashMap::new();
    let link = manager.begin_link(&mut session).await.unwrap();
    let query: HashMap<String, String> = link.query_pairs().into_owned().collect();
    manager.complete_link(&query, &mut session).await.unwrap();
    assert_eq!(manager.state(), LinkState::Running);

    let engine = Arc::new(EchoEngine::default());
    let feed_id = manager
        .create_feed_for_engine(UserId::new("u1"), engine.clone(), "friend")
        .await
        .unwrap();
    let descriptor = backend_descriptor(&manager, &feed_id).await;
    backend.inject_message(&descriptor, FeedMessage::text("friend", "hello"));
    engine.wait_for(1).await;
    assert_eq!(backend.sent()[0].text, "echo: hello");
    manager.stop().await;
}

async fn backend_descriptor(
    manager: &AssistantManager,
    feed_id: &FeedId,
) -> feedlink_messaging::FeedDescriptor {
    let feed = manager.registry().unwrap().get_feed(feed_id);
    feed.descriptor().expect("bound feed is open")
}
