//! Service lifecycle: persistence, restart, cluster mirroring and
//! concurrent requests.

mod common;

use common::{bare, entry, jid, TestService};
use futures::future::join_all;
use waddle_pubsub::engine::{CreateNode, GetItems, Publish, Subscribe};
use waddle_pubsub::node::config::fields;
use waddle_pubsub::{
    ClusterTask, DataForm, NewItem, PubSubError, PubSubRequest, ServiceConfig, ROOT_NODE_ID,
};

const ALICE: &str = "alice@example.com";
const BOB: &str = "bob@example.com";

fn persistent(max_items: &str) -> DataForm {
    DataForm::submit()
        .with_field(fields::PERSIST_ITEMS, ["1"])
        .with_field(fields::MAX_ITEMS, [max_items])
}

fn subscribe_request(node_id: &str, subscriber: &str) -> PubSubRequest {
    PubSubRequest::Subscribe(Subscribe {
        from: jid(subscriber),
        node_id: Some(node_id.to_string()),
        jid: Some(jid(subscriber)),
        options: None,
    })
}

#[tokio::test]
async fn test_restart_restores_nodes_items_and_subscriptions() {
    let pubsub = TestService::new().await;
    pubsub.create("news", ALICE, Some(persistent("10"))).await;
    pubsub.subscribe("news", BOB, None).await;
    pubsub.publish("news", ALICE, &[("1", "first"), ("2", "second")]).await;

    let pubsub = pubsub.restart().await;

    assert!(pubsub.service().contains_node("news"));
    assert_eq!(pubsub.parent("news").await.as_deref(), Some(ROOT_NODE_ID));
    assert_eq!(pubsub.retained("news").await, vec!["1", "2"]);

    let node = pubsub.service().node("news").unwrap();
    let state = node.read().await;
    assert_eq!(state.core().subscriptions_of(&bare(BOB)).len(), 1);
    assert!(state.core().owners().contains(&bare(ALICE)));

    let root = pubsub.service().root_node().unwrap();
    let root = root.read().await;
    let children: Vec<&str> = root.kind().as_collection().unwrap().children().collect();
    assert_eq!(children, vec!["news"]);
}

#[tokio::test]
async fn test_flush_writes_persistent_items_only() {
    let pubsub = TestService::new().await;
    pubsub.create("stored", ALICE, Some(persistent("10"))).await;
    pubsub.create("transient", ALICE, None).await;
    pubsub.publish("stored", ALICE, &[("1", "a"), ("2", "b"), ("3", "c")]).await;
    pubsub.publish("transient", ALICE, &[("1", "a")]).await;

    pubsub.service().flush_pending_items(false).await.unwrap();

    assert_eq!(pubsub.persistence.item_count("stored"), 3);
    assert_eq!(pubsub.persistence.item_count("transient"), 0);
    assert!(pubsub.persistence.flush_count() >= 1);
}

#[tokio::test]
async fn test_failed_flush_is_retried() {
    let pubsub = TestService::new().await;
    pubsub.create("stored", ALICE, Some(persistent("10"))).await;
    pubsub.publish("stored", ALICE, &[("1", "a"), ("2", "b")]).await;

    pubsub.persistence.set_fail_flushes(true);
    assert!(pubsub.service().flush_pending_items(false).await.is_err());
    assert_eq!(pubsub.persistence.item_count("stored"), 0);

    pubsub.persistence.set_fail_flushes(false);
    pubsub.service().flush_pending_items(false).await.unwrap();
    assert_eq!(pubsub.persistence.item_count("stored"), 2);
}

#[tokio::test]
async fn test_retracted_items_leave_the_store() {
    let pubsub = TestService::new().await;
    pubsub.create("stored", ALICE, Some(persistent("10"))).await;
    pubsub.publish("stored", ALICE, &[("1", "a"), ("2", "b")]).await;
    pubsub.service().flush_pending_items(false).await.unwrap();

    pubsub
        .engine
        .retract(waddle_pubsub::engine::Retract {
            from: jid(ALICE),
            node_id: Some("stored".into()),
            item_ids: vec!["1".into()],
        })
        .await
        .unwrap();
    pubsub.service().flush_pending_items(false).await.unwrap();
    assert_eq!(pubsub.persistence.item_count("stored"), 1);
}

#[tokio::test]
async fn test_cluster_tasks_sent_when_clustered() {
    let config = ServiceConfig {
        clustering_enabled: true,
        ..Default::default()
    };
    let pubsub = TestService::with_config(config).await;
    pubsub.create("news", ALICE, None).await;
    let subscription = pubsub.subscribe("news", BOB, None).await;

    let tasks = pubsub.cluster.tasks();
    assert!(tasks.iter().any(|task| matches!(
        task,
        ClusterTask::NewSubscription { node_id, subscription: s, .. }
            if node_id == "news" && s.id() == subscription.subscription_id
    )));

    pubsub.service().flush_pending_items(true).await.unwrap();
    assert_eq!(
        pubsub.cluster.synchronous_tasks(),
        vec![ClusterTask::FlushPendingItems {
            service_id: pubsub.service().service_id().to_string(),
        }]
    );
}

#[tokio::test]
async fn test_no_cluster_tasks_when_standalone() {
    let pubsub = TestService::new().await;
    pubsub.create("news", ALICE, None).await;
    pubsub.subscribe("news", BOB, None).await;
    pubsub.service().flush_pending_items(true).await.unwrap();

    assert!(pubsub.cluster.tasks().is_empty());
    assert!(pubsub.cluster.synchronous_tasks().is_empty());
}

#[tokio::test]
async fn test_requests_rejected_when_unavailable() {
    let pubsub = TestService::new().await;
    pubsub.create("news", ALICE, None).await;

    pubsub.service().set_clustering_enabled(true);
    pubsub.service().set_senior_member(false);
    let result = pubsub.engine.handle(subscribe_request("news", BOB)).await;
    assert!(matches!(result, Err(PubSubError::ServiceUnavailable)));

    pubsub.service().set_senior_member(true);
    pubsub.engine.handle(subscribe_request("news", BOB)).await.unwrap();

    pubsub.service().shutdown().await;
    let result = pubsub
        .engine
        .handle(subscribe_request("news", "carol@example.com"))
        .await;
    assert!(matches!(result, Err(PubSubError::ServiceUnavailable)));
}

#[tokio::test]
async fn test_typed_operations_rejected_after_shutdown() {
    let pubsub = TestService::new().await;
    pubsub.create("news", ALICE, None).await;
    pubsub.service().shutdown().await;

    let published = pubsub
        .engine
        .publish(Publish {
            from: jid(ALICE),
            node_id: Some("news".into()),
            items: vec![NewItem::new(Some("1".into()), Some(entry("late")))],
        })
        .await;
    assert!(matches!(published, Err(PubSubError::ServiceUnavailable)));

    let subscribed = pubsub
        .engine
        .subscribe(Subscribe {
            from: jid(BOB),
            node_id: Some("news".into()),
            jid: Some(jid(BOB)),
            options: None,
        })
        .await;
    assert!(matches!(subscribed, Err(PubSubError::ServiceUnavailable)));

    let items = pubsub
        .engine
        .get_items(GetItems {
            from: jid(ALICE),
            node_id: Some("news".into()),
            subscription_id: None,
            max_items: None,
            item_ids: Vec::new(),
        })
        .await;
    assert!(matches!(items, Err(PubSubError::ServiceUnavailable)));
    assert!(pubsub.retained("news").await.is_empty());
}

#[tokio::test]
async fn test_rejected_create_form_leaves_no_trace() {
    let config = ServiceConfig {
        clustering_enabled: true,
        ..Default::default()
    };
    let pubsub = TestService::with_config(config).await;

    let form = DataForm::submit()
        .with_field(fields::PERSIST_ITEMS, ["1"])
        .with_field(fields::MAX_ITEMS, ["many"]);
    let result = pubsub
        .engine
        .create_node(CreateNode {
            from: jid(ALICE),
            node_id: Some("news".into()),
            form: Some(form),
        })
        .await;

    assert!(matches!(result, Err(PubSubError::BadRequest(_))));
    assert!(!pubsub.service().contains_node("news"));
    assert!(!pubsub
        .cluster
        .tasks()
        .iter()
        .any(|task| task.node_id() == Some("news")));

    pubsub.create("news", ALICE, None).await;
    let node = pubsub.service().node("news").unwrap();
    assert_eq!(node.read().await.core().owners(), vec![bare(ALICE)]);
}

#[tokio::test]
async fn test_started_service_flushes_on_shutdown() {
    let pubsub = TestService::new().await;
    pubsub.service().start().await;
    pubsub.create("stored", ALICE, Some(persistent("10"))).await;
    pubsub.publish("stored", ALICE, &[("1", "a")]).await;

    pubsub.service().shutdown().await;
    assert!(!pubsub.service().is_available());
    assert_eq!(pubsub.persistence.item_count("stored"), 1);
}

#[tokio::test]
async fn test_concurrent_publishes_are_all_retained() {
    let pubsub = TestService::new().await;
    pubsub.create("news", ALICE, Some(persistent("50"))).await;

    let publishes = (0..20).map(|i| {
        pubsub.engine.publish(Publish {
            from: jid(ALICE),
            node_id: Some("news".into()),
            items: vec![NewItem::new(Some(format!("item-{i}")), Some(entry("x")))],
        })
    });
    for result in join_all(publishes).await {
        result.unwrap();
    }

    let mut retained = pubsub.retained("news").await;
    retained.sort();
    let mut expected: Vec<String> = (0..20).map(|i| format!("item-{i}")).collect();
    expected.sort();
    assert_eq!(retained, expected);
}
