//! Test harness for pubsub integration tests.
//!
//! Builds a service over recording port doubles and offers request helpers
//! so scenarios read as a sequence of protocol actions.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};

use async_trait::async_trait;
use jid::{BareJid, Jid};
use minidom::Element;
use tokio::sync::mpsc::UnboundedReceiver;
use waddle_pubsub::engine::{CreateNode, Publish, Subscribe};
use waddle_pubsub::ports::StaticRoster;
use waddle_pubsub::presence::PresenceCache;
use waddle_pubsub::{
    ChannelBroadcaster, ClusterPort, ClusterTask, DataForm, Delivery, InMemoryPersistence,
    NewItem, Notification, PubSubEngine, PubSubService, ServiceConfig, ServicePorts,
    SubscriptionInfo,
};

/// Initialize tracing once per test binary.
pub fn init_test() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    });
}

pub fn jid(s: &str) -> Jid {
    s.parse().unwrap()
}

pub fn bare(s: &str) -> BareJid {
    s.parse().unwrap()
}

/// A payload element carrying `text`.
pub fn entry(text: &str) -> Element {
    format!("<entry xmlns='http://www.w3.org/2005/Atom'><title>{text}</title></entry>")
        .parse()
        .unwrap()
}

/// Cluster port that records every task it is asked to send.
#[derive(Debug, Default)]
pub struct RecordingCluster {
    tasks: Mutex<Vec<ClusterTask>>,
    synchronous: Mutex<Vec<ClusterTask>>,
}

impl RecordingCluster {
    pub fn tasks(&self) -> Vec<ClusterTask> {
        self.tasks.lock().unwrap().clone()
    }

    pub fn synchronous_tasks(&self) -> Vec<ClusterTask> {
        self.synchronous.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterPort for RecordingCluster {
    fn do_cluster_task(&self, task: ClusterTask) {
        self.tasks.lock().unwrap().push(task);
    }

    async fn do_synchronous_cluster_task(&self, task: ClusterTask) {
        self.synchronous.lock().unwrap().push(task);
    }
}

/// A service, its engine and handles on every port double.
pub struct TestService {
    pub engine: PubSubEngine,
    pub deliveries: UnboundedReceiver<Delivery>,
    pub persistence: Arc<InMemoryPersistence>,
    pub presence: Arc<PresenceCache>,
    pub roster: Arc<StaticRoster>,
    pub cluster: Arc<RecordingCluster>,
    config: ServiceConfig,
}

impl TestService {
    pub async fn new() -> Self {
        Self::with_config(ServiceConfig::default()).await
    }

    pub async fn with_config(config: ServiceConfig) -> Self {
        Self::build(
            config,
            Arc::new(InMemoryPersistence::new()),
            Arc::new(StaticRoster::new()),
        )
        .await
    }

    async fn build(
        config: ServiceConfig,
        persistence: Arc<InMemoryPersistence>,
        roster: Arc<StaticRoster>,
    ) -> Self {
        init_test();
        let (broadcaster, deliveries) = ChannelBroadcaster::new();
        let presence = Arc::new(PresenceCache::new());
        let cluster = Arc::new(RecordingCluster::default());
        let ports = ServicePorts {
            persistence: persistence.clone(),
            broadcaster: Arc::new(broadcaster),
            presence: presence.clone(),
            roster: roster.clone(),
            cluster: cluster.clone(),
        };
        let service = PubSubService::new(config.clone(), ports).await.unwrap();
        Self {
            engine: PubSubEngine::new(service),
            deliveries,
            persistence,
            presence,
            roster,
            cluster,
            config,
        }
    }

    /// Shut this service down and start a new one over the same store.
    pub async fn restart(self) -> Self {
        self.service().shutdown().await;
        Self::build(self.config, self.persistence, self.roster).await
    }

    pub fn service(&self) -> &Arc<PubSubService> {
        self.engine.service()
    }

    /// Every delivery sent since the last call.
    pub fn drain(&mut self) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        while let Ok(delivery) = self.deliveries.try_recv() {
            deliveries.push(delivery);
        }
        deliveries
    }

    /// Notifications sent to `to` since the last drain. Other deliveries
    /// are discarded.
    pub fn notifications_to(&mut self, to: &str) -> Vec<Notification> {
        let to = jid(to);
        self.drain()
            .into_iter()
            .filter(|d| d.to == to)
            .map(|d| d.notification)
            .collect()
    }

    pub async fn create(&self, node_id: &str, owner: &str, form: Option<DataForm>) {
        self.engine
            .create_node(CreateNode {
                from: jid(owner),
                node_id: Some(node_id.to_string()),
                form,
            })
            .await
            .unwrap();
    }

    pub async fn subscribe(
        &self,
        node_id: &str,
        subscriber: &str,
        options: Option<DataForm>,
    ) -> SubscriptionInfo {
        self.engine
            .subscribe(Subscribe {
                from: jid(subscriber),
                node_id: Some(node_id.to_string()),
                jid: Some(jid(subscriber)),
                options,
            })
            .await
            .unwrap()
    }

    /// Publish one item per `(id, text)` pair.
    pub async fn publish(&self, node_id: &str, publisher: &str, items: &[(&str, &str)]) -> Vec<String> {
        let items = items
            .iter()
            .map(|(id, text)| NewItem::new(Some(id.to_string()), Some(entry(text))))
            .collect();
        self.engine
            .publish(Publish {
                from: jid(publisher),
                node_id: Some(node_id.to_string()),
                items,
            })
            .await
            .unwrap()
    }

    /// Ids of the items a leaf retains, oldest first.
    pub async fn retained(&self, node_id: &str) -> Vec<String> {
        let node = self.service().node(node_id).unwrap();
        let state = node.read().await;
        state
            .kind()
            .published_items(None)
            .iter()
            .map(|item| item.id().to_string())
            .collect()
    }

    /// Parent id of a node.
    pub async fn parent(&self, node_id: &str) -> Option<String> {
        let node = self.service().node(node_id).unwrap();
        let state = node.read().await;
        state.core().parent().map(str::to_string)
    }
}
