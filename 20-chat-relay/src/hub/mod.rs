//! The central hub: registers subscribers and fans every chat out to them.
//!
//! All registry access goes through one `tokio::sync::Mutex`. `Connect` takes
//! it only to append; `Chat` keeps it for the whole sweep, network calls
//! included. Broadcasts are therefore serialised against each other and
//! against registrations, and one slow subscriber holds up everything queued
//! behind it until its delivery completes or fails.

mod link;
mod registry;

use std::net::SocketAddr;

use tokio::sync::Mutex;
use tracing::info;

use crate::{
    message::{Message, Registration, Request, Response},
    server::Handler,
};

pub use link::{LinkFactory, OutboundLink, TcpLinkFactory};
pub use registry::{BroadcastReport, Deliver, Registry, Subscriber, SubscriberId};

pub struct Hub<F: LinkFactory = TcpLinkFactory> {
    registry: Mutex<Registry<F::Link>>,
    links: F,
}

impl<F: LinkFactory> Hub<F> {
    pub fn new(links: F) -> Self {
        Self {
            registry: Mutex::new(Registry::new()),
            links,
        }
    }

    /// Registers the caller (or the address it names) as a subscriber.
    ///
    /// Registration is optimistic: the link is not connected here, so a
    /// bad endpoint is only discovered and pruned by the next broadcast.
    pub async fn connect(&self, registration: Registration, peer: SocketAddr) -> SubscriberId {
        let endpoint = resolve_endpoint(registration.address.as_deref(), &registration.port, peer);
        let link = self.links.open(&endpoint);

        let mut registry = self.registry.lock().await;
        let id = registry.register(endpoint.clone(), link);
        info!(subscriber = %id, %endpoint, %peer, total = registry.len(), "subscriber registered");
        id
    }

    /// Records the message and broadcasts it to every subscriber, the sender
    /// included when it is registered.
    pub async fn chat(&self, message: Message) -> BroadcastReport {
        info!(sender = %message.sender, body = %message.body, "chat received");

        let mut registry = self.registry.lock().await;
        let report = registry.broadcast(&message).await;
        info!(
            delivered = report.delivered,
            pruned = report.pruned.len(),
            remaining = registry.len(),
            "broadcast complete"
        );
        report
    }

    pub async fn subscriber_count(&self) -> usize {
        self.registry.lock().await.len()
    }

    pub async fn endpoints(&self) -> Vec<String> {
        self.registry
            .lock()
            .await
            .iter()
            .map(|subscriber| subscriber.endpoint().to_string())
            .collect()
    }
}

impl<F: LinkFactory> Handler for Hub<F> {
    async fn handle(&self, request: Request, peer: SocketAddr) -> Response {
        match request {
            Request::Connect(registration) => {
                self.connect(registration, peer).await;
            }
            Request::Chat(message) => {
                self.chat(message).await;
            }
        }
        Response::Ok
    }
}

/// An explicit, non-blank address wins; otherwise the caller's observed IP
/// is used. The port is passed through unvalidated.
pub fn resolve_endpoint(address: Option<&str>, port: &str, peer: SocketAddr) -> String {
    match address.map(str::trim).filter(|address| !address.is_empty()) {
        Some(address) => format!("{address}:{port}"),
        None => match peer {
            SocketAddr::V4(peer) => format!("{}:{port}", peer.ip()),
            SocketAddr::V6(peer) => format!("[{}]:{port}", peer.ip()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::registry::tests::{DeliveryLog, ScriptedLink};
    use std::{
        collections::HashSet,
        sync::{
            Arc, Mutex as StdMutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };
    use tokio::sync::Notify;

    /// Hands out scripted links; endpoints listed in `failing` refuse delivery.
    #[derive(Clone, Default)]
    struct ScriptedFactory {
        failing: Arc<StdMutex<HashSet<String>>>,
        log: DeliveryLog,
    }

    impl ScriptedFactory {
        fn fail(&self, endpoint: &str) {
            self.failing
                .lock()
                .expect("failing set poisoned")
                .insert(endpoint.to_string());
        }
    }

    impl LinkFactory for ScriptedFactory {
        type Link = ScriptedLink;

        fn open(&self, endpoint: &str) -> ScriptedLink {
            let healthy = !self
                .failing
                .lock()
                .expect("failing set poisoned")
                .contains(endpoint);
            ScriptedLink {
                name: endpoint.to_string(),
                healthy,
                log: self.log.clone(),
            }
        }
    }

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn explicit_address_takes_priority() {
        assert_eq!(
            resolve_endpoint(Some("10.0.0.7"), "6001", peer(40000)),
            "10.0.0.7:6001"
        );
    }

    #[test]
    fn observed_origin_is_used_without_address() {
        assert_eq!(resolve_endpoint(None, "6001", peer(40000)), "127.0.0.1:6001");
        assert_eq!(resolve_endpoint(Some("  "), "6001", peer(40000)), "127.0.0.1:6001");
    }

    #[test]
    fn ipv6_origin_is_bracketed() {
        let peer: SocketAddr = "[::1]:40000".parse().expect("valid v6 address");
        assert_eq!(resolve_endpoint(None, "6001", peer), "[::1]:6001");
    }

    #[tokio::test]
    async fn every_connect_grows_the_registry_even_for_duplicates() {
        let hub = Hub::new(ScriptedFactory::default());
        for port in ["6001", "6002", "6002"] {
            hub.connect(Registration::new(None, port), peer(40000)).await;
        }
        assert_eq!(hub.subscriber_count().await, 3);
        assert_eq!(
            hub.endpoints().await,
            ["127.0.0.1:6001", "127.0.0.1:6002", "127.0.0.1:6002"]
        );
    }

    #[tokio::test]
    async fn duplicate_registration_receives_duplicate_deliveries() {
        let factory = ScriptedFactory::default();
        let hub = Hub::new(factory.clone());
        hub.connect(Registration::new(None, "6001"), peer(1)).await;
        hub.connect(Registration::new(None, "6001"), peer(1)).await;

        let report = hub.chat(Message::new("a", "hi")).await;
        assert_eq!(report.delivered, 2);
        assert_eq!(factory.log.names(), ["127.0.0.1:6001", "127.0.0.1:6001"]);
    }

    #[tokio::test]
    async fn chat_prunes_failed_subscribers_and_reaches_only_survivors_next() {
        let factory = ScriptedFactory::default();
        factory.fail("127.0.0.1:6002");
        let hub = Hub::new(factory.clone());
        for port in ["6001", "6002", "6003"] {
            hub.connect(Registration::new(None, port), peer(40000)).await;
        }

        let first = hub.chat(Message::new("A", "hi")).await;
        assert_eq!(first.delivered, 2);
        assert_eq!(first.pruned.len(), 1);
        assert_eq!(hub.subscriber_count().await, 2);
        factory.log.clear();

        hub.chat(Message::new("A", "again")).await;
        assert_eq!(factory.log.names(), ["127.0.0.1:6001", "127.0.0.1:6003"]);
    }

    #[tokio::test]
    async fn handler_answers_ok_for_both_operations() {
        let hub = Hub::new(ScriptedFactory::default());
        let connect = hub
            .handle(Request::Connect(Registration::new(None, "6001")), peer(1))
            .await;
        let chat = hub.handle(Request::Chat(Message::new("a", "b")), peer(1)).await;
        assert_eq!(connect, Response::Ok);
        assert_eq!(chat, Response::Ok);
        assert_eq!(hub.subscriber_count().await, 1);
    }

    /// Blocks inside `deliver` until released, so a sweep can be held open.
    struct GateLink {
        gate: Gate,
    }

    impl Deliver for GateLink {
        async fn deliver(&mut self, _message: &Message) -> bool {
            self.gate.entries.fetch_add(1, Ordering::SeqCst);
            self.gate.entered.notify_one();
            self.gate.release.notified().await;
            true
        }
    }

    #[derive(Clone, Default)]
    struct Gate {
        entered: Arc<Notify>,
        release: Arc<Notify>,
        entries: Arc<AtomicUsize>,
    }

    impl Gate {
        fn entries(&self) -> usize {
            self.entries.load(Ordering::SeqCst)
        }
    }

    impl LinkFactory for Gate {
        type Link = GateLink;

        fn open(&self, _endpoint: &str) -> GateLink {
            GateLink { gate: self.clone() }
        }
    }

    #[tokio::test]
    async fn connect_waits_for_an_in_flight_sweep() {
        let gate = Gate::default();
        let hub = Arc::new(Hub::new(gate.clone()));
        hub.connect(Registration::new(None, "6001"), peer(1)).await;

        let sweep = tokio::spawn({
            let hub = Arc::clone(&hub);
            async move { hub.chat(Message::new("a", "slow")).await }
        });
        gate.entered.notified().await;

        let pending = tokio::spawn({
            let hub = Arc::clone(&hub);
            async move { hub.connect(Registration::new(None, "6002"), peer(1)).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        gate.release.notify_one();
        let report = sweep.await.expect("sweep task");
        assert_eq!(report.delivered, 1);
        pending.await.expect("connect task");
        assert_eq!(hub.subscriber_count().await, 2);
    }

    #[tokio::test]
    async fn second_sweep_starts_only_after_the_first_finishes() {
        let gate = Gate::default();
        let hub = Arc::new(Hub::new(gate.clone()));
        hub.connect(Registration::new(None, "6001"), peer(1)).await;

        let first = tokio::spawn({
            let hub = Arc::clone(&hub);
            async move { hub.chat(Message::new("a", "first")).await }
        });
        gate.entered.notified().await;

        let second = tokio::spawn({
            let hub = Arc::clone(&hub);
            async move { hub.chat(Message::new("b", "second")).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());
        assert_eq!(gate.entries(), 1);

        gate.release.notify_one();
        assert_eq!(first.await.expect("first sweep").delivered, 1);

        gate.entered.notified().await;
        assert_eq!(gate.entries(), 2);
        gate.release.notify_one();
        assert_eq!(second.await.expect("second sweep").delivered, 1);
    }
}
