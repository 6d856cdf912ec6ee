//! Route discovery and registration through a coordinator.

mod common;

use std::time::Duration;

use common::{eventually, init_tracing, node, order_route, rdv, Actor, Coordinator};
use meshwork::message::control::{
    DiscoverMessageRoute, RegisterExternalMessageRoute, UnregisterMessageRoute,
};
use meshwork::{DistributionPattern, InMemoryTransport};

#[tokio::test(start_paused = true)]
async fn test_identical_discovery_requests_are_sent_once() {
    init_tracing();
    let transport = InMemoryTransport::new();
    let mut coordinator = Coordinator::spawn(&transport, &rdv(1), Duration::from_millis(100), false);
    let fabric = node(&transport, "a", vec![rdv(1)]);
    fabric.start().await.expect("start");

    let mut client = Actor::connect(&transport, &fabric, "client");
    for id in 0..10 {
        client.send_order(id, DistributionPattern::Unicast).await;
    }

    let discovery = coordinator.next::<DiscoverMessageRoute>().await;
    let request = discovery
        .payload::<DiscoverMessageRoute>()
        .expect("decode");
    assert_eq!(request.route, order_route());
    assert_eq!(request.requestor.identity.as_bytes(), b"a");
    assert_eq!(discovery.domain, "d");

    let later = coordinator.drain(Duration::from_millis(300)).await;
    assert!(later.iter().all(|message| !message.is::<DiscoverMessageRoute>()));

    fabric.stop().await;
    coordinator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_requeued_discovery_after_flush() {
    init_tracing();
    let transport = InMemoryTransport::new();
    let mut coordinator = Coordinator::spawn(&transport, &rdv(1), Duration::from_millis(100), false);
    let fabric = node(&transport, "a", vec![rdv(1)]);
    fabric.start().await.expect("start");

    let mut client = Actor::connect(&transport, &fabric, "client");
    client.send_order(1, DistributionPattern::Unicast).await;
    coordinator.next::<DiscoverMessageRoute>().await;

    client.send_order(2, DistributionPattern::Unicast).await;
    coordinator.next::<DiscoverMessageRoute>().await;

    fabric.stop().await;
    coordinator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_global_registration_is_announced() {
    init_tracing();
    let transport = InMemoryTransport::new();
    let mut coordinator = Coordinator::spawn(&transport, &rdv(1), Duration::from_millis(100), false);
    let fabric = node(&transport, "a", vec![rdv(1)]);
    fabric.start().await.expect("start");

    let mut local_only = Actor::connect(&transport, &fabric, "local");
    local_only.register_orders(true).await;
    let mut global = Actor::connect(&transport, &fabric, "global");
    global.register_orders(false).await;

    let announcement = coordinator.next::<RegisterExternalMessageRoute>().await;
    let registration = announcement
        .payload::<RegisterExternalMessageRoute>()
        .expect("decode");
    assert_eq!(registration.routes, vec![order_route()]);
    assert_eq!(registration.node.address, "inproc://a/scaleout-0");
    assert_eq!(registration.health.address, "inproc://a/heartbeat-0");
    assert_eq!(announcement.domain, "d");
    assert!(!announcement.signature.is_empty());

    let later = coordinator.drain(Duration::from_millis(200)).await;
    assert!(later
        .iter()
        .all(|message| !message.is::<RegisterExternalMessageRoute>()));

    fabric.stop().await;
    coordinator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_receiver_unregisters_route() {
    init_tracing();
    let transport = InMemoryTransport::new();
    let mut coordinator = Coordinator::spawn(&transport, &rdv(1), Duration::from_millis(100), false);
    let fabric = node(&transport, "a", vec![rdv(1)]);
    fabric.start().await.expect("start");

    let mut receiver = Actor::connect(&transport, &fabric, "receiver");
    receiver.register_orders(false).await;
    coordinator.next::<RegisterExternalMessageRoute>().await;
    drop(receiver);

    let mut client = Actor::connect(&transport, &fabric, "client");
    client.send_order(1, DistributionPattern::Unicast).await;

    let unregistration = coordinator.next::<UnregisterMessageRoute>().await;
    let request = unregistration
        .payload::<UnregisterMessageRoute>()
        .expect("decode");
    assert_eq!(request.routes, vec![order_route()]);
    assert_eq!(request.node.identity.as_bytes(), b"a");
    assert!(eventually(|| fabric.router().internal_routes().is_empty()).await);

    fabric.stop().await;
    coordinator.stop().await;
}
