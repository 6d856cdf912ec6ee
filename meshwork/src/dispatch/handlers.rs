//! Service messages handled by the dispatcher itself.
//!
//! Handlers are tried in order; the first whose `can_handle` accepts a
//! message consumes it. Control messages from other nodes are verified
//! against their domain before they touch the routing tables.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{Inner, Origin};
use crate::error::FabricError;
use crate::identifier::{Identifier, Node, NodeIdentity};
use crate::message::control::{
    DiscoverMessageRoute, Ping, RegisterExternalMessageRoute, RegisterInternalMessageRoute,
    RequestClusterMessageRoutes, RequestNodeMessageRoutes, UnregisterMessageRoute, UnregisterNode,
    UnregisterUnreachableNode,
};
use crate::message::Message;
use crate::security::group_by_domain;
use crate::transport::Socket;

#[async_trait]
pub(super) trait ServiceMessageHandler: Send + Sync {
    fn can_handle(&self, message: &Message, origin: Origin) -> bool;

    async fn handle(
        &self,
        router: &Inner,
        scale_out: &mut dyn Socket,
        message: Message,
    ) -> Result<(), FabricError>;
}

pub(super) fn service_handlers() -> Vec<Box<dyn ServiceMessageHandler>> {
    vec![
        Box::new(InternalRouteRegistration),
        Box::new(ExternalRouteRegistration),
        Box::new(RouteDiscovery),
        Box::new(ClusterRoutesRequest),
        Box::new(NodeRoutesRequest),
        Box::new(RouteUnregistration),
        Box::new(NodeUnregistration),
        Box::new(UnreachableNodeUnregistration),
        Box::new(ProbePing),
        Box::new(ForeignInternalRegistration),
    ]
}

fn verified(router: &Inner, message: &Message) -> bool {
    match message.verify(router.security.as_ref()) {
        Ok(()) => true,
        Err(e) => {
            warn!(
                message = %message.identifier(),
                domain = %message.domain,
                error = %e,
                "rejected control message"
            );
            false
        }
    }
}

/// Message routes must belong to the domain the announcement was signed in.
fn authorized(router: &Inner, domain: &str, route: &Identifier) -> bool {
    let Identifier::Message(identifier) = route else {
        return true;
    };
    match router.security.domain_of(identifier) {
        Ok(owner) if owner == domain => true,
        Ok(owner) => {
            warn!(route = %route, domain, owner = %owner, "route announced in foreign domain");
            false
        }
        Err(e) => {
            warn!(route = %route, domain, error = %e, "route has no domain");
            false
        }
    }
}

fn is_self(router: &Inner, node: &NodeIdentity) -> bool {
    node == router.local.identity()
}

/// Re-announces this node's global routes that belong to `domain`.
fn announce_routes(router: &Inner, domain: &str) {
    let routes = router.internal.lock().global_routes();
    if let Some(routes) = group_by_domain(router.security.as_ref(), routes).remove(domain) {
        router.cluster.register_self(routes, domain);
    }
}

fn forget_node(router: &Inner, scale_out: &mut dyn Socket, node: &NodeIdentity) {
    let removed = router.external.lock().remove_node_route(node);
    if let Some(peer) = removed {
        router.release(scale_out, &peer);
        info!(node = %peer.node, "node unregistered");
    }
    router.health.delete_peer(node);
}

struct InternalRouteRegistration;

#[async_trait]
impl ServiceMessageHandler for InternalRouteRegistration {
    fn can_handle(&self, message: &Message, origin: Origin) -> bool {
        origin == Origin::Local && message.is::<RegisterInternalMessageRoute>()
    }

    async fn handle(
        &self,
        router: &Inner,
        _scale_out: &mut dyn Socket,
        message: Message,
    ) -> Result<(), FabricError> {
        let registration = message.payload::<RegisterInternalMessageRoute>()?;
        let mut global = Vec::new();
        {
            let mut internal = router.internal.lock();
            for contract in registration.routes {
                if !contract.keep_local {
                    global.push(contract.identifier.clone());
                }
                internal.add_message_route(registration.receiver_identity.clone(), contract);
            }
        }
        debug!(
            receiver = %registration.receiver_identity,
            global = global.len(),
            "registered local routes"
        );
        for (domain, routes) in group_by_domain(router.security.as_ref(), global) {
            router.cluster.register_self(routes, &domain);
        }
        Ok(())
    }
}

/// Local registrations arriving from a peer are dropped.
struct ForeignInternalRegistration;

#[async_trait]
impl ServiceMessageHandler for ForeignInternalRegistration {
    fn can_handle(&self, message: &Message, origin: Origin) -> bool {
        origin == Origin::Remote && message.is::<RegisterInternalMessageRoute>()
    }

    async fn handle(
        &self,
        _router: &Inner,
        _scale_out: &mut dyn Socket,
        message: Message,
    ) -> Result<(), FabricError> {
        warn!(hops = ?message.hops, "dropping local route registration sent by a peer");
        Ok(())
    }
}

struct ExternalRouteRegistration;

#[async_trait]
impl ServiceMessageHandler for ExternalRouteRegistration {
    fn can_handle(&self, message: &Message, _origin: Origin) -> bool {
        message.is::<RegisterExternalMessageRoute>()
    }

    async fn handle(
        &self,
        router: &Inner,
        _scale_out: &mut dyn Socket,
        message: Message,
    ) -> Result<(), FabricError> {
        if !verified(router, &message) {
            return Ok(());
        }
        let registration = message.payload::<RegisterExternalMessageRoute>()?;
        if is_self(router, &registration.node.identity) {
            return Ok(());
        }
        let routes: Vec<Identifier> = registration
            .routes
            .into_iter()
            .filter(|route| authorized(router, &message.domain, route))
            .collect();
        if routes.is_empty() {
            return Ok(());
        }
        {
            let mut external = router.external.lock();
            for route in &routes {
                external.add_message_route(
                    registration.node.clone(),
                    registration.health.clone(),
                    route.clone(),
                );
            }
        }
        debug!(node = %registration.node, count = routes.len(), "registered peer routes");
        router
            .health
            .add_peer(registration.node, registration.health);
        Ok(())
    }
}

struct RouteDiscovery;

#[async_trait]
impl ServiceMessageHandler for RouteDiscovery {
    fn can_handle(&self, message: &Message, _origin: Origin) -> bool {
        message.is::<DiscoverMessageRoute>()
    }

    async fn handle(
        &self,
        router: &Inner,
        _scale_out: &mut dyn Socket,
        message: Message,
    ) -> Result<(), FabricError> {
        if !verified(router, &message) {
            return Ok(());
        }
        let request = message.payload::<DiscoverMessageRoute>()?;
        if is_self(router, &request.requestor.identity) {
            return Ok(());
        }
        let handled = {
            let internal = router.internal.lock();
            internal.can_route(&request.route) && internal.is_global(&request.route)
        };
        if handled && authorized(router, &message.domain, &request.route) {
            debug!(route = %request.route, requestor = %request.requestor, "answering route discovery");
            router
                .cluster
                .register_self(vec![request.route], &message.domain);
        }
        Ok(())
    }
}

struct ClusterRoutesRequest;

#[async_trait]
impl ServiceMessageHandler for ClusterRoutesRequest {
    fn can_handle(&self, message: &Message, _origin: Origin) -> bool {
        message.is::<RequestClusterMessageRoutes>()
    }

    async fn handle(
        &self,
        router: &Inner,
        _scale_out: &mut dyn Socket,
        message: Message,
    ) -> Result<(), FabricError> {
        if !verified(router, &message) {
            return Ok(());
        }
        let request = message.payload::<RequestClusterMessageRoutes>()?;
        if is_self(router, &request.requestor.identity) {
            return Ok(());
        }
        announce_routes(router, &message.domain);
        Ok(())
    }
}

struct NodeRoutesRequest;

#[async_trait]
impl ServiceMessageHandler for NodeRoutesRequest {
    fn can_handle(&self, message: &Message, _origin: Origin) -> bool {
        message.is::<RequestNodeMessageRoutes>()
    }

    async fn handle(
        &self,
        router: &Inner,
        _scale_out: &mut dyn Socket,
        message: Message,
    ) -> Result<(), FabricError> {
        if !verified(router, &message) {
            return Ok(());
        }
        let request = message.payload::<RequestNodeMessageRoutes>()?;
        if is_self(router, &request.target_node_identity) {
            announce_routes(router, &message.domain);
        }
        Ok(())
    }
}

struct RouteUnregistration;

#[async_trait]
impl ServiceMessageHandler for RouteUnregistration {
    fn can_handle(&self, message: &Message, _origin: Origin) -> bool {
        message.is::<UnregisterMessageRoute>()
    }

    async fn handle(
        &self,
        router: &Inner,
        scale_out: &mut dyn Socket,
        message: Message,
    ) -> Result<(), FabricError> {
        if !verified(router, &message) {
            return Ok(());
        }
        let request = message.payload::<UnregisterMessageRoute>()?;
        let Node { identity, .. } = &request.node;
        if is_self(router, identity) {
            return Ok(());
        }
        let routes: Vec<Identifier> = request
            .routes
            .into_iter()
            .filter(|route| authorized(router, &message.domain, route))
            .collect();
        let evicted = router.external.lock().remove_message_routes(identity, &routes);
        debug!(node = %request.node, count = routes.len(), "unregistered peer routes");
        if let Some(peer) = evicted {
            router.release(scale_out, &peer);
            router.health.delete_peer(identity);
        }
        Ok(())
    }
}

struct NodeUnregistration;

#[async_trait]
impl ServiceMessageHandler for NodeUnregistration {
    fn can_handle(&self, message: &Message, _origin: Origin) -> bool {
        message.is::<UnregisterNode>()
    }

    async fn handle(
        &self,
        router: &Inner,
        scale_out: &mut dyn Socket,
        message: Message,
    ) -> Result<(), FabricError> {
        if !verified(router, &message) {
            return Ok(());
        }
        let request = message.payload::<UnregisterNode>()?;
        if !is_self(router, &request.node.identity) {
            forget_node(router, scale_out, &request.node.identity);
        }
        Ok(())
    }
}

struct UnreachableNodeUnregistration;

#[async_trait]
impl ServiceMessageHandler for UnreachableNodeUnregistration {
    fn can_handle(&self, message: &Message, origin: Origin) -> bool {
        origin == Origin::Local && message.is::<UnregisterUnreachableNode>()
    }

    async fn handle(
        &self,
        router: &Inner,
        scale_out: &mut dyn Socket,
        message: Message,
    ) -> Result<(), FabricError> {
        let request = message.payload::<UnregisterUnreachableNode>()?;
        warn!(node = %request.node_identity, "unregistering unreachable node");
        forget_node(router, scale_out, &request.node_identity);
        Ok(())
    }
}

/// Connectivity probes from peers need no answer.
struct ProbePing;

#[async_trait]
impl ServiceMessageHandler for ProbePing {
    fn can_handle(&self, message: &Message, _origin: Origin) -> bool {
        message.is::<Ping>()
    }

    async fn handle(
        &self,
        _router: &Inner,
        _scale_out: &mut dyn Socket,
        _message: Message,
    ) -> Result<(), FabricError> {
        Ok(())
    }
}
