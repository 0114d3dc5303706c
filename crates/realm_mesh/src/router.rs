//! Message router: the routing decision for inbound envelopes, and the
//! application handlers they are delivered to.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::dedup::DedupCache;
use crate::message::{Envelope, HelloPayload, MessageKind, PeerEndpoint};

/// A handler invoked once per unique application message of its kind.
pub type MessageHandler =
    Arc<dyn Fn(Envelope) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Wrap an async closure as a [`MessageHandler`].
pub fn handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |envelope| Box::pin(f(envelope)))
}

/// What the node should do with one inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Already processed; do nothing.
    Duplicate,
    /// A control message whose payload could not be decoded.
    Malformed { kind: MessageKind, reason: String },
    /// Session opener from the sender.
    Hello {
        envelope: Envelope,
        hello: HelloPayload,
    },
    /// Reply to our HELLO.
    HelloAck {
        envelope: Envelope,
        hello: HelloPayload,
    },
    /// Keep-alive ping; answer on the same transport.
    Heartbeat(Envelope),
    /// Keep-alive pong.
    HeartbeatAck(Envelope),
    /// Peers the sender knows about.
    PeerList {
        envelope: Envelope,
        peers: Vec<PeerEndpoint>,
    },
    /// An application message: optionally re-flood `forward`, then deliver
    /// `deliver` to the local handlers.
    Application {
        forward: Option<Envelope>,
        deliver: Envelope,
    },
}

/// Holds the application handlers, keyed by verb.
pub struct MessageRouter {
    handlers: HashMap<String, MessageHandler>,
    default_handler: Option<MessageHandler>,
}

impl MessageRouter {
    /// Create a new router with no handlers registered.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            default_handler: None,
        }
    }

    /// Decide how to handle `envelope`, recording its id in `seen`.
    ///
    /// Pure apart from the dedup insert: no I/O and no registry access.
    pub fn route(envelope: Envelope, seen: &DedupCache) -> Route {
        if !seen.insert(envelope.message_id) {
            return Route::Duplicate;
        }

        match envelope.kind {
            MessageKind::Hello => match envelope.parse_payload::<HelloPayload>() {
                Ok(hello) => Route::Hello { envelope, hello },
                Err(e) => malformed(envelope.kind, e),
            },
            MessageKind::HelloAck => match envelope.parse_payload::<HelloPayload>() {
                Ok(hello) => Route::HelloAck { envelope, hello },
                Err(e) => malformed(envelope.kind, e),
            },
            MessageKind::Heartbeat => Route::Heartbeat(envelope),
            MessageKind::HeartbeatAck => Route::HeartbeatAck(envelope),
            MessageKind::PeerList => match envelope.parse_payload::<Vec<PeerEndpoint>>() {
                Ok(peers) => Route::PeerList { envelope, peers },
                Err(e) => malformed(envelope.kind, e),
            },
            _ => {
                let forward = (envelope.ttl > 0).then(|| {
                    let mut next = envelope.clone();
                    next.ttl -= 1;
                    next
                });
                Route::Application {
                    forward,
                    deliver: envelope,
                }
            }
        }
    }

    /// Register a handler for a specific message kind, replacing any previous
    /// handler for that kind.
    pub fn register(&mut self, kind: MessageKind, handler: MessageHandler) {
        debug!("Registering handler for message kind: {kind}");
        self.handlers.insert(kind.as_str().to_string(), handler);
    }

    /// Register a default handler for kinds without a specific one.
    pub fn set_default_handler(&mut self, handler: MessageHandler) {
        self.default_handler = Some(handler);
    }

    /// Check if a handler is registered for a specific message kind.
    pub fn has_handler(&self, kind: &MessageKind) -> bool {
        self.handlers.contains_key(kind.as_str())
    }

    /// Return the number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// The handler that would receive `kind`: the specific one, else the
    /// default.
    pub fn handler_for(&self, kind: &MessageKind) -> Option<MessageHandler> {
        self.handlers
            .get(kind.as_str())
            .or(self.default_handler.as_ref())
            .cloned()
    }

    /// Deliver an envelope to its handler. Returns `false` if none matched.
    pub async fn dispatch(&self, envelope: Envelope) -> bool {
        match self.handler_for(&envelope.kind) {
            Some(handler) => {
                handler(envelope).await;
                true
            }
            None => {
                trace!("No handler for message kind: {}", envelope.kind);
                false
            }
        }
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

fn malformed(kind: MessageKind, err: serde_json::Error) -> Route {
    Route::Malformed {
        kind,
        reason: err.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
