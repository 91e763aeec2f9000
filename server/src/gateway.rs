//! Socket-backed [`Gateway`]: fans lobby dispatches out to per-connection queues.

use crate::metrics::WsMetrics;
use axum::extract::ws::Message;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use typerace_execution::{Audience, Dispatch, Gateway};
use typerace_types::ConnectionId;

pub type OutboundSender = mpsc::Sender<Message>;

pub struct SocketGateway {
    connections: RwLock<HashMap<ConnectionId, OutboundSender>>,
    metrics: Arc<WsMetrics>,
}

impl SocketGateway {
    pub fn new(metrics: Arc<WsMetrics>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    pub fn register(&self, id: ConnectionId, sender: OutboundSender) {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, sender);
    }

    pub fn unregister(&self, id: &ConnectionId) {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    pub fn len(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, id: &ConnectionId, sender: &OutboundSender, text: &str) {
        match sender.try_send(Message::Text(text.to_string())) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.inc_queue_full();
                tracing::warn!(connection = %id, "outbound queue full; dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(connection = %id, "outbound queue closed; dropping event");
            }
        }
    }
}

impl Gateway for SocketGateway {
    fn deliver(&self, dispatch: &Dispatch) {
        let text = match serde_json::to_string(&dispatch.event) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(?err, "failed to encode server event");
                return;
            }
        };
        let connections = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match &dispatch.audience {
            Audience::All => {
                for (id, sender) in connections.iter() {
                    self.push(id, sender, &text);
                }
            }
            Audience::Room { members, .. } => {
                for id in members {
                    if let Some(sender) = connections.get(id) {
                        self.push(id, sender, &text);
                    }
                }
            }
            Audience::Connection(id) => {
                if let Some(sender) = connections.get(id) {
                    self.push(id, sender, &text);
                }
            }
        }
    }
}
