//! Message dispatcher: routes each received message by type, and opaque
//! messages by sub-type to registered handlers.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::connection::PeerConnection;
use crate::entity::{ComponentKind, EntitySnapshot, EntityTable};
use crate::error::{HandshakeError, NetworkError};
use crate::events::{EventSink, NetworkEvent};
use crate::identity::{NodeVersion, PeerId};
use crate::message::{Message, MessageType};
use crate::payload::{CapabilityHandshake, DatagramHandshake, EntityRemoval, HealthProbe};

/// An opaque message handed to a sub-type handler.
#[derive(Debug, Clone)]
pub struct OpaqueMessage {
    pub from: PeerId,
    pub sub_type: String,
    pub payload: Bytes,
}

/// Handler for one opaque sub-type.
pub type OpaqueHandler =
    Arc<dyn Fn(OpaqueMessage) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Everything a dispatch may touch.
pub struct DispatchContext<'a> {
    /// The connection the message arrived on.
    pub peer: &'a PeerConnection,
    pub entities: &'a EntityTable,
    pub events: &'a EventSink,
    /// Updates about this entity are echoes of our own and are ignored.
    pub local_entity: Option<Uuid>,
}

/// What dispatching did, for the caller to act on.
#[derive(Debug)]
pub enum DispatchOutcome {
    Handled,
    /// Nothing to do (unknown sub-type, echo of our own entity, stale removal).
    Ignored,
    /// The capability handshake passed; `released` were held by the gate.
    HandshakeAccepted {
        version: NodeVersion,
        released: Vec<Message>,
    },
    HandshakeRejected(HandshakeError),
}

/// Routes messages by type. Opaque sub-type handlers can be registered at any
/// time; the latest registration for a sub-type wins.
pub struct MessageDispatcher {
    handlers: RwLock<HashMap<String, OpaqueHandler>>,
}

impl MessageDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler for an opaque sub-type, replacing any previous one.
    pub fn register(&self, sub_type: impl Into<String>, handler: OpaqueHandler) {
        let sub_type = sub_type.into();
        debug!("Registering opaque handler for sub-type: {sub_type}");
        self.handlers.write().insert(sub_type, handler);
    }

    pub fn unregister(&self, sub_type: &str) -> bool {
        self.handlers.write().remove(sub_type).is_some()
    }

    pub fn has_handler(&self, sub_type: &str) -> bool {
        self.handlers.read().contains_key(sub_type)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Dispatch one message. A decode failure affects only this message.
    pub async fn dispatch(
        &self,
        ctx: &DispatchContext<'_>,
        message: &Message,
    ) -> Result<DispatchOutcome, NetworkError> {
        match message.kind() {
            MessageType::CapabilityHandshake => {
                let handshake = CapabilityHandshake::decode(message)?;
                match ctx.peer.complete_handshake(handshake.version.clone()) {
                    Ok(Some(released)) => Ok(DispatchOutcome::HandshakeAccepted {
                        version: handshake.version,
                        released,
                    }),
                    Ok(None) => Ok(DispatchOutcome::Ignored),
                    Err(e) => Ok(DispatchOutcome::HandshakeRejected(e)),
                }
            }
            MessageType::DatagramHandshake => {
                ctx.peer.set_remote_route(DatagramHandshake::decode(message)?);
                Ok(DispatchOutcome::Handled)
            }
            MessageType::HealthProbe => {
                ctx.peer.on_probe(HealthProbe::decode(message)?).await?;
                Ok(DispatchOutcome::Handled)
            }
            MessageType::EntityUpdate => self.entity_update(ctx, message),
            MessageType::EntityRemove => self.entity_remove(ctx, message),
            MessageType::Generic => {
                ctx.events.emit(NetworkEvent::GenericMessage {
                    from: ctx.peer.id(),
                    payload: message.payload().clone(),
                });
                Ok(DispatchOutcome::Handled)
            }
            MessageType::Opaque => Ok(self.opaque(ctx, message).await),
        }
    }

    fn entity_update(
        &self,
        ctx: &DispatchContext<'_>,
        message: &Message,
    ) -> Result<DispatchOutcome, NetworkError> {
        let snapshot = EntitySnapshot::from_message(message)?;
        let id = snapshot.id();
        if ctx.local_entity == Some(id) {
            debug!("Ignoring echo of local entity {id} from {}", ctx.peer.id());
            return Ok(DispatchOutcome::Ignored);
        }

        ctx.entities.upsert(&snapshot);
        ctx.peer.record_introduced(id);

        let via = Some(ctx.peer.id());
        if snapshot.is_new_introduction() && snapshot.has(ComponentKind::Identity) {
            ctx.events.emit(NetworkEvent::EntityIntroduced {
                id,
                name: snapshot.display_name(),
                via,
            });
        } else {
            ctx.events.emit(NetworkEvent::EntityUpdated { id, via });
        }
        Ok(DispatchOutcome::Handled)
    }

    fn entity_remove(
        &self,
        ctx: &DispatchContext<'_>,
        message: &Message,
    ) -> Result<DispatchOutcome, NetworkError> {
        let id = EntityRemoval::decode(message)?.entity_id;
        ctx.peer.forget_introduced(&id);

        let Some(previous) = ctx.entities.remove(&id) else {
            debug!("Removal of unknown entity {id} from {}", ctx.peer.id());
            return Ok(DispatchOutcome::Ignored);
        };
        ctx.events.emit(NetworkEvent::EntityRemoved {
            id,
            name: Some(previous.display_name()),
            via: Some(ctx.peer.id()),
        });
        Ok(DispatchOutcome::Handled)
    }

    async fn opaque(&self, ctx: &DispatchContext<'_>, message: &Message) -> DispatchOutcome {
        let sub_type = message.sub_type().unwrap_or_default().to_string();
        let handler = self.handlers.read().get(&sub_type).cloned();

        let opaque = OpaqueMessage {
            from: ctx.peer.id(),
            sub_type,
            payload: message.payload().clone(),
        };
        match handler {
            Some(handler) => {
                handler(opaque).await;
                DispatchOutcome::Handled
            }
            None => {
                debug!("No handler for opaque sub-type: {}", opaque.sub_type);
                ctx.events.emit(NetworkEvent::OpaqueUnhandled {
                    from: opaque.from,
                    sub_type: opaque.sub_type,
                    payload: opaque.payload,
                });
                DispatchOutcome::Ignored
            }
        }
    }
}

impl Default for MessageDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
