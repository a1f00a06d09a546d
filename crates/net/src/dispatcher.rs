//! Routes decoded messages to registered handlers.
//!
//! Everything that arrives here came from an untrusted peer: unknown ids,
//! malformed payloads and handler-less kinds are logged and dropped, never
//! returned as errors.

use crate::codec::MessageId;
use crate::error::NetError;
use crate::outbox::Outbox;
use crate::peer::Peer;
use crate::registry::{MessageRegistry, NetMessage};
use skylark_core::SimTime;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{trace, warn};

/// Per-message context handed to handlers.
pub struct MessageContext<'a> {
    /// Peer the message came from.
    pub sender: &'a Peer,
    /// Where handlers queue replies.
    pub outbox: &'a mut Outbox,
    /// Local receipt time.
    pub received_at: SimTime,
}

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Delivered to this many handlers.
    Handled(usize),
    /// The id is not registered.
    UnknownKind,
    /// The payload did not decode.
    Malformed,
    /// The kind is known but nothing handles it.
    NoHandler,
}

type Handler<C> = Box<dyn FnMut(&mut C, &dyn Any, &mut MessageContext<'_>)>;

/// Handler table over a shared registry. `C` is the state handlers mutate.
pub struct Dispatcher<C> {
    registry: Arc<MessageRegistry>,
    handlers: HashMap<MessageId, Vec<Handler<C>>>,
}

impl<C: 'static> Dispatcher<C> {
    /// Create a dispatcher with no handlers.
    pub fn new(registry: Arc<MessageRegistry>) -> Self {
        Self {
            registry,
            handlers: HashMap::new(),
        }
    }

    /// Registry this dispatcher decodes with.
    pub fn registry(&self) -> &Arc<MessageRegistry> {
        &self.registry
    }

    /// Append a handler for kind `T`; handlers run in registration order.
    pub fn register_handler<T, F>(&mut self, mut handler: F) -> Result<(), NetError>
    where
        T: NetMessage,
        F: FnMut(&mut C, &T, &mut MessageContext<'_>) + 'static,
    {
        let id = self
            .registry
            .id_of::<T>()
            .ok_or(NetError::UnregisteredKind(T::NAME))?;
        let wrapped: Handler<C> = Box::new(
            move |state: &mut C, message: &dyn Any, cx: &mut MessageContext<'_>| {
                if let Some(message) = message.downcast_ref::<T>() {
                    handler(state, message, cx);
                }
            },
        );
        self.handlers.entry(id).or_default().push(wrapped);
        Ok(())
    }

    /// Decode `payload` as kind `id` and run its handlers.
    pub fn dispatch(
        &mut self,
        state: &mut C,
        id: MessageId,
        payload: &[u8],
        cx: &mut MessageContext<'_>,
    ) -> DispatchOutcome {
        let sender = cx.sender.id;
        let Some(decoded) = self.registry.decode(id, payload) else {
            warn!(peer = %sender, message_id = id, "dropping message with unknown kind id");
            return DispatchOutcome::UnknownKind;
        };
        let kind = self.registry.name_of(id).unwrap_or("?");

        let message = match decoded {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %sender, kind, error = %e, "dropping malformed message");
                return DispatchOutcome::Malformed;
            }
        };

        let handlers = match self.handlers.get_mut(&id) {
            Some(handlers) if !handlers.is_empty() => handlers,
            _ => {
                warn!(peer = %sender, kind, "no handler registered; dropping message");
                return DispatchOutcome::NoHandler;
            }
        };

        trace!(peer = %sender, kind, handlers = handlers.len(), "dispatching");
        for handler in handlers.iter_mut() {
            handler(state, &*message, cx);
        }
        DispatchOutcome::Handled(handlers.len())
    }
}
