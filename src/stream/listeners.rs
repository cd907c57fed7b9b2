//! Listener registry and event dispatch.
//!
//! Listeners are registered through one of two paths: passthrough listeners
//! receive the [`SocketEvent`] untouched, decoding listeners parse the frame
//! text as JSON first. Each decoding listener parses independently, so one
//! frame yields one decode attempt per listener.
//!
//! A listener that fails or panics is reported and skipped for that event
//! only; it stays registered and the remaining listeners still run.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;

use crate::stream::client::StreamClientError;
use crate::stream::proto::InboundEnvelope;
use crate::stream::transport::{EventCategory, SocketEvent};

type RawHandler = Box<dyn FnMut(&SocketEvent) + Send>;
type DecodedHandler = Box<dyn FnMut(Value, &SocketEvent) + Send>;

/// Lifecycle categories whose listeners receive the native event.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum LifecycleCategory {
    Open,
    Close,
    Error,
}

impl From<LifecycleCategory> for EventCategory {
    fn from(category: LifecycleCategory) -> Self {
        match category {
            LifecycleCategory::Open => EventCategory::Open,
            LifecycleCategory::Close => EventCategory::Close,
            LifecycleCategory::Error => EventCategory::Error,
        }
    }
}

enum Listener {
    Passthrough {
        category: EventCategory,
        handler: RawHandler,
    },
    Decoded(DecodedHandler),
    Action {
        action: String,
        handler: DecodedHandler,
    },
}

impl Listener {
    fn handle(&mut self, event: &SocketEvent) -> Result<(), StreamClientError> {
        match self {
            Self::Passthrough { category, handler } => {
                if *category == event.category() {
                    handler(event);
                }
                Ok(())
            }
            Self::Decoded(handler) => {
                let Some(text) = event.data() else {
                    return Ok(());
                };
                let value = serde_json::from_str(text)?;
                handler(value, event);
                Ok(())
            }
            Self::Action { action, handler } => {
                let Some(text) = event.data() else {
                    return Ok(());
                };
                let envelope = InboundEnvelope::from_text(text)?;
                if envelope.action == *action {
                    handler(envelope.data, event);
                }
                Ok(())
            }
        }
    }
}

/// Ordered set of listeners shared between a client and its dispatch task.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    listeners: Arc<Mutex<Vec<Arc<Mutex<Listener>>>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener that receives events of `category` unmodified.
    pub fn add_passthrough<F>(&self, category: EventCategory, handler: F)
    where
        F: FnMut(&SocketEvent) + Send + 'static,
    {
        self.push(Listener::Passthrough {
            category,
            handler: Box::new(handler),
        });
    }

    /// Registers a listener that receives each message frame parsed as JSON.
    pub fn add_decoded<F>(&self, handler: F)
    where
        F: FnMut(Value, &SocketEvent) + Send + 'static,
    {
        self.push(Listener::Decoded(Box::new(handler)));
    }

    /// Registers a listener for `{action, data}` frames tagged with `action`.
    pub fn add_action<F>(&self, action: impl Into<String>, handler: F)
    where
        F: FnMut(Value, &SocketEvent) + Send + 'static,
    {
        self.push(Listener::Action {
            action: action.into(),
            handler: Box::new(handler),
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Delivers `event` to every listener in registration order.
    ///
    /// Listeners registered while dispatching see the next event, not this
    /// one. A failing or panicking listener does not stop the remaining ones;
    /// its error is collected into the returned list.
    pub fn dispatch(&self, event: &SocketEvent) -> Vec<StreamClientError> {
        let snapshot: Vec<_> = self.lock().iter().map(Arc::clone).collect();

        let mut failures = Vec::new();
        for entry in snapshot {
            let mut listener = entry.lock().unwrap_or_else(PoisonError::into_inner);
            match panic::catch_unwind(AssertUnwindSafe(|| listener.handle(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => failures.push(err),
                Err(payload) => failures.push(StreamClientError::ListenerPanicked(
                    panic_message(payload.as_ref()),
                )),
            }
        }
        failures
    }

    fn push(&self, listener: Listener) {
        self.lock().push(Arc::new(Mutex::new(listener)));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<Mutex<Listener>>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}
