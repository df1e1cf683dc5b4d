//! A state machine for connections to remote resources.
//!
//! A [`Connection`] does not know how to reach the remote side, it delegates that to a
//! [`Binder`]. The binder reports back through [`ConnectionEvents`], and the connection
//! publishes its current [`ConnectionState`] through a `watch` channel.
//!
//! Every binding gets a new generation. Callbacks from a binding that was since unbound or
//! replaced are ignored, so a binder never has to worry about reporting late.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use thiserror::Error;
use tokio::sync::watch;

/// The state of a [`Connection`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState<H> {
    /// No binding exists.
    Unbound,
    /// A binding was requested and the remote side has not connected yet.
    Binding,
    Connected(H),
    /// The remote side went away while the binding remains in place.
    Lost,
    /// The connection was destroyed and cannot be bound again.
    Destroyed,
}

impl<H> ConnectionState<H> {
    fn is_bound(&self) -> bool {
        matches!(self, Self::Binding | Self::Connected(_) | Self::Lost)
    }
}

/// Lifecycle events of the scope that owns a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Started,
    Stopped,
    Destroyed,
}

#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("connection has been destroyed")]
    Destroyed,
    #[error("failed to bind: {0:#}")]
    BindFailed(Arc<anyhow::Error>),
}

/// Establishes and tears down bindings to the remote side.
pub trait Binder: Sized + Send + Sync + 'static {
    /// The handle to the remote side once connected.
    type Handle: Clone + fmt::Debug + Send + Sync + 'static;

    /// Requests a binding. The outcome is reported through `events`, possibly before this
    /// returns.
    fn bind(&self, events: ConnectionEvents<Self>) -> anyhow::Result<()>;

    /// Releases the current binding.
    fn unbind(&self);
}

struct Shared<B: Binder> {
    binder: B,
    state: watch::Sender<ConnectionState<B::Handle>>,
    /// Only modified while holding the lock of `state`.
    generation: AtomicU64,
    rebinds: AtomicUsize,
}

impl<B: Binder> Shared<B> {
    /// Applies `transition` if the state still belongs to `generation`.
    ///
    /// Returns whatever the transition returned, or `None` if the generation is outdated.
    fn transition<R>(
        &self,
        generation: u64,
        transition: impl FnOnce(&mut ConnectionState<B::Handle>, &AtomicU64) -> Option<R>,
    ) -> Option<R> {
        let mut result = None;
        self.state.send_if_modified(|state| {
            if self.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            result = transition(state, &self.generation);
            result.is_some()
        });
        result
    }

    fn bind(self: &Arc<Self>, generation: u64) -> Result<(), ConnectionError> {
        let events = ConnectionEvents {
            shared: Arc::downgrade(self),
            generation,
        };
        match self.binder.bind(events) {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "Failed to bind connection");
                self.transition(generation, |state, generation| {
                    generation.fetch_add(1, Ordering::SeqCst);
                    *state = ConnectionState::Unbound;
                    Some(())
                });
                Err(ConnectionError::BindFailed(Arc::new(err)))
            }
        }
    }
}

/// Callbacks a [`Binder`] uses to report on a binding.
///
/// The events are tied to the binding they were created for and become no-ops once that binding
/// is gone.
pub struct ConnectionEvents<B: Binder> {
    shared: Weak<Shared<B>>,
    generation: u64,
}

impl<B: Binder> Clone for ConnectionEvents<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
            generation: self.generation,
        }
    }
}

impl<B: Binder> fmt::Debug for ConnectionEvents<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEvents")
            .field("generation", &self.generation)
            .finish()
    }
}

impl<B: Binder> ConnectionEvents<B> {
    /// The remote side connected, or reconnected after being lost.
    pub fn connected(&self, handle: B::Handle) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let applied = shared.transition(self.generation, |state, _| {
            state.is_bound().then(|| {
                *state = ConnectionState::Connected(handle);
            })
        });
        if applied.is_some() {
            tracing::debug!(generation = self.generation, "Connection established");
        }
    }

    /// The remote side went away. The binding stays in place.
    pub fn disconnected(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let applied = shared.transition(self.generation, |state, _| {
            matches!(state, ConnectionState::Connected(_)).then(|| {
                *state = ConnectionState::Lost;
            })
        });
        if applied.is_some() {
            tracing::debug!(generation = self.generation, "Connection lost");
        }
    }

    /// The binding itself died. The connection unbinds and binds again.
    pub fn binding_died(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let rebind = shared.transition(self.generation, |state, generation| {
            state.is_bound().then(|| {
                *state = ConnectionState::Binding;
                generation.fetch_add(1, Ordering::SeqCst) + 1
            })
        });
        let Some(generation) = rebind else {
            return;
        };

        let rebinds = shared.rebinds.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(rebinds, "Binding died, rebinding");
        shared.binder.unbind();
        // The failure is already reflected in the state.
        shared.bind(generation).ok();
    }

    /// The remote side refused to provide a binding.
    pub fn null_binding(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let applied = shared.transition(self.generation, |state, generation| {
            state.is_bound().then(|| {
                generation.fetch_add(1, Ordering::SeqCst);
                *state = ConnectionState::Unbound;
            })
        });
        if applied.is_some() {
            tracing::debug!("Null binding, unbinding");
            shared.binder.unbind();
        }
    }
}

/// A connection to a remote resource, see the [module docs](self).
pub struct Connection<B: Binder> {
    shared: Arc<Shared<B>>,
}

impl<B: Binder> fmt::Debug for Connection<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &*self.shared.state.borrow())
            .finish()
    }
}

impl<B: Binder> Connection<B> {
    pub fn new(binder: B) -> Self {
        let (state, _) = watch::channel(ConnectionState::Unbound);
        Self {
            shared: Arc::new(Shared {
                binder,
                state,
                generation: AtomicU64::new(0),
                rebinds: AtomicUsize::new(0),
            }),
        }
    }

    pub fn binder(&self) -> &B {
        &self.shared.binder
    }

    /// Requests a binding. Does nothing if the connection is already bound.
    pub fn bind(&self) -> Result<(), ConnectionError> {
        let mut result = Ok(None);
        self.shared.state.send_if_modified(|state| match state {
            ConnectionState::Destroyed => {
                result = Err(ConnectionError::Destroyed);
                false
            }
            ConnectionState::Unbound => {
                *state = ConnectionState::Binding;
                result = Ok(Some(self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1));
                true
            }
            _ => false,
        });

        match result? {
            Some(generation) => {
                tracing::debug!(generation, "Binding connection");
                self.shared.bind(generation)
            }
            None => Ok(()),
        }
    }

    /// Releases the binding. Callbacks of the released binding are ignored from now on.
    pub fn unbind(&self) {
        if self.leave(ConnectionState::Unbound) {
            tracing::debug!("Unbound connection");
        }
    }

    /// Releases the binding for good. The connection cannot be bound again.
    pub fn destroy(&self) {
        if self.leave(ConnectionState::Destroyed) {
            tracing::debug!("Destroyed connection");
        }
    }

    /// Moves to `target` and releases the binding if there was one.
    ///
    /// Returns whether the state changed.
    fn leave(&self, target: ConnectionState<B::Handle>) -> bool {
        let mut was_bound = false;
        let changed = self.shared.state.send_if_modified(|state| {
            let same = std::mem::discriminant(&*state) == std::mem::discriminant(&target);
            if same || matches!(state, ConnectionState::Destroyed) {
                return false;
            }
            was_bound = state.is_bound();
            self.shared.generation.fetch_add(1, Ordering::SeqCst);
            *state = target;
            true
        });
        if was_bound {
            self.shared.binder.unbind();
        }
        changed
    }

    /// Follows the lifecycle of the owning scope.
    pub fn on_lifecycle(&self, event: Lifecycle) -> Result<(), ConnectionError> {
        match event {
            Lifecycle::Started => self.bind(),
            Lifecycle::Stopped => {
                self.unbind();
                Ok(())
            }
            Lifecycle::Destroyed => {
                self.destroy();
                Ok(())
            }
        }
    }

    pub fn state(&self) -> ConnectionState<B::Handle> {
        self.shared.state.borrow().clone()
    }

    /// The handle to the remote side, if connected.
    pub fn handle(&self) -> Option<B::Handle> {
        match &*self.shared.state.borrow() {
            ConnectionState::Connected(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Subscribes to state changes. The receiver always holds the latest state.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState<B::Handle>> {
        self.shared.state.subscribe()
    }

    /// Waits until the connection is established.
    pub async fn wait_connected(&self) -> Result<B::Handle, ConnectionError> {
        let mut states = self.subscribe();
        let connected = states
            .wait_for(|state| {
                matches!(
                    state,
                    ConnectionState::Connected(_) | ConnectionState::Destroyed
                )
            })
            .await
            .map(|state| match &*state {
                ConnectionState::Connected(handle) => Some(handle.clone()),
                _ => None,
            });

        match connected {
            Ok(Some(handle)) => Ok(handle),
            _ => Err(ConnectionError::Destroyed),
        }
    }

    /// How often a dead binding was replaced.
    pub fn rebinds(&self) -> usize {
        self.shared.rebinds.load(Ordering::SeqCst)
    }
}
