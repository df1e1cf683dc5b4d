use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::actor::Message;
use super::driver::TaskDriver;
use super::outcome::{QueryEvent, QueryOutcome};

/// Identifies a single submission to a [`Loader`](super::Loader).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(Uuid);

impl QueryId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Receives the events of queries that were submitted with a listener.
///
/// Listeners are invoked one event at a time from the loader's callback context.
pub trait QueryListener<T, P>: Send + Sync + 'static {
    fn on_event(&self, query: QueryId, event: QueryEvent<T, P>);
}

/// Called with events that could not be delivered because their receiver is gone.
pub type ReferenceLostHook<T, P> = Box<dyn Fn(QueryId, QueryEvent<T, P>) + Send + Sync>;

enum Receiver<T, P> {
    /// Events go to the channel of the [`QueryHandle`].
    Handle,
    Strong(Arc<dyn QueryListener<T, P>>),
    Weak(Weak<dyn QueryListener<T, P>>),
}

/// Configures how the events of a query are received.
///
/// By default, events are received through the returned [`QueryHandle`].
pub struct QueryBuilder<T, P> {
    receiver: Receiver<T, P>,
    on_reference_lost: Option<ReferenceLostHook<T, P>>,
}

impl<T, P> Default for QueryBuilder<T, P> {
    fn default() -> Self {
        Self {
            receiver: Receiver::Handle,
            on_reference_lost: None,
        }
    }
}

impl<T, P> QueryBuilder<T, P>
where
    T: Send + 'static,
    P: Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers events to `listener`, keeping it alive until the query finishes.
    pub fn listener<L>(mut self, listener: Arc<L>) -> Self
    where
        L: QueryListener<T, P>,
    {
        self.receiver = Receiver::Strong(listener);
        self
    }

    /// Delivers events to `listener` for as long as somebody else keeps it alive.
    pub fn weak_listener<L>(mut self, listener: &Arc<L>) -> Self
    where
        L: QueryListener<T, P>,
    {
        let listener: Weak<L> = Arc::downgrade(listener);
        let listener: Weak<dyn QueryListener<T, P>> = listener;
        self.receiver = Receiver::Weak(listener);
        self
    }

    /// Registers a hook that receives events whose receiver is gone.
    pub fn on_reference_lost<F>(mut self, hook: F) -> Self
    where
        F: Fn(QueryId, QueryEvent<T, P>) + Send + Sync + 'static,
    {
        self.on_reference_lost = Some(Box::new(hook));
        self
    }

    pub(crate) fn build(
        self,
        id: QueryId,
    ) -> (Arc<Sink<T, P>>, mpsc::UnboundedReceiver<QueryEvent<T, P>>) {
        let (sender, events) = mpsc::unbounded_channel();
        let target = match self.receiver {
            Receiver::Handle => Target::Channel(sender),
            // The handle's channel stays empty and reports its end right away.
            Receiver::Strong(listener) => Target::Strong(listener),
            Receiver::Weak(listener) => Target::Weak(listener),
        };
        let sink = Sink {
            id,
            target,
            on_reference_lost: self.on_reference_lost,
        };
        (Arc::new(sink), events)
    }
}

enum Target<T, P> {
    Channel(mpsc::UnboundedSender<QueryEvent<T, P>>),
    Strong(Arc<dyn QueryListener<T, P>>),
    Weak(Weak<dyn QueryListener<T, P>>),
}

/// The delivery end of a query.
pub(crate) struct Sink<T, P> {
    id: QueryId,
    target: Target<T, P>,
    on_reference_lost: Option<ReferenceLostHook<T, P>>,
}

impl<T, P> Sink<T, P>
where
    T: 'static,
    P: 'static,
{
    fn deliver(&self, event: QueryEvent<T, P>) {
        let lost = match &self.target {
            Target::Channel(sender) => sender.send(event).err().map(|err| err.0),
            Target::Strong(listener) => {
                listener.on_event(self.id, event);
                None
            }
            Target::Weak(listener) => match listener.upgrade() {
                Some(listener) => {
                    listener.on_event(self.id, event);
                    None
                }
                None => Some(event),
            },
        };

        if let Some(event) = lost {
            match &self.on_reference_lost {
                Some(hook) => hook(self.id, event),
                None => {
                    tracing::trace!(query = %self.id, "Receiver of query is gone, dropping event");
                    metric!(counter("loader.reference_lost") += 1);
                }
            }
        }
    }
}

struct Delivery<T, P> {
    sink: Arc<Sink<T, P>>,
    event: QueryEvent<T, P>,
}

/// Queues events for delivery in the callback context.
///
/// All events go through a single FIFO queue, so every query sees its events in the order they
/// were produced.
pub(crate) struct Dispatcher<T, P> {
    queue: mpsc::UnboundedSender<Delivery<T, P>>,
}

impl<T, P> Clone for Dispatcher<T, P> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
        }
    }
}

impl<T, P> Dispatcher<T, P>
where
    T: Send + 'static,
    P: Send + 'static,
{
    /// Spawns the delivery loop onto `callback`. It runs until every dispatcher is dropped.
    pub(crate) fn spawn(callback: &Handle) -> Self {
        let (queue, mut deliveries) = mpsc::unbounded_channel::<Delivery<T, P>>();
        callback.spawn(async move {
            while let Some(Delivery { sink, event }) = deliveries.recv().await {
                let id = sink.id;
                if catch_unwind(AssertUnwindSafe(|| sink.deliver(event))).is_err() {
                    tracing::error!(query = %id, "Query receiver panicked");
                }
            }
        });
        Self { queue }
    }

    pub(crate) fn send(&self, sink: &Arc<Sink<T, P>>, event: QueryEvent<T, P>) {
        let delivery = Delivery {
            sink: Arc::clone(sink),
            event,
        };
        if self.queue.send(delivery).is_err() {
            tracing::warn!(query = %sink.id, "Callback context is gone, dropping event");
        }
    }
}

/// The loader's side of a submission.
pub(crate) struct Query<D: TaskDriver> {
    id: QueryId,
    key: D::Key,
    sink: Arc<Sink<D::Output, D::Progress>>,
}

impl<D: TaskDriver> Query<D> {
    pub(crate) fn new(id: QueryId, key: D::Key, sink: Arc<Sink<D::Output, D::Progress>>) -> Self {
        Self { id, key, sink }
    }

    pub(crate) fn id(&self) -> QueryId {
        self.id
    }

    pub(crate) fn key(&self) -> &D::Key {
        &self.key
    }

    pub(crate) fn progress(
        &self,
        progress: D::Progress,
        dispatcher: &Dispatcher<D::Output, D::Progress>,
    ) {
        dispatcher.send(&self.sink, QueryEvent::Progress(progress));
    }

    /// Delivers the terminal outcome. This consumes the query, so it can only happen once.
    pub(crate) fn finish(
        self,
        outcome: QueryOutcome<D::Output>,
        dispatcher: &Dispatcher<D::Output, D::Progress>,
    ) {
        tracing::trace!(query = %self.id, key = ?self.key, outcome = outcome.kind(), "Query finished");
        dispatcher.send(&self.sink, QueryEvent::Finished(outcome));
    }
}

/// The caller's side of a submission, returned by [`Loader::submit`](super::Loader::submit).
///
/// Dropping the handle does not cancel the query. Events that arrive afterwards are lost, see
/// [`QueryBuilder::on_reference_lost`].
pub struct QueryHandle<D: TaskDriver> {
    id: QueryId,
    key: D::Key,
    events: mpsc::UnboundedReceiver<QueryEvent<D::Output, D::Progress>>,
    actor: mpsc::UnboundedSender<Message<D>>,
}

impl<D: TaskDriver> fmt::Debug for QueryHandle<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryHandle")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish()
    }
}

impl<D: TaskDriver> QueryHandle<D> {
    pub(crate) fn new(
        id: QueryId,
        key: D::Key,
        events: mpsc::UnboundedReceiver<QueryEvent<D::Output, D::Progress>>,
        actor: mpsc::UnboundedSender<Message<D>>,
    ) -> Self {
        Self {
            id,
            key,
            events,
            actor,
        }
    }

    pub fn id(&self) -> QueryId {
        self.id
    }

    /// The key this query was submitted with.
    pub fn key(&self) -> &D::Key {
        &self.key
    }

    /// Cancels the query.
    ///
    /// Without `cancel_entire_task`, only this query is detached from its task, unless it is the
    /// last one, in which case the task is cancelled as well. With `cancel_entire_task`, the task
    /// and all of its queries are cancelled. Cancelling a finished query does nothing.
    pub fn cancel(&self, reason: Option<String>, cancel_entire_task: bool) {
        let message = Message::CancelQuery {
            id: self.id,
            reason,
            cancel_entire_task,
        };
        if self.actor.send(message).is_err() {
            tracing::trace!(query = %self.id, "Loader is gone, nothing to cancel");
        }
    }

    /// Waits for the next event of this query.
    ///
    /// Returns `None` after the terminal event was received, or right away if the query was
    /// submitted with a listener.
    pub async fn next_event(&mut self) -> Option<QueryEvent<D::Output, D::Progress>> {
        self.events.recv().await
    }

    /// Returns an event that was already delivered, without waiting.
    pub fn try_next_event(&mut self) -> Option<QueryEvent<D::Output, D::Progress>> {
        self.events.try_recv().ok()
    }

    /// Waits for the terminal outcome, skipping progress.
    pub async fn outcome(&mut self) -> Option<QueryOutcome<D::Output>> {
        while let Some(event) = self.events.recv().await {
            if let QueryEvent::Finished(outcome) = event {
                return Some(outcome);
            }
        }
        None
    }
}
