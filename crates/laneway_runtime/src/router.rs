//! Type-routed publish/subscribe on a lane.
//!
//! Handlers are keyed by the message's [`TypeId`]. Sending snapshots the
//! handlers registered for that type and queues one lane task per handler, in
//! registration order, while holding the router lock; deliveries of one
//! message are therefore contiguous in the lane queue and always run on the
//! router's lane.

use crate::executor::DelayableExecutor;
use crate::queue::Deadline;
use crate::task::{CancellationHandle, TaskBody};
use laneway_core::{IdSequence, LaneResult, SubscriptionId};
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

type Message = Arc<dyn Any + Send + Sync>;
type Handler = Arc<dyn Fn(&(dyn Any + Send + Sync)) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    handler: Handler,
}

#[derive(Default)]
struct RouterState {
    subscribers: HashMap<TypeId, Vec<Subscriber>>,
    /// Deliveries that may not have run yet, for `cancel_messages`
    in_flight: HashMap<TypeId, Vec<CancellationHandle>>,
}

struct RouterInner {
    executor: Arc<dyn DelayableExecutor>,
    ids: IdSequence,
    state: Mutex<RouterState>,
}

impl RouterInner {
    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unsubscribe(&self, type_id: TypeId, id: SubscriptionId) -> bool {
        let mut state = self.lock();
        let Some(subscribers) = state.subscribers.get_mut(&type_id) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            state.subscribers.remove(&type_id);
        }
        removed
    }
}

/// Typed message bus whose handlers run on one lane
#[derive(Clone)]
pub struct MessageRouter {
    inner: Arc<RouterInner>,
}

impl MessageRouter {
    /// Create a router delivering on `executor`'s lane
    #[must_use]
    pub fn new(executor: Arc<dyn DelayableExecutor>) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                executor,
                ids: IdSequence::new(),
                state: Mutex::new(RouterState::default()),
            }),
        }
    }

    /// Name of the delivering lane
    #[must_use]
    pub fn lane_name(&self) -> &str {
        self.inner.executor.lane_name()
    }

    /// Register `handler` for messages of type `T`. Handlers for one type are
    /// called in registration order.
    pub fn subscribe<T, F>(&self, handler: F) -> Subscription
    where
        T: Any + Send + Sync,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let type_id = TypeId::of::<T>();
        let id = self.inner.ids.next_subscription();
        let handler: Handler = Arc::new(move |message: &(dyn Any + Send + Sync)| {
            if let Some(message) = message.downcast_ref::<T>() {
                handler(message);
            }
        });

        self.inner
            .lock()
            .subscribers
            .entry(type_id)
            .or_default()
            .push(Subscriber { id, handler });

        tracing::trace!(lane = self.lane_name(), message = type_name::<T>(), %id, "subscribed");
        Subscription {
            router: Arc::downgrade(&self.inner),
            type_id,
            id,
        }
    }

    /// Remove a handler. Deliveries already queued still run.
    ///
    /// Returns `false` if it was already removed.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        subscription.unsubscribe()
    }

    /// Queue one delivery of `message` per handler of `T`. Returns how many
    /// deliveries were queued; a message nobody listens for is dropped.
    pub fn send<T>(&self, message: T) -> usize
    where
        T: Any + Send + Sync,
    {
        let executor = &self.inner.executor;
        let Ok(count) = self.dispatch(message, |label, body| {
            Ok::<_, Infallible>(executor.enqueue(Some(label), body))
        });
        count
    }

    /// As [`MessageRouter::send`], with deliveries held back by `delay`
    ///
    /// # Errors
    ///
    /// Returns error if the delay overflows the clock
    pub fn send_delayed<T>(&self, message: T, delay: Duration) -> LaneResult<usize>
    where
        T: Any + Send + Sync,
    {
        let executor = &self.inner.executor;
        let at = Deadline::After(delay).resolve(executor.now())?;
        self.dispatch(message, |label, body| {
            executor.enqueue_at(Some(label), body, Deadline::At(at))
        })
    }

    /// Queue one delivery per handler through `enqueue`, all under the
    /// router lock.
    fn dispatch<T, E>(
        &self,
        message: T,
        mut enqueue: impl FnMut(String, TaskBody) -> Result<CancellationHandle, E>,
    ) -> Result<usize, E>
    where
        T: Any + Send + Sync,
    {
        let type_id = TypeId::of::<T>();
        let mut state = self.inner.lock();

        let handlers: Vec<Handler> = state
            .subscribers
            .get(&type_id)
            .map(|subs| subs.iter().map(|s| Arc::clone(&s.handler)).collect())
            .unwrap_or_default();

        if handlers.is_empty() {
            tracing::debug!(
                lane = self.lane_name(),
                message = type_name::<T>(),
                "no subscribers, message dropped"
            );
            return Ok(0);
        }

        let message: Message = Arc::new(message);
        let label = format!("message:{}", type_name::<T>());
        let mut queued = Vec::with_capacity(handlers.len());
        for handler in handlers {
            let message = Arc::clone(&message);
            let body: TaskBody = Box::new(move || {
                handler(message.as_ref());
                Ok(())
            });
            queued.push(enqueue(label.clone(), body)?);
        }

        let count = queued.len();
        let in_flight = state.in_flight.entry(type_id).or_default();
        in_flight.retain(CancellationHandle::is_pending);
        in_flight.extend(queued);
        Ok(count)
    }

    /// Cancel deliveries of `T` that have not started. Returns how many were
    /// stopped.
    pub fn cancel_messages<T>(&self) -> usize
    where
        T: Any + Send + Sync,
    {
        let pending = self
            .inner
            .lock()
            .in_flight
            .remove(&TypeId::of::<T>())
            .unwrap_or_default();
        pending.iter().filter(|h| h.cancel()).count()
    }

    /// Cancel every delivery that has not started. Returns how many were
    /// stopped.
    pub fn cancel_all(&self) -> usize {
        let pending = std::mem::take(&mut self.inner.lock().in_flight);
        pending
            .values()
            .flatten()
            .filter(|h| h.cancel())
            .count()
    }

    /// Handlers registered for `T`
    #[must_use]
    pub fn subscriber_count<T>(&self) -> usize
    where
        T: Any + Send + Sync,
    {
        self.inner
            .lock()
            .subscribers
            .get(&TypeId::of::<T>())
            .map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("lane", &self.lane_name())
            .finish_non_exhaustive()
    }
}

/// Handle for one registered handler
#[derive(Debug, Clone)]
pub struct Subscription {
    router: Weak<RouterInner>,
    type_id: TypeId,
    id: SubscriptionId,
}

impl Subscription {
    /// Subscription id
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Remove the handler; idempotent. Returns `true` only on the call that
    /// removed it.
    pub fn unsubscribe(&self) -> bool {
        self.router
            .upgrade()
            .is_some_and(|router| router.unsubscribe(self.type_id, self.id))
    }
}
