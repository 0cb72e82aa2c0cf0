use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

/// Destination key used when a message never had one assigned.
pub const DEFAULT_PUBLISHER: &str = "default";

/// Short symbolic tag selecting which batcher receives a message.
pub type PublisherKey = String;

/// Identity of a live stage: its derivable name plus an incarnation
/// counter bumped on every (re)spawn, so restarts are observable.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StageId {
    pub name: String,
    pub incarnation: u64,
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.incarnation)
    }
}

/// Acknowledges messages after the batch containing them was handled.
///
/// One handler instance is attached to each message at origin; the
/// pipeline groups acknowledgement calls by handler identity
/// (`Arc` pointer), so a whole batch from one source is acknowledged
/// in a single call. Acknowledgement is fire-and-forget: retries
/// against the external source are the handler's own business.
#[async_trait]
pub trait AckHandler<T>: Send + Sync {
    async fn ack(&self, successful: Vec<Message<T>>, failed: Vec<Message<T>>);
}

/// Acknowledger that does nothing. For sources with nothing to confirm.
pub struct NoopAck;

#[async_trait]
impl<T: Send + 'static> AckHandler<T> for NoopAck {
    async fn ack(&self, _successful: Vec<Message<T>>, _failed: Vec<Message<T>>) {}
}

/// Opaque per-message acknowledgement bookkeeping, e.g. a broker
/// receipt handle. Set at creation, never touched by the pipeline.
#[derive(Clone, Default)]
pub struct AckState(Option<Arc<dyn Any + Send + Sync>>);

impl AckState {
    pub fn new<S: Any + Send + Sync>(state: S) -> Self {
        AckState(Some(Arc::new(state)))
    }

    pub fn downcast_ref<S: Any>(&self) -> Option<&S> {
        self.0.as_deref().and_then(|s| s.downcast_ref())
    }
}

impl fmt::Debug for AckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("AckState(..)"),
            None => f.write_str("AckState(None)"),
        }
    }
}

/// The unit of work flowing through a pipeline.
///
/// Owned by exactly one stage at a time; ownership transfers along the
/// pipeline edges. The processor routes it by `publisher` and stamps
/// `processor` with its own identity before the user callback runs.
pub struct Message<T> {
    data: T,
    acknowledger: Arc<dyn AckHandler<T>>,
    ack_state: AckState,
    publisher: PublisherKey,
    processor: Option<StageId>,
    batch_seq: u64,
}

impl<T> Message<T> {
    pub fn new(data: T, acknowledger: Arc<dyn AckHandler<T>>) -> Self {
        Message {
            data,
            acknowledger,
            ack_state: AckState::default(),
            publisher: DEFAULT_PUBLISHER.to_owned(),
            processor: None,
            batch_seq: 0,
        }
    }

    /// A message nobody needs to acknowledge.
    pub fn unacked(data: T) -> Self
    where
        T: Send + 'static,
    {
        Message::new(data, Arc::new(NoopAck))
    }

    pub fn with_ack_state(mut self, state: AckState) -> Self {
        self.ack_state = state;
        self
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut T {
        &mut self.data
    }

    pub fn into_data(self) -> T {
        self.data
    }

    pub fn update_data(mut self, f: impl FnOnce(T) -> T) -> Self {
        self.data = f(self.data);
        self
    }

    /// Route this message to the batcher for `key`. The key must be one
    /// of the destinations declared at topology start.
    pub fn set_publisher(&mut self, key: impl Into<PublisherKey>) {
        self.publisher = key.into();
    }

    pub fn publisher(&self) -> &str {
        &self.publisher
    }

    /// The processor worker that most recently touched this message.
    pub fn processor(&self) -> Option<&StageId> {
        self.processor.as_ref()
    }

    pub fn acknowledger(&self) -> &Arc<dyn AckHandler<T>> {
        &self.acknowledger
    }

    pub fn ack_state(&self) -> &AckState {
        &self.ack_state
    }

    pub(crate) fn set_processor(&mut self, id: StageId) {
        self.processor = Some(id);
    }

    pub(crate) fn set_batch_seq(&mut self, seq: u64) {
        self.batch_seq = seq;
    }

    pub(crate) fn batch_seq(&self) -> u64 {
        self.batch_seq
    }
}

impl<T: fmt::Debug> fmt::Debug for Message<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("data", &self.data)
            .field("publisher", &self.publisher)
            .field("processor", &self.processor)
            .finish()
    }
}

/// Outcome of `handle_batch`: every received message placed in the list
/// the user chose. Both lists travel unchanged to the acknowledgers.
pub struct Ack<T> {
    pub successful: Vec<Message<T>>,
    pub failed: Vec<Message<T>>,
}

impl<T> Ack<T> {
    pub fn new(successful: Vec<Message<T>>, failed: Vec<Message<T>>) -> Self {
        Ack { successful, failed }
    }

    pub fn all_successful(messages: Vec<Message<T>>) -> Self {
        Ack {
            successful: messages,
            failed: Vec::new(),
        }
    }
}

/// Accompanies every batch delivered to `handle_batch`.
#[derive(Clone, Debug)]
pub struct BatchInfo {
    pub publisher: PublisherKey,
    /// Identity of the batcher that emitted the batch.
    pub batcher: StageId,
}
