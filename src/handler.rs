use async_trait::async_trait;

use crate::message::{Ack, BatchInfo, Message};

/// Errors user callbacks may surface. Any error crashes the stage that
/// invoked the callback; the supervisor restarts it.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The user module carried by a topology: the per-message transform and
/// the per-batch sink, plus the opaque context handed to both.
///
/// `handle_message` runs on a processor worker. It may mutate the
/// payload and pick the destination with [`Message::set_publisher`];
/// returning `Err` (or panicking) crashes that worker and loses its
/// in-flight messages.
///
/// `handle_batch` runs on a consumer worker and decides which messages
/// were successful; both lists travel unchanged to the acknowledgers.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    type Payload: Send + 'static;
    type Context: Clone + Send + Sync + 'static;

    async fn handle_message(
        &self,
        message: Message<Self::Payload>,
        context: &Self::Context,
    ) -> Result<Message<Self::Payload>, HandlerError>;

    async fn handle_batch(
        &self,
        publisher: &str,
        messages: Vec<Message<Self::Payload>>,
        info: &BatchInfo,
        context: &Self::Context,
    ) -> Result<Ack<Self::Payload>, HandlerError>;
}
