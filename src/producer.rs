use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dispatcher::EventDispatcher;
use crate::message::{Message, StageId};
use crate::processor::ProcessorMsg;
use crate::registry::{Endpoint, Registry};
use crate::supervisor::ChildSpec;

/// A user-supplied source of messages, wrapped by a producer stage.
///
/// The driver is only asked for events when downstream credit exists;
/// `handle_demand` may await upstream I/O. A driver with nothing to
/// hand out should await until something arrives rather than return an
/// empty set immediately, or the stage will ask again right away.
#[async_trait]
pub trait ProducerDriver: Send + 'static {
    type Payload: Send + 'static;

    /// Called once on the driver's own task before the first demand.
    async fn init(&mut self) {}

    /// Return up to `demand` messages. Returning fewer leaves the rest
    /// of the demand outstanding.
    async fn handle_demand(&mut self, demand: usize) -> Vec<Message<Self::Payload>>;

    /// Messages the stage had buffered when a graceful shutdown
    /// arrived. Dropped by default.
    async fn drain(&mut self, leftover: Vec<Message<Self::Payload>>) {
        let _ = leftover;
    }

    /// Called last, after the stage stopped asking.
    async fn terminate(&mut self) {}
}

pub(crate) type DriverFactory<T> =
    Arc<dyn Fn() -> Box<dyn ProducerDriver<Payload = T>> + Send + Sync>;

pub(crate) enum ProducerMsg<T> {
    /// A processor registering itself, with its initial credit.
    Subscribe {
        id: StageId,
        events: mpsc::UnboundedSender<ProcessorMsg<T>>,
        demand: usize,
    },
    /// Credit replenishment from a subscribed processor.
    Demand { id: StageId, n: usize },
    /// Synchronous injection; acknowledged once buffered.
    Push {
        messages: Vec<Message<T>>,
        reply: oneshot::Sender<()>,
    },
    Kill,
}

enum DriverReq<T> {
    Fill(usize),
    Drain(Vec<Message<T>>),
}

struct DriverBatch<T> {
    asked: usize,
    events: Vec<Message<T>>,
}

/// The driver loop runs beside the stage so that driver I/O never
/// blocks injection or credit handling. It exits when the stage drops
/// the request channel.
async fn drive<T: Send + 'static>(
    mut driver: Box<dyn ProducerDriver<Payload = T>>,
    mut requests: mpsc::UnboundedReceiver<DriverReq<T>>,
    events: mpsc::UnboundedSender<DriverBatch<T>>,
    stop: CancellationToken,
) {
    driver.init().await;
    loop {
        match requests.recv().await {
            None => break,
            Some(DriverReq::Fill(n)) => {
                if stop.is_cancelled() {
                    continue;
                }
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => {}
                    batch = driver.handle_demand(n) => {
                        let _ = events.send(DriverBatch { asked: n, events: batch });
                    }
                }
            }
            Some(DriverReq::Drain(leftover)) => driver.drain(leftover).await,
        }
    }
    driver.terminate().await;
}

pub(crate) struct Context<T> {
    id: StageId,
    inbox: mpsc::UnboundedReceiver<ProducerMsg<T>>,
    dispatcher: EventDispatcher<T>,
    buffer: VecDeque<Message<T>>,
    driver_reqs: mpsc::UnboundedSender<DriverReq<T>>,
    driver_events: mpsc::UnboundedReceiver<DriverBatch<T>>,
    /// Demand forwarded to the driver and not yet answered.
    requested: usize,
    stop: CancellationToken,
}

impl<T: Send + 'static> Context<T> {
    async fn run(mut self) {
        loop {
            // forward any credit not already covered by buffered or
            // requested events
            let credit = self.dispatcher.total_credit();
            let covered = self.buffer.len() + self.requested;
            if credit > covered {
                let n = credit - covered;
                self.requested += n;
                let _ = self.driver_reqs.send(DriverReq::Fill(n));
            }

            tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    let leftover: Vec<Message<T>> = self.buffer.drain(..).collect();
                    if !leftover.is_empty() {
                        let _ = self.driver_reqs.send(DriverReq::Drain(leftover));
                    }
                    return;
                }
                produced = self.driver_events.recv() => {
                    let Some(DriverBatch { asked, events }) = produced else {
                        // the driver died under us
                        return;
                    };
                    self.requested = self.requested.saturating_sub(asked);
                    self.buffer.extend(events);
                    self.dispatcher.dispatch(&self.id, &mut self.buffer);
                }
                msg = self.inbox.recv() => match msg {
                    None => return,
                    Some(ProducerMsg::Subscribe { id, events, demand }) => {
                        debug!(stage = %self.id, subscriber = %id, demand, "subscribed");
                        self.dispatcher.subscribe(id, events, demand);
                        self.dispatcher.dispatch(&self.id, &mut self.buffer);
                    }
                    Some(ProducerMsg::Demand { id, n }) => {
                        self.dispatcher.grant(&id, n);
                        self.dispatcher.dispatch(&self.id, &mut self.buffer);
                    }
                    Some(ProducerMsg::Push { messages, reply }) => {
                        self.buffer.extend(messages);
                        let _ = reply.send(());
                        self.dispatcher.dispatch(&self.id, &mut self.buffer);
                    }
                    Some(ProducerMsg::Kill) => {
                        warn!(stage = %self.id, "killed");
                        return;
                    }
                }
            }
        }
    }
}

async fn run_stage<T: Send + 'static>(
    id: StageId,
    inbox: mpsc::UnboundedReceiver<ProducerMsg<T>>,
    driver: Box<dyn ProducerDriver<Payload = T>>,
    stop: CancellationToken,
) {
    let (req_tx, req_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let driver_task = tokio::spawn(drive(driver, req_rx, event_tx, stop.clone()));

    let ctx = Context {
        id,
        inbox,
        dispatcher: EventDispatcher::new(),
        buffer: VecDeque::new(),
        driver_reqs: req_tx,
        driver_events: event_rx,
        requested: 0,
        stop: stop.clone(),
    };
    ctx.run().await;

    // on graceful shutdown the driver still owes us drain + terminate;
    // after a crash it notices the closed channel on its own
    if stop.is_cancelled() {
        let _ = driver_task.await;
    }
}

pub(crate) fn spec<T: Send + 'static>(
    name: String,
    registry: Registry<T>,
    factory: DriverFactory<T>,
) -> ChildSpec {
    ChildSpec {
        name: name.clone(),
        start: Arc::new(move |stop: CancellationToken| {
            let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
            let id = registry.register(&name, Endpoint::Producer(inbox_tx));
            let driver = factory();
            Box::pin(run_stage(id, inbox_rx, driver, stop))
        }),
    }
}
