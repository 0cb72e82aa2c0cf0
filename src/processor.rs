use std::collections::VecDeque;
use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::batcher::BatcherMsg;
use crate::config::{Watermarks, RESUBSCRIBE_INTERVAL};
use crate::demand::DemandGauge;
use crate::handler::Handler;
use crate::message::{Message, PublisherKey, StageId};
use crate::producer::ProducerMsg;
use crate::registry::{Endpoint, Registry};
use crate::supervisor::ChildSpec;

pub(crate) enum ProcessorMsg<T> {
    /// Events dispatched by a producer against this worker's credit.
    Events { from: StageId, batch: Vec<Message<T>> },
    /// A batcher advertising itself as the partition for `key`,
    /// with this worker's initial credit towards it.
    BatcherSubscribe {
        key: PublisherKey,
        batcher: StageId,
        events: mpsc::UnboundedSender<BatcherMsg<T>>,
        demand: usize,
    },
    /// Credit replenishment from a batcher.
    BatcherDemand {
        key: PublisherKey,
        batcher: StageId,
        n: usize,
    },
    Kill,
}

/// Downstream link for one destination key. `target` is absent until
/// the key's batcher subscribes (and again after it dies); messages
/// routed meanwhile park in `pending` and hold the worker still, which
/// is what keeps a slow batcher's backpressure honest.
struct KeyLink<T> {
    target: Option<(StageId, mpsc::UnboundedSender<BatcherMsg<T>>)>,
    credit: usize,
    pending: VecDeque<Message<T>>,
}

struct ProducerRef<T> {
    name: String,
    /// Incarnation this worker last subscribed to; 0 = never.
    incarnation: u64,
    tx: Option<mpsc::UnboundedSender<ProducerMsg<T>>>,
    gauge: DemandGauge,
}

fn flush_link<T: Send + 'static>(from: &StageId, link: &mut KeyLink<T>) {
    loop {
        if link.credit == 0 || link.pending.is_empty() {
            return;
        }
        let Some((_, tx)) = &link.target else {
            return;
        };
        let Some(message) = link.pending.pop_front() else {
            return;
        };
        match tx.send(BatcherMsg::Events {
            from: from.clone(),
            batch: vec![message],
        }) {
            Ok(()) => link.credit -= 1,
            Err(mpsc::error::SendError(returned)) => {
                if let BatcherMsg::Events { mut batch, .. } = returned {
                    if let Some(message) = batch.pop() {
                        link.pending.push_front(message);
                    }
                }
                link.target = None;
                link.credit = 0;
                return;
            }
        }
    }
}

pub(crate) struct Context<H: Handler> {
    id: StageId,
    inbox: mpsc::UnboundedReceiver<ProcessorMsg<H::Payload>>,
    inbox_tx: mpsc::UnboundedSender<ProcessorMsg<H::Payload>>,
    handler: Arc<H>,
    context: H::Context,
    registry: Registry<H::Payload>,
    producers: Vec<ProducerRef<H::Payload>>,
    links: IndexMap<String, KeyLink<H::Payload>>,
    /// Events received while busy or parked, handled in receipt order.
    stash: VecDeque<(StageId, Message<H::Payload>)>,
    demand: Watermarks,
    stop: CancellationToken,
}

impl<H: Handler> Context<H> {
    async fn run(mut self) {
        self.subscribe_producers();
        let mut tick = tokio::time::interval_at(
            tokio::time::Instant::now() + RESUBSCRIBE_INTERVAL,
            RESUBSCRIBE_INTERVAL,
        );
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            while let Some((from, message)) = self.stash.pop_front() {
                if !self.handle_one(from, message).await {
                    return;
                }
                if self.stop.is_cancelled() {
                    return;
                }
            }

            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return,
                _ = tick.tick() => self.subscribe_producers(),
                msg = self.inbox.recv() => match msg {
                    None => return,
                    Some(ProcessorMsg::Events { from, batch }) => {
                        for message in batch {
                            self.stash.push_back((from.clone(), message));
                        }
                    }
                    Some(ProcessorMsg::BatcherSubscribe { key, batcher, events, demand }) => {
                        self.install_link(key, batcher, events, demand);
                    }
                    Some(ProcessorMsg::BatcherDemand { key, batcher, n }) => {
                        self.credit_link(&key, &batcher, n);
                    }
                    Some(ProcessorMsg::Kill) => {
                        warn!(stage = %self.id, "killed");
                        return;
                    }
                }
            }
        }
    }

    /// Returns false when this worker must crash.
    async fn handle_one(&mut self, from: StageId, mut message: Message<H::Payload>) -> bool {
        message.set_processor(self.id.clone());
        let message = match self.handler.handle_message(message, &self.context).await {
            Ok(message) => message,
            Err(error) => {
                error!(stage = %self.id, error = %error, "handle_message failed");
                return false;
            }
        };

        let key = message.publisher().to_owned();
        if !self.links.contains_key(&key) {
            error!(
                stage = %self.id,
                publisher = %key,
                "message routed to an undeclared destination"
            );
            return false;
        }
        if !self.deliver(&key, message).await {
            return false;
        }

        // only now has the event really left this worker
        if let Some(upstream) = self.producers.iter_mut().find(|r| r.name == from.name) {
            if let Some(n) = upstream.gauge.note_handled(1) {
                let delivered = match &upstream.tx {
                    Some(tx) => tx
                        .send(ProducerMsg::Demand { id: self.id.clone(), n })
                        .is_ok(),
                    None => false,
                };
                if !delivered {
                    upstream.tx = None;
                }
            }
        }
        true
    }

    /// Queue `message` for its batcher and wait until it is accepted.
    /// While parked, events pile into the stash and upstream credit is
    /// withheld. Returns false when this worker must crash.
    async fn deliver(&mut self, key: &str, message: Message<H::Payload>) -> bool {
        let Some(link) = self.links.get_mut(key) else {
            return false;
        };
        link.pending.push_back(message);
        flush_link(&self.id, link);

        loop {
            let done = self
                .links
                .get(key)
                .map_or(true, |link| link.pending.is_empty());
            if done {
                return true;
            }

            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return true,
                msg = self.inbox.recv() => match msg {
                    None => return false,
                    Some(ProcessorMsg::Events { from, batch }) => {
                        for message in batch {
                            self.stash.push_back((from.clone(), message));
                        }
                    }
                    Some(ProcessorMsg::BatcherSubscribe { key, batcher, events, demand }) => {
                        self.install_link(key, batcher, events, demand);
                    }
                    Some(ProcessorMsg::BatcherDemand { key, batcher, n }) => {
                        self.credit_link(&key, &batcher, n);
                    }
                    Some(ProcessorMsg::Kill) => {
                        warn!(stage = %self.id, "killed");
                        return false;
                    }
                }
            }
        }
    }

    fn install_link(
        &mut self,
        key: PublisherKey,
        batcher: StageId,
        events: mpsc::UnboundedSender<BatcherMsg<H::Payload>>,
        demand: usize,
    ) {
        match self.links.get_mut(&key) {
            Some(link) => {
                debug!(stage = %self.id, batcher = %batcher, key = %key, "batcher subscribed");
                link.target = Some((batcher, events));
                link.credit = demand;
                flush_link(&self.id, link);
            }
            None => {
                warn!(stage = %self.id, key = %key, "subscribe for undeclared destination");
            }
        }
    }

    fn credit_link(&mut self, key: &str, batcher: &StageId, n: usize) {
        if let Some(link) = self.links.get_mut(key) {
            // stale grants from a dead incarnation credit nobody
            if link.target.as_ref().is_some_and(|(id, _)| id == batcher) {
                link.credit += n;
                flush_link(&self.id, link);
            }
        }
    }

    /// (Re)subscribe to every producer whose link is down, once its
    /// name resolves to a fresh incarnation.
    fn subscribe_producers(&mut self) {
        for upstream in self.producers.iter_mut() {
            let alive = upstream.tx.as_ref().is_some_and(|tx| !tx.is_closed());
            if alive {
                continue;
            }
            upstream.tx = None;
            let Some((pid, tx)) = self.registry.producer(&upstream.name) else {
                continue;
            };
            if pid.incarnation == upstream.incarnation || tx.is_closed() {
                continue;
            }
            let gauge = DemandGauge::new(self.demand.min, self.demand.max);
            let subscribed = tx
                .send(ProducerMsg::Subscribe {
                    id: self.id.clone(),
                    events: self.inbox_tx.clone(),
                    demand: gauge.initial(),
                })
                .is_ok();
            if subscribed {
                debug!(stage = %self.id, producer = %pid, "subscribed to producer");
                upstream.incarnation = pid.incarnation;
                upstream.tx = Some(tx);
                upstream.gauge = gauge;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn spec<H: Handler>(
    name: String,
    registry: Registry<H::Payload>,
    handler: Arc<H>,
    context: H::Context,
    producer_names: Arc<Vec<String>>,
    keys: Arc<Vec<String>>,
    demand: Watermarks,
) -> ChildSpec {
    ChildSpec {
        name: name.clone(),
        start: Arc::new(move |stop: CancellationToken| {
            let (inbox_tx, inbox) = mpsc::unbounded_channel();
            let id = registry.register(&name, Endpoint::Processor(inbox_tx.clone()));
            let ctx = Context {
                id,
                inbox,
                inbox_tx,
                handler: handler.clone(),
                context: context.clone(),
                registry: registry.clone(),
                producers: producer_names
                    .iter()
                    .map(|name| ProducerRef {
                        name: name.clone(),
                        incarnation: 0,
                        tx: None,
                        gauge: DemandGauge::new(demand.min, demand.max),
                    })
                    .collect(),
                links: keys
                    .iter()
                    .map(|key| {
                        (
                            key.clone(),
                            KeyLink {
                                target: None,
                                credit: 0,
                                pending: VecDeque::new(),
                            },
                        )
                    })
                    .collect(),
                stash: VecDeque::new(),
                demand,
                stop,
            };
            Box::pin(ctx.run())
        }),
    }
}
