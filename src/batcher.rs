use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{Watermarks, RESUBSCRIBE_INTERVAL};
use crate::demand::DemandGauge;
use crate::dispatcher::BatchDispatcher;
use crate::message::{BatchInfo, Message, PublisherKey, StageId};
use crate::processor::ProcessorMsg;
use crate::registry::{Endpoint, Registry};
use crate::supervisor::ChildSpec;

pub(crate) enum BatcherMsg<T> {
    /// Messages a processor routed to this batcher's key.
    Events { from: StageId, batch: Vec<Message<T>> },
    /// A consumer registering itself, with its initial credit.
    ConsumerSubscribe {
        id: StageId,
        events: mpsc::UnboundedSender<crate::consumer::ConsumerMsg<T>>,
        demand: usize,
    },
    /// Credit replenishment from a consumer.
    ConsumerDemand { id: StageId, n: usize },
    Kill,
}

struct ProcessorSub<T> {
    id: StageId,
    tx: mpsc::UnboundedSender<ProcessorMsg<T>>,
    gauge: DemandGauge,
}

/// One batcher per destination key. Accumulates routed messages into
/// `pending`, emits a full batch whenever `batch_size` is reached and a
/// partial one on every `batch_timeout` tick, and keeps its processor
/// subscriptions alive across processor restarts (`refs` holds the
/// live ones, `failed` the ones awaiting a retry).
pub(crate) struct Context<T> {
    id: StageId,
    key: PublisherKey,
    inbox: mpsc::UnboundedReceiver<BatcherMsg<T>>,
    inbox_tx: mpsc::UnboundedSender<BatcherMsg<T>>,
    registry: Registry<T>,
    processor_names: Arc<Vec<String>>,
    refs: IndexMap<String, ProcessorSub<T>>,
    /// name -> incarnation that dropped; retried until a fresh one shows up
    failed: IndexMap<String, u64>,
    pending: Vec<Message<T>>,
    seq: u64,
    batch_size: usize,
    batch_timeout: Duration,
    demand: Watermarks,
    consumers: BatchDispatcher<T>,
    /// Batches emitted but not yet accepted by any consumer.
    out_pending: VecDeque<(Vec<Message<T>>, BatchInfo)>,
    /// Upstream grants withheld while `out_pending` is backed up.
    owed: IndexMap<String, usize>,
    stop: CancellationToken,
}

impl<T: Send + 'static> Context<T> {
    async fn run(mut self) {
        for name in self.processor_names.iter() {
            self.failed.insert(name.clone(), 0);
        }
        self.resubscribe();

        let mut flush = tokio::time::interval_at(
            tokio::time::Instant::now() + self.batch_timeout,
            self.batch_timeout,
        );
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut resub = tokio::time::interval_at(
            tokio::time::Instant::now() + RESUBSCRIBE_INTERVAL,
            RESUBSCRIBE_INTERVAL,
        );
        resub.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    // hand the partial batch over if someone still takes it
                    if !self.pending.is_empty() {
                        let batch: Vec<Message<T>> = self.pending.drain(..).collect();
                        self.emit(batch);
                    }
                    return;
                }
                _ = flush.tick() => {
                    if !self.pending.is_empty() {
                        let batch: Vec<Message<T>> = self.pending.drain(..).collect();
                        self.emit(batch);
                    }
                }
                _ = resub.tick() => self.link_check(),
                msg = self.inbox.recv() => match msg {
                    None => return,
                    Some(BatcherMsg::Events { from, batch }) => self.on_events(from, batch),
                    Some(BatcherMsg::ConsumerSubscribe { id, events, demand }) => {
                        debug!(stage = %self.id, consumer = %id, "consumer subscribed");
                        self.consumers.subscribe(id, events, demand);
                        self.flush_out();
                    }
                    Some(BatcherMsg::ConsumerDemand { id, n }) => {
                        self.consumers.grant(&id, n);
                        self.flush_out();
                    }
                    Some(BatcherMsg::Kill) => {
                        warn!(stage = %self.id, "killed");
                        return;
                    }
                }
            }
        }
    }

    fn on_events(&mut self, from: StageId, batch: Vec<Message<T>>) {
        let count = batch.len();
        for mut message in batch {
            message.set_batch_seq(self.seq);
            self.seq += 1;
            self.pending.push(message);
        }
        while self.pending.len() >= self.batch_size {
            let batch: Vec<Message<T>> = self.pending.drain(..self.batch_size).collect();
            self.emit(batch);
        }

        let mut drop_ref = false;
        if let Some(upstream) = self.refs.get_mut(&from.name) {
            if let Some(n) = upstream.gauge.note_handled(count) {
                if self.out_pending.is_empty() {
                    let grant = ProcessorMsg::BatcherDemand {
                        key: self.key.clone(),
                        batcher: self.id.clone(),
                        n,
                    };
                    drop_ref = upstream.tx.send(grant).is_err();
                } else {
                    *self.owed.entry(from.name.clone()).or_insert(0) += n;
                }
            }
        }
        if drop_ref {
            self.fail_ref(&from.name);
        }
    }

    fn emit(&mut self, batch: Vec<Message<T>>) {
        let info = BatchInfo {
            publisher: self.key.clone(),
            batcher: self.id.clone(),
        };
        self.out_pending.push_back((batch, info));
        self.flush_out();
    }

    fn flush_out(&mut self) {
        while let Some((batch, info)) = self.out_pending.pop_front() {
            if let Err(returned) = self.consumers.dispatch(batch, info) {
                self.out_pending.push_front(returned);
                break;
            }
        }
        if self.out_pending.is_empty() {
            self.flush_owed();
        }
    }

    fn flush_owed(&mut self) {
        let owed = std::mem::take(&mut self.owed);
        for (name, n) in owed {
            let mut drop_ref = false;
            if let Some(upstream) = self.refs.get(&name) {
                let grant = ProcessorMsg::BatcherDemand {
                    key: self.key.clone(),
                    batcher: self.id.clone(),
                    n,
                };
                drop_ref = upstream.tx.send(grant).is_err();
            }
            if drop_ref {
                self.fail_ref(&name);
            }
        }
    }

    fn fail_ref(&mut self, name: &str) {
        if let Some(upstream) = self.refs.shift_remove(name) {
            debug!(stage = %self.id, processor = %upstream.id, "subscription dropped");
            self.failed.insert(name.to_owned(), upstream.id.incarnation);
        }
    }

    /// Detect dropped processor links and retry the failed ones.
    fn link_check(&mut self) {
        let dropped: Vec<String> = self
            .refs
            .iter()
            .filter(|(_, sub)| sub.tx.is_closed())
            .map(|(name, _)| name.clone())
            .collect();
        for name in dropped {
            self.fail_ref(&name);
        }
        if !self.failed.is_empty() {
            self.resubscribe();
        }
    }

    fn resubscribe(&mut self) {
        let retry: Vec<(String, u64)> = self
            .failed
            .iter()
            .map(|(name, incarnation)| (name.clone(), *incarnation))
            .collect();
        for (name, dead_incarnation) in retry {
            let Some((pid, tx)) = self.registry.processor(&name) else {
                continue;
            };
            if pid.incarnation == dead_incarnation || tx.is_closed() {
                continue;
            }
            let gauge = DemandGauge::new(self.demand.min, self.demand.max);
            let subscribed = tx
                .send(ProcessorMsg::BatcherSubscribe {
                    key: self.key.clone(),
                    batcher: self.id.clone(),
                    events: self.inbox_tx.clone(),
                    demand: gauge.initial(),
                })
                .is_ok();
            if subscribed {
                debug!(stage = %self.id, processor = %pid, "subscribed to processor");
                self.failed.shift_remove(&name);
                self.refs.insert(name, ProcessorSub { id: pid, tx, gauge });
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn spec<T: Send + 'static>(
    name: String,
    key: PublisherKey,
    registry: Registry<T>,
    processor_names: Arc<Vec<String>>,
    batch_size: usize,
    batch_timeout: Duration,
    demand: Watermarks,
) -> ChildSpec {
    ChildSpec {
        name: name.clone(),
        start: Arc::new(move |stop: CancellationToken| {
            let (inbox_tx, inbox) = mpsc::unbounded_channel();
            let id = registry.register(&name, Endpoint::Batcher(inbox_tx.clone()));
            let ctx = Context {
                id,
                key: key.clone(),
                inbox,
                inbox_tx,
                registry: registry.clone(),
                processor_names: processor_names.clone(),
                refs: IndexMap::new(),
                failed: IndexMap::new(),
                pending: Vec::new(),
                seq: 0,
                batch_size,
                batch_timeout,
                demand,
                consumers: BatchDispatcher::new(),
                out_pending: VecDeque::new(),
                owed: IndexMap::new(),
                stop,
            };
            Box::pin(ctx.run())
        }),
    }
}
