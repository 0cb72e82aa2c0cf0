use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::batcher::BatcherMsg;
use crate::config::{CONSUMER_MAX_DEMAND, CONSUMER_MIN_DEMAND, RESUBSCRIBE_INTERVAL};
use crate::demand::DemandGauge;
use crate::handler::Handler;
use crate::message::{Ack, AckHandler, BatchInfo, Message, StageId};
use crate::registry::{Endpoint, Registry};
use crate::supervisor::ChildSpec;

pub(crate) enum ConsumerMsg<T> {
    Batch {
        messages: Vec<Message<T>>,
        info: BatchInfo,
    },
    Kill,
}

/// Split an [`Ack`] into maximal contiguous runs of messages sharing
/// one acknowledger, in the order the batch was delivered, so each
/// handler is called exactly once per run with its successful and
/// failed sublists.
fn ack_runs<T>(
    ack: Ack<T>,
) -> Vec<(Arc<dyn AckHandler<T>>, Vec<Message<T>>, Vec<Message<T>>)> {
    let mut tagged: Vec<(bool, Message<T>)> = ack
        .successful
        .into_iter()
        .map(|message| (true, message))
        .chain(ack.failed.into_iter().map(|message| (false, message)))
        .collect();
    tagged.sort_by_key(|(_, message)| message.batch_seq());

    let mut runs: Vec<(Arc<dyn AckHandler<T>>, Vec<Message<T>>, Vec<Message<T>>)> =
        Vec::new();
    for (successful, message) in tagged {
        let same_run = runs
            .last()
            .map_or(false, |(handler, _, _)| Arc::ptr_eq(handler, message.acknowledger()));
        if !same_run {
            runs.push((message.acknowledger().clone(), Vec::new(), Vec::new()));
        }
        if let Some((_, ok, failed)) = runs.last_mut() {
            if successful {
                ok.push(message);
            } else {
                failed.push(message);
            }
        }
    }
    runs
}

/// One consumer worker: takes one batch at a time from its key's
/// batcher, runs the user's `handle_batch`, then drives
/// acknowledgement. A failing callback crashes only this worker.
pub(crate) struct Context<H: Handler> {
    id: StageId,
    inbox: mpsc::UnboundedReceiver<ConsumerMsg<H::Payload>>,
    inbox_tx: mpsc::UnboundedSender<ConsumerMsg<H::Payload>>,
    handler: Arc<H>,
    context: H::Context,
    registry: Registry<H::Payload>,
    batcher_name: String,
    batcher: Option<mpsc::UnboundedSender<BatcherMsg<H::Payload>>>,
    /// Incarnation last subscribed to; 0 = never.
    incarnation: u64,
    gauge: DemandGauge,
    stop: CancellationToken,
}

impl<H: Handler> Context<H> {
    async fn run(mut self) {
        self.subscribe();
        let mut tick = tokio::time::interval_at(
            tokio::time::Instant::now() + RESUBSCRIBE_INTERVAL,
            RESUBSCRIBE_INTERVAL,
        );
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return,
                _ = tick.tick() => self.subscribe(),
                msg = self.inbox.recv() => match msg {
                    None => return,
                    Some(ConsumerMsg::Batch { messages, info }) => {
                        if !self.handle(messages, info).await {
                            return;
                        }
                    }
                    Some(ConsumerMsg::Kill) => {
                        warn!(stage = %self.id, "killed");
                        return;
                    }
                }
            }
        }
    }

    /// Returns false when this worker must crash.
    async fn handle(&mut self, messages: Vec<Message<H::Payload>>, info: BatchInfo) -> bool {
        let ack = match self
            .handler
            .handle_batch(&info.publisher, messages, &info, &self.context)
            .await
        {
            Ok(ack) => ack,
            Err(error) => {
                error!(stage = %self.id, error = %error, "handle_batch failed");
                return false;
            }
        };

        for (handler, successful, failed) in ack_runs(ack) {
            handler.ack(successful, failed).await;
        }

        if let Some(n) = self.gauge.note_handled(1) {
            let delivered = match &self.batcher {
                Some(tx) => tx
                    .send(BatcherMsg::ConsumerDemand { id: self.id.clone(), n })
                    .is_ok(),
                None => false,
            };
            if !delivered {
                self.batcher = None;
            }
        }
        true
    }

    fn subscribe(&mut self) {
        let alive = self.batcher.as_ref().is_some_and(|tx| !tx.is_closed());
        if alive {
            return;
        }
        self.batcher = None;
        let Some((bid, tx)) = self.registry.batcher(&self.batcher_name) else {
            return;
        };
        if bid.incarnation == self.incarnation || tx.is_closed() {
            return;
        }
        let gauge = DemandGauge::new(CONSUMER_MIN_DEMAND, CONSUMER_MAX_DEMAND);
        let subscribed = tx
            .send(BatcherMsg::ConsumerSubscribe {
                id: self.id.clone(),
                events: self.inbox_tx.clone(),
                demand: gauge.initial(),
            })
            .is_ok();
        if subscribed {
            debug!(stage = %self.id, batcher = %bid, "subscribed to batcher");
            self.incarnation = bid.incarnation;
            self.batcher = Some(tx);
            self.gauge = gauge;
        }
    }
}

pub(crate) fn spec<H: Handler>(
    name: String,
    batcher_name: String,
    registry: Registry<H::Payload>,
    handler: Arc<H>,
    context: H::Context,
) -> ChildSpec {
    ChildSpec {
        name: name.clone(),
        start: Arc::new(move |stop: CancellationToken| {
            let (inbox_tx, inbox) = mpsc::unbounded_channel();
            let id = registry.register(&name, Endpoint::Consumer(inbox_tx.clone()));
            let ctx = Context {
                id,
                inbox,
                inbox_tx,
                handler: handler.clone(),
                context: context.clone(),
                registry: registry.clone(),
                batcher_name: batcher_name.clone(),
                batcher: None,
                incarnation: 0,
                gauge: DemandGauge::new(CONSUMER_MIN_DEMAND, CONSUMER_MAX_DEMAND),
                stop,
            };
            Box::pin(ctx.run())
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct RecordingAck {
        label: &'static str,
        calls: Arc<Mutex<Vec<(&'static str, Vec<u64>, Vec<u64>)>>>,
    }

    #[async_trait]
    impl AckHandler<u64> for RecordingAck {
        async fn ack(&self, successful: Vec<Message<u64>>, failed: Vec<Message<u64>>) {
            let ok: Vec<u64> = successful.iter().map(|m| *m.data()).collect();
            let bad: Vec<u64> = failed.iter().map(|m| *m.data()).collect();
            self.calls.lock().unwrap().push((self.label, ok, bad));
        }
    }

    fn message(data: u64, seq: u64, ack: &Arc<RecordingAck>) -> Message<u64> {
        let mut message =
            Message::new(data, ack.clone() as Arc<dyn AckHandler<u64>>);
        message.set_batch_seq(seq);
        message
    }

    #[test]
    fn one_run_per_contiguous_acknowledger() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let a = Arc::new(RecordingAck { label: "a", calls: calls.clone() });
        let b = Arc::new(RecordingAck { label: "b", calls: calls.clone() });

        // delivered order: a a b b a — three runs even though only two handlers
        let ack = Ack::new(
            vec![message(1, 0, &a), message(3, 2, &b), message(5, 4, &a)],
            vec![message(2, 1, &a), message(4, 3, &b)],
        );

        let runs = ack_runs(ack);
        assert_eq!(runs.len(), 3);
        let shapes: Vec<(Vec<u64>, Vec<u64>)> = runs
            .iter()
            .map(|(_, ok, bad)| {
                (
                    ok.iter().map(|m| *m.data()).collect(),
                    bad.iter().map(|m| *m.data()).collect(),
                )
            })
            .collect();
        assert_eq!(
            shapes,
            vec![
                (vec![1], vec![2]),
                (vec![3], vec![4]),
                (vec![5], vec![]),
            ]
        );
    }

    #[test]
    fn single_source_batch_is_one_call() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let a = Arc::new(RecordingAck { label: "a", calls });

        let ack = Ack::all_successful(vec![
            message(1, 0, &a),
            message(2, 1, &a),
            message(3, 2, &a),
        ]);
        let runs = ack_runs(ack);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].1.len(), 3);
        assert!(runs[0].2.is_empty());
    }
}
