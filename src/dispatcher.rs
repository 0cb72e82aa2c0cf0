use std::collections::VecDeque;

use indexmap::IndexMap;
use tokio::sync::mpsc;

use crate::consumer::ConsumerMsg;
use crate::message::{BatchInfo, Message, StageId};
use crate::processor::ProcessorMsg;

struct Subscriber<S> {
    id: StageId,
    tx: S,
    credit: usize,
}

/// Upstream side of the event edge: tracks each subscriber's remaining
/// credit and hands out buffered messages round-robin, never beyond the
/// credit a subscriber granted. Subscribers whose channel has closed
/// are dropped on the spot; a later subscribe under the same name
/// replaces the stale entry.
pub(crate) struct EventDispatcher<T> {
    cursor: usize,
    subscribers: IndexMap<String, Subscriber<mpsc::UnboundedSender<ProcessorMsg<T>>>>,
}

impl<T: Send + 'static> EventDispatcher<T> {
    pub(crate) fn new() -> Self {
        EventDispatcher {
            cursor: 0,
            subscribers: IndexMap::new(),
        }
    }

    pub(crate) fn subscribe(
        &mut self,
        id: StageId,
        tx: mpsc::UnboundedSender<ProcessorMsg<T>>,
        demand: usize,
    ) {
        self.subscribers
            .insert(id.name.clone(), Subscriber { id, tx, credit: demand });
    }

    pub(crate) fn grant(&mut self, id: &StageId, n: usize) {
        if let Some(sub) = self.subscribers.get_mut(&id.name) {
            // a grant from a stale incarnation credits nobody
            if sub.id == *id {
                sub.credit += n;
            }
        }
    }

    pub(crate) fn total_credit(&self) -> usize {
        self.subscribers.values().map(|s| s.credit).sum()
    }

    /// Drain as much of `buffer` as outstanding credit allows.
    /// Whatever cannot be placed stays buffered for the next grant.
    #[inline]
    pub(crate) fn dispatch(&mut self, from: &StageId, buffer: &mut VecDeque<Message<T>>) {
        while !buffer.is_empty() && !self.subscribers.is_empty() {
            let len = self.subscribers.len();
            let Some(offset) = (0..len)
                .find(|k| self.subscribers[(self.cursor + k) % len].credit > 0)
            else {
                return;
            };
            let index = (self.cursor + offset) % len;

            let take = self.subscribers[index].credit.min(buffer.len());
            let chunk: Vec<Message<T>> = buffer.drain(..take).collect();
            let sub = &mut self.subscribers[index];
            match sub.tx.send(ProcessorMsg::Events {
                from: from.clone(),
                batch: chunk,
            }) {
                Ok(()) => {
                    sub.credit -= take;
                    self.cursor = index + 1;
                }
                Err(mpsc::error::SendError(msg)) => {
                    // subscriber is gone; reclaim the chunk
                    if let ProcessorMsg::Events { batch, .. } = msg {
                        for message in batch.into_iter().rev() {
                            buffer.push_front(message);
                        }
                    }
                    self.subscribers.shift_remove_index(index);
                    self.cursor = 0;
                }
            }
        }
    }
}

/// Same discipline for the batcher's downstream edge, where one event
/// is one batch and credit is counted in batches.
pub(crate) struct BatchDispatcher<T> {
    cursor: usize,
    subscribers: IndexMap<String, Subscriber<mpsc::UnboundedSender<ConsumerMsg<T>>>>,
}

impl<T: Send + 'static> BatchDispatcher<T> {
    pub(crate) fn new() -> Self {
        BatchDispatcher {
            cursor: 0,
            subscribers: IndexMap::new(),
        }
    }

    pub(crate) fn subscribe(
        &mut self,
        id: StageId,
        tx: mpsc::UnboundedSender<ConsumerMsg<T>>,
        demand: usize,
    ) {
        self.subscribers
            .insert(id.name.clone(), Subscriber { id, tx, credit: demand });
    }

    pub(crate) fn grant(&mut self, id: &StageId, n: usize) {
        if let Some(sub) = self.subscribers.get_mut(&id.name) {
            if sub.id == *id {
                sub.credit += n;
            }
        }
    }

    /// Hand one batch to the next consumer holding credit. Gives the
    /// batch back when every consumer is out of credit or gone.
    #[inline]
    pub(crate) fn dispatch(
        &mut self,
        messages: Vec<Message<T>>,
        info: BatchInfo,
    ) -> Result<(), (Vec<Message<T>>, BatchInfo)> {
        let mut messages = messages;
        let mut info = info;
        loop {
            if self.subscribers.is_empty() {
                return Err((messages, info));
            }
            let len = self.subscribers.len();
            let Some(offset) = (0..len)
                .find(|k| self.subscribers[(self.cursor + k) % len].credit > 0)
            else {
                return Err((messages, info));
            };
            let index = (self.cursor + offset) % len;

            let sub = &mut self.subscribers[index];
            match sub.tx.send(ConsumerMsg::Batch { messages, info }) {
                Ok(()) => {
                    sub.credit -= 1;
                    self.cursor = index + 1;
                    return Ok(());
                }
                Err(mpsc::error::SendError(ConsumerMsg::Batch {
                    messages: m,
                    info: i,
                })) => {
                    messages = m;
                    info = i;
                    self.subscribers.shift_remove_index(index);
                    self.cursor = 0;
                }
                Err(mpsc::error::SendError(_)) => unreachable!(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn id(name: &str) -> StageId {
        StageId { name: name.to_owned(), incarnation: 1 }
    }

    #[tokio::test]
    async fn dispatch_honors_credit() {
        let mut dispatcher: EventDispatcher<u64> = EventDispatcher::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.subscribe(id("p1"), tx, 2);

        let mut buffer: VecDeque<Message<u64>> =
            (0u64..5).map(Message::unacked).collect();
        dispatcher.dispatch(&id("source"), &mut buffer);

        // two of five placed, the rest wait for a grant
        assert_eq!(buffer.len(), 3);
        let Some(ProcessorMsg::Events { batch, .. }) = rx.recv().await else {
            panic!("expected events");
        };
        assert_eq!(batch.len(), 2);

        dispatcher.grant(&id("p1"), 3);
        dispatcher.dispatch(&id("source"), &mut buffer);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn dead_subscribers_are_removed_and_nothing_is_lost() {
        let mut dispatcher: EventDispatcher<u64> = EventDispatcher::new();
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        drop(dead_rx);
        let (live_tx, mut live_rx) = mpsc::unbounded_channel();
        dispatcher.subscribe(id("dead"), dead_tx, 10);
        dispatcher.subscribe(id("live"), live_tx, 10);

        let mut buffer: VecDeque<Message<u64>> =
            (0u64..4).map(Message::unacked).collect();
        dispatcher.dispatch(&id("source"), &mut buffer);

        assert!(buffer.is_empty());
        let Some(ProcessorMsg::Events { batch, .. }) = live_rx.recv().await else {
            panic!("expected events");
        };
        assert_eq!(
            batch.iter().map(|m| *m.data()).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
    }

    #[test]
    fn batch_dispatch_returns_the_batch_when_out_of_credit() {
        let mut dispatcher: BatchDispatcher<u64> = BatchDispatcher::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        dispatcher.subscribe(id("c1"), tx, 1);

        let info = BatchInfo { publisher: "default".into(), batcher: id("b") };
        let batch = vec![Message::unacked(1)];
        assert!(dispatcher.dispatch(batch, info.clone()).is_ok());

        let starved = dispatcher.dispatch(vec![Message::unacked(2)], info);
        assert!(starved.is_err());
    }
}
