#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use skyway::{
    async_trait, Ack, AckHandler, BatchInfo, Handler, HandlerError, Message,
    ProducerDriver, StageId,
};

/// Emits an inclusive range on demand, then idles forever.
pub struct RangeDriver {
    next: i64,
    end: i64,
    ack: Arc<dyn AckHandler<i64>>,
}

impl RangeDriver {
    pub fn new(range: std::ops::RangeInclusive<i64>, ack: Arc<dyn AckHandler<i64>>) -> Self {
        RangeDriver {
            next: *range.start(),
            end: *range.end(),
            ack,
        }
    }
}

#[async_trait]
impl ProducerDriver for RangeDriver {
    type Payload = i64;

    async fn handle_demand(&mut self, demand: usize) -> Vec<Message<i64>> {
        if self.next > self.end {
            std::future::pending::<()>().await;
        }
        let take = demand.min((self.end - self.next + 1) as usize);
        let mut out = Vec::with_capacity(take);
        for _ in 0..take {
            out.push(Message::new(self.next, self.ack.clone()));
            self.next += 1;
        }
        out
    }
}

/// Never produces anything on its own; for injection-driven tests.
pub struct IdleDriver;

#[async_trait]
impl ProducerDriver for IdleDriver {
    type Payload = i64;

    async fn handle_demand(&mut self, _demand: usize) -> Vec<Message<i64>> {
        std::future::pending::<()>().await;
        Vec::new()
    }
}

/// Records every acknowledgement call it receives.
#[derive(Default)]
pub struct CollectingAck {
    calls: Mutex<Vec<(Vec<i64>, Vec<i64>)>>,
}

#[async_trait]
impl AckHandler<i64> for CollectingAck {
    async fn ack(&self, successful: Vec<Message<i64>>, failed: Vec<Message<i64>>) {
        let ok: Vec<i64> = successful.iter().map(|m| *m.data()).collect();
        let bad: Vec<i64> = failed.iter().map(|m| *m.data()).collect();
        self.calls.lock().unwrap().push((ok, bad));
    }
}

impl CollectingAck {
    pub fn calls(&self) -> Vec<(Vec<i64>, Vec<i64>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn successful(&self) -> Vec<i64> {
        self.calls().into_iter().flat_map(|(ok, _)| ok).collect()
    }

    pub fn failed(&self) -> Vec<i64> {
        self.calls().into_iter().flat_map(|(_, bad)| bad).collect()
    }
}

#[derive(Clone, Debug)]
pub struct BatchRecord {
    pub publisher: String,
    pub batcher: StageId,
    pub data: Vec<i64>,
}

/// Batch log shared between a handler and the test body.
#[derive(Default)]
pub struct Batches(Mutex<Vec<BatchRecord>>);

impl Batches {
    pub fn record(&self, publisher: &str, info: &BatchInfo, data: Vec<i64>) {
        self.0.lock().unwrap().push(BatchRecord {
            publisher: publisher.to_owned(),
            batcher: info.batcher.clone(),
            data,
        });
    }

    pub fn all(&self) -> Vec<BatchRecord> {
        self.0.lock().unwrap().clone()
    }

    pub fn for_publisher(&self, key: &str) -> Vec<Vec<i64>> {
        self.all()
            .into_iter()
            .filter(|r| r.publisher == key)
            .map(|r| r.data)
            .collect()
    }

    /// Messages seen across all batches.
    pub fn total(&self) -> usize {
        self.all().iter().map(|r| r.data.len()).sum()
    }
}

/// Leaves messages untouched and records the batches they arrive in.
pub struct PassThrough {
    pub batches: Arc<Batches>,
}

#[async_trait]
impl Handler for PassThrough {
    type Payload = i64;
    type Context = ();

    async fn handle_message(
        &self,
        message: Message<i64>,
        _context: &(),
    ) -> Result<Message<i64>, HandlerError> {
        Ok(message)
    }

    async fn handle_batch(
        &self,
        publisher: &str,
        messages: Vec<Message<i64>>,
        info: &BatchInfo,
        _context: &(),
    ) -> Result<Ack<i64>, HandlerError> {
        self.batches
            .record(publisher, info, messages.iter().map(|m| *m.data()).collect());
        Ok(Ack::all_successful(messages))
    }
}

/// Route stage logs into the test harness output. Safe to call from
/// every test; only the first call installs the subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
