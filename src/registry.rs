use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use indexmap::IndexMap;
use tokio::sync::mpsc;

use crate::batcher::BatcherMsg;
use crate::consumer::ConsumerMsg;
use crate::message::StageId;
use crate::processor::ProcessorMsg;
use crate::producer::ProducerMsg;

/// Control-channel handle of one live stage, by kind.
pub(crate) enum Endpoint<T> {
    Producer(mpsc::UnboundedSender<ProducerMsg<T>>),
    Processor(mpsc::UnboundedSender<ProcessorMsg<T>>),
    Batcher(mpsc::UnboundedSender<BatcherMsg<T>>),
    Consumer(mpsc::UnboundedSender<ConsumerMsg<T>>),
}

impl<T> Clone for Endpoint<T> {
    fn clone(&self) -> Self {
        match self {
            Endpoint::Producer(tx) => Endpoint::Producer(tx.clone()),
            Endpoint::Processor(tx) => Endpoint::Processor(tx.clone()),
            Endpoint::Batcher(tx) => Endpoint::Batcher(tx.clone()),
            Endpoint::Consumer(tx) => Endpoint::Consumer(tx.clone()),
        }
    }
}

struct StageCell<T> {
    id: StageId,
    endpoint: Endpoint<T>,
}

/// Per-topology name table: stage name to the currently live
/// incarnation and its control channel.
///
/// Every spawn (initial or restart) registers under the stable derived
/// name with a fresh incarnation, replacing whatever was there, so
/// subscribers can always reach the *current* holder of a name and
/// tests can observe identity changes across restarts.
pub(crate) struct Registry<T> {
    stages: Arc<RwLock<IndexMap<String, StageCell<T>>>>,
    incarnations: Arc<AtomicU64>,
}

impl<T> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Registry {
            stages: self.stages.clone(),
            incarnations: self.incarnations.clone(),
        }
    }
}

impl<T: Send + 'static> Registry<T> {
    pub(crate) fn new() -> Self {
        Registry {
            stages: Arc::new(RwLock::new(IndexMap::new())),
            incarnations: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Claim `name` for a fresh incarnation and return its identity.
    pub(crate) fn register(&self, name: &str, endpoint: Endpoint<T>) -> StageId {
        let id = StageId {
            name: name.to_owned(),
            incarnation: self.incarnations.fetch_add(1, Ordering::Relaxed),
        };
        let mut stages = self.stages.write().expect("registry poisoned");
        stages.insert(name.to_owned(), StageCell { id: id.clone(), endpoint });
        id
    }

    pub(crate) fn whereis(&self, name: &str) -> Option<StageId> {
        let stages = self.stages.read().expect("registry poisoned");
        stages.get(name).map(|cell| cell.id.clone())
    }

    pub(crate) fn names(&self) -> Vec<String> {
        let stages = self.stages.read().expect("registry poisoned");
        stages.keys().cloned().collect()
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        let stages = self.stages.read().expect("registry poisoned");
        stages.contains_key(name)
    }

    fn lookup(&self, name: &str) -> Option<(StageId, Endpoint<T>)> {
        let stages = self.stages.read().expect("registry poisoned");
        stages
            .get(name)
            .map(|cell| (cell.id.clone(), cell.endpoint.clone()))
    }

    pub(crate) fn producer(
        &self,
        name: &str,
    ) -> Option<(StageId, mpsc::UnboundedSender<ProducerMsg<T>>)> {
        match self.lookup(name)? {
            (id, Endpoint::Producer(tx)) => Some((id, tx)),
            _ => None,
        }
    }

    pub(crate) fn processor(
        &self,
        name: &str,
    ) -> Option<(StageId, mpsc::UnboundedSender<ProcessorMsg<T>>)> {
        match self.lookup(name)? {
            (id, Endpoint::Processor(tx)) => Some((id, tx)),
            _ => None,
        }
    }

    pub(crate) fn batcher(
        &self,
        name: &str,
    ) -> Option<(StageId, mpsc::UnboundedSender<BatcherMsg<T>>)> {
        match self.lookup(name)? {
            (id, Endpoint::Batcher(tx)) => Some((id, tx)),
            _ => None,
        }
    }

    /// Deliver a kill to whatever currently holds `name`. Returns false
    /// when the name is unknown or its holder is already gone.
    pub(crate) fn kill(&self, name: &str) -> bool {
        let Some((_, endpoint)) = self.lookup(name) else {
            return false;
        };
        match endpoint {
            Endpoint::Producer(tx) => tx.send(ProducerMsg::Kill).is_ok(),
            Endpoint::Processor(tx) => tx.send(ProcessorMsg::Kill).is_ok(),
            Endpoint::Batcher(tx) => tx.send(BatcherMsg::Kill).is_ok(),
            Endpoint::Consumer(tx) => tx.send(ConsumerMsg::Kill).is_ok(),
        }
    }
}
