use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{
    batcher_name, consumer_name, processor_name, producer_name, ProcessorConfig,
    PublisherConfig,
};
use crate::error::{ConfigError, FatalError, PushError};
use crate::handler::Handler;
use crate::message::{Message, StageId, DEFAULT_PUBLISHER};
use crate::producer::{DriverFactory, ProducerDriver, ProducerMsg};
use crate::registry::Registry;
use crate::supervisor::{self, RestartIntensity, Strategy, Supervisor};
use crate::{batcher, consumer, processor, producer};

struct ProducerGroup<T> {
    name: String,
    stages: usize,
    factory: DriverFactory<T>,
}

/// Declares one pipeline: its name, the user module and context, one
/// producer group, the processor pool and the destination keys.
/// `start` validates everything, spawns the supervision tree and hands
/// back the running [`Pipeline`].
pub struct Topology<H: Handler> {
    name: String,
    handler: Arc<H>,
    context: H::Context,
    producers: Vec<ProducerGroup<H::Payload>>,
    processors: ProcessorConfig,
    publishers: Vec<(String, PublisherConfig)>,
    intensity: RestartIntensity,
}

impl<H: Handler> Topology<H> {
    pub fn new(name: impl Into<String>, handler: H, context: H::Context) -> Self {
        Topology {
            name: name.into(),
            handler: Arc::new(handler),
            context,
            producers: Vec::new(),
            processors: ProcessorConfig::default(),
            publishers: Vec::new(),
            intensity: RestartIntensity::default(),
        }
    }

    /// Add a producer group. `factory` builds a fresh driver for every
    /// (re)spawn of a producer stage. Exactly one group is supported.
    pub fn producer<D, F>(mut self, group: &str, stages: usize, factory: F) -> Self
    where
        D: ProducerDriver<Payload = H::Payload>,
        F: Fn() -> D + Send + Sync + 'static,
    {
        self.producers.push(ProducerGroup {
            name: group.to_owned(),
            stages,
            factory: Arc::new(move || {
                Box::new(factory()) as Box<dyn ProducerDriver<Payload = H::Payload>>
            }),
        });
        self
    }

    pub fn processors(mut self, config: ProcessorConfig) -> Self {
        self.processors = config;
        self
    }

    /// Declare a destination key. Without any, a single `default`
    /// destination exists.
    pub fn publisher(mut self, key: &str, config: PublisherConfig) -> Self {
        self.publishers.push((key.to_owned(), config));
        self
    }

    /// Abnormal child exits tolerated per supervisor before it gives up.
    pub fn max_restarts(mut self, max_restarts: usize) -> Self {
        self.intensity.max_restarts = max_restarts;
        self
    }

    pub fn restart_window(mut self, window: Duration) -> Self {
        self.intensity.window = window;
        self
    }

    pub async fn start(self) -> Result<Pipeline<H::Payload>, ConfigError> {
        // configuration errors surface here; nothing is spawned first
        if self.producers.is_empty() {
            return Err(ConfigError::MissingProducer);
        }
        if self.producers.len() > 1 {
            return Err(ConfigError::MultipleProducerGroups {
                count: self.producers.len(),
            });
        }
        let group = match self.producers.into_iter().next() {
            Some(group) => group,
            None => return Err(ConfigError::MissingProducer),
        };
        if group.stages == 0 {
            return Err(ConfigError::EmptyPool { stage: "producer" });
        }
        let processors = self.processors.resolve()?;

        let mut publishers = self.publishers;
        if publishers.is_empty() {
            publishers.push((DEFAULT_PUBLISHER.to_owned(), PublisherConfig::default()));
        }
        let mut seen: HashSet<&str> = HashSet::new();
        for (key, _) in &publishers {
            if key.is_empty() {
                return Err(ConfigError::EmptyPublisherKey);
            }
            if !seen.insert(key) {
                return Err(ConfigError::DuplicatePublisher { key: key.clone() });
            }
        }

        let registry: Registry<H::Payload> = Registry::new();
        let cancel = CancellationToken::new();

        let producer_names: Arc<Vec<String>> = Arc::new(
            (1..=group.stages)
                .map(|i| producer_name(&self.name, &group.name, i, group.stages))
                .collect(),
        );
        let processor_names: Arc<Vec<String>> = Arc::new(
            (1..=processors.stages)
                .map(|i| processor_name(&self.name, i, processors.stages))
                .collect(),
        );
        let keys: Arc<Vec<String>> =
            Arc::new(publishers.iter().map(|(key, _)| key.clone()).collect());

        let producer_specs = producer_names
            .iter()
            .map(|name| producer::spec(name.clone(), registry.clone(), group.factory.clone()))
            .collect();

        let processor_specs = processor_names
            .iter()
            .map(|name| {
                processor::spec::<H>(
                    name.clone(),
                    registry.clone(),
                    self.handler.clone(),
                    self.context.clone(),
                    producer_names.clone(),
                    keys.clone(),
                    processors.demand,
                )
            })
            .collect();

        let mut destination_specs = Vec::with_capacity(publishers.len());
        let mut expected: Vec<String> = Vec::new();
        expected.extend(producer_names.iter().cloned());
        expected.extend(processor_names.iter().cloned());
        for (key, config) in &publishers {
            let resolved = config.resolve()?;
            let bname = batcher_name(&self.name, key);
            let batcher_spec = batcher::spec(
                bname.clone(),
                key.clone(),
                registry.clone(),
                processor_names.clone(),
                resolved.batch_size,
                resolved.batch_timeout,
                resolved.demand,
            );
            let consumer_specs = (1..=resolved.stages)
                .map(|i| {
                    let cname = consumer_name(&self.name, key, i, resolved.stages);
                    expected.push(cname.clone());
                    consumer::spec::<H>(
                        cname,
                        bname.clone(),
                        registry.clone(),
                        self.handler.clone(),
                        self.context.clone(),
                    )
                })
                .collect();
            expected.push(bname);
            let consumer_sup = supervisor::spec(
                format!("{}.ConsumerSupervisor_{key}", self.name),
                Strategy::OneForOne,
                consumer_specs,
                self.intensity,
            );
            destination_specs.push(supervisor::spec(
                format!("{}.DestinationSupervisor_{key}", self.name),
                Strategy::RestForOne,
                vec![batcher_spec, consumer_sup],
                self.intensity,
            ));
        }

        let root = Supervisor::new(
            format!("{}.Supervisor", self.name),
            Strategy::OneForOne,
            vec![
                supervisor::spec(
                    format!("{}.ProducerSupervisor", self.name),
                    Strategy::OneForOne,
                    producer_specs,
                    self.intensity,
                ),
                supervisor::spec(
                    format!("{}.ProcessorSupervisor", self.name),
                    Strategy::OneForAll,
                    processor_specs,
                    self.intensity,
                ),
                supervisor::spec(
                    format!("{}.PublisherSupervisor", self.name),
                    Strategy::OneForOne,
                    destination_specs,
                    self.intensity,
                ),
            ],
            cancel.child_token(),
            self.intensity,
        );
        let root = tokio::spawn(root.run());

        info!(
            topology = %self.name,
            producers = group.stages,
            processors = processors.stages,
            destinations = keys.len(),
            "topology started"
        );

        let pipeline = Pipeline {
            control: PipelineControl {
                name: self.name,
                registry,
            },
            cancel,
            root,
        };
        pipeline.control.await_registered(&expected).await;
        Ok(pipeline)
    }
}

/// Cheap, clonable administrative handle: name lookups, injection and
/// kills. Obtained from [`Pipeline::control`].
pub struct PipelineControl<T> {
    name: String,
    registry: Registry<T>,
}

impl<T> Clone for PipelineControl<T> {
    fn clone(&self) -> Self {
        PipelineControl {
            name: self.name.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl<T: Send + 'static> PipelineControl<T> {
    pub fn topology_name(&self) -> &str {
        &self.name
    }

    /// Current identity of the stage registered under `name`.
    pub fn whereis(&self, name: &str) -> Option<StageId> {
        self.registry.whereis(name)
    }

    /// Names of every stage that has been spawned, in registration order.
    pub fn stage_names(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Inject messages into a producer stage, bypassing its driver.
    /// Resolves once the producer buffered them; they are emitted as
    /// soon as downstream credit allows and are never dropped.
    pub async fn push_messages(
        &self,
        stage: &str,
        messages: Vec<Message<T>>,
    ) -> Result<(), PushError> {
        let Some((_, tx)) = self.registry.producer(stage) else {
            return Err(PushError::UnknownStage { name: stage.to_owned() });
        };
        let (reply, confirmed) = oneshot::channel();
        tx.send(ProducerMsg::Push { messages, reply })
            .map_err(|_| PushError::Unreachable { name: stage.to_owned() })?;
        confirmed
            .await
            .map_err(|_| PushError::Unreachable { name: stage.to_owned() })
    }

    /// Deliver a kill to the current holder of `name`. Its supervisor
    /// treats the exit as a crash and applies the restart strategy.
    pub fn kill_stage(&self, name: &str) -> bool {
        self.registry.kill(name)
    }

    async fn await_registered(&self, expected: &[String]) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if expected.iter().all(|name| self.registry.contains(name)) {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

/// A running topology. Dropping it does not stop the stages; call
/// [`Pipeline::shutdown`] for an ordered stop or [`Pipeline::join`] to
/// watch it until it dies on its own.
pub struct Pipeline<T> {
    control: PipelineControl<T>,
    cancel: CancellationToken,
    root: JoinHandle<Result<(), FatalError>>,
}

impl<T: Send + 'static> Pipeline<T> {
    pub fn control(&self) -> PipelineControl<T> {
        self.control.clone()
    }

    pub fn whereis(&self, name: &str) -> Option<StageId> {
        self.control.whereis(name)
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.control.stage_names()
    }

    pub async fn push_messages(
        &self,
        stage: &str,
        messages: Vec<Message<T>>,
    ) -> Result<(), PushError> {
        self.control.push_messages(stage, messages).await
    }

    pub fn kill_stage(&self, name: &str) -> bool {
        self.control.kill_stage(name)
    }

    /// Ordered stop: every stage drains its current event and exits,
    /// producers get `drain` and `terminate`, and the call returns once
    /// the root supervisor has been observed down. Unbounded; wrap in a
    /// timeout if a bound is needed.
    pub async fn shutdown(self) -> Result<(), FatalError> {
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for the topology to terminate on its own. Returns the
    /// fatal reason when the root supervision tree dies unexpectedly.
    pub async fn join(self) -> Result<(), FatalError> {
        match self.root.await {
            Ok(result) => result,
            Err(_) => Err(FatalError::RootPanic),
        }
    }
}
