use std::sync::Arc;
use std::time::Duration;

use skyway::{
    async_trait, Ack, BatchInfo, ConfigError, Handler, HandlerError, Message,
    ProcessorConfig, PublisherConfig, Topology,
};

mod common;
use common::{
    init_tracing, wait_until, Batches, CollectingAck, IdleDriver, PassThrough,
    RangeDriver,
};

fn pass_through() -> PassThrough {
    PassThrough { batches: Arc::new(Batches::default()) }
}

#[tokio::test]
async fn processor_pool_defaults_to_twice_the_cpu_count() {
    init_tracing();
    let pipeline = Topology::new("sizing", pass_through(), ())
        .producer("default", 1, || IdleDriver)
        .start()
        .await
        .unwrap();

    let processors = pipeline
        .stage_names()
        .into_iter()
        .filter(|name| name.starts_with("sizing.Processor_"))
        .count();
    assert_eq!(processors, 2 * num_cpus::get());

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn configured_pool_size_wins_and_names_are_padded_to_its_width() {
    init_tracing();
    let pipeline = Topology::new("pools", pass_through(), ())
        .producer("default", 1, || IdleDriver)
        .processors(ProcessorConfig::new().stages(12))
        .start()
        .await
        .unwrap();

    assert!(pipeline.whereis("pools.Processor_01").is_some());
    assert!(pipeline.whereis("pools.Processor_12").is_some());
    assert!(pipeline.whereis("pools.Processor_1").is_none());

    // single-worker pools carry no padding
    assert!(pipeline.whereis("pools.Producer_default_1").is_some());

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn without_publishers_exactly_one_default_destination_exists() {
    init_tracing();
    let pipeline = Topology::new("plain", pass_through(), ())
        .producer("default", 1, || IdleDriver)
        .start()
        .await
        .unwrap();

    assert!(pipeline.whereis("plain.Batcher_default").is_some());
    assert!(pipeline.whereis("plain.Consumer_default_1").is_some());
    let batchers = pipeline
        .stage_names()
        .into_iter()
        .filter(|name| name.starts_with("plain.Batcher_"))
        .count();
    assert_eq!(batchers, 1);

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn configuration_errors_stop_the_start() {
    init_tracing();
    let missing = Topology::new("bad", pass_through(), ()).start().await;
    assert!(matches!(missing, Err(ConfigError::MissingProducer)));

    let doubled = Topology::new("bad", pass_through(), ())
        .producer("a", 1, || IdleDriver)
        .producer("b", 1, || IdleDriver)
        .start()
        .await;
    assert!(matches!(
        doubled,
        Err(ConfigError::MultipleProducerGroups { count: 2 })
    ));

    let duplicate = Topology::new("bad", pass_through(), ())
        .producer("default", 1, || IdleDriver)
        .publisher("odd", PublisherConfig::new())
        .publisher("odd", PublisherConfig::new())
        .start()
        .await;
    assert!(matches!(
        duplicate,
        Err(ConfigError::DuplicatePublisher { .. })
    ));

    let zero_batch = Topology::new("bad", pass_through(), ())
        .producer("default", 1, || IdleDriver)
        .publisher("odd", PublisherConfig::new().batch_size(0))
        .start()
        .await;
    assert!(matches!(zero_batch, Err(ConfigError::ZeroBatchSize)));

    let inverted = Topology::new("bad", pass_through(), ())
        .producer("default", 1, || IdleDriver)
        .processors(ProcessorConfig::new().min_demand(9).max_demand(3))
        .start()
        .await;
    assert!(matches!(
        inverted,
        Err(ConfigError::InvalidDemand { min: 9, max: 3 })
    ));
}

/// Fails every multiple of three in `handle_batch`.
struct ThirdsFail;

#[async_trait]
impl Handler for ThirdsFail {
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
        _publisher: &str,
        messages: Vec<Message<i64>>,
        _info: &BatchInfo,
        _context: &(),
    ) -> Result<Ack<i64>, HandlerError> {
        let (failed, successful): (Vec<Message<i64>>, Vec<Message<i64>>) =
            messages.into_iter().partition(|m| m.data() % 3 == 0);
        Ok(Ack::new(successful, failed))
    }
}

#[tokio::test]
async fn every_message_is_acknowledged_once_in_the_list_the_handler_chose() {
    init_tracing();
    let ack = Arc::new(CollectingAck::default());

    let driver_ack = ack.clone();
    let pipeline = Topology::new("acking", ThirdsFail, ())
        .producer("default", 1, move || {
            RangeDriver::new(1..=60, driver_ack.clone())
        })
        .publisher(
            "default",
            PublisherConfig::new()
                .batch_size(7)
                .batch_timeout(Duration::from_millis(100)),
        )
        .start()
        .await
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        ack.successful().len() + ack.failed().len() == 60
    })
    .await);

    let mut successful = ack.successful();
    successful.sort_unstable();
    let mut failed = ack.failed();
    failed.sort_unstable();
    assert_eq!(
        successful,
        (1..=60).filter(|v| v % 3 != 0).collect::<Vec<i64>>()
    );
    assert_eq!(failed, (3..=60).step_by(3).collect::<Vec<i64>>());

    pipeline.shutdown().await.unwrap();
}
