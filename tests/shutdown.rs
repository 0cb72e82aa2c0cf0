use std::sync::Arc;
use std::time::Duration;

use skyway::{FatalError, Message, ProcessorConfig, PushError, Topology};

mod common;
use common::{init_tracing, wait_until, Batches, IdleDriver, PassThrough};

#[tokio::test]
async fn graceful_shutdown_takes_the_whole_tree_down() {
    init_tracing();
    let batches = Arc::new(Batches::default());
    let pipeline = Topology::new("stopping", PassThrough { batches: batches.clone() }, ())
        .producer("default", 1, || IdleDriver)
        .start()
        .await
        .unwrap();

    let control = pipeline.control();
    pipeline
        .push_messages(
            "stopping.Producer_default_1",
            vec![Message::unacked(1), Message::unacked(2)],
        )
        .await
        .unwrap();

    // observed down once shutdown returns
    pipeline.shutdown().await.unwrap();

    // nothing is listening any more
    let refused = control
        .push_messages("stopping.Producer_default_1", vec![Message::unacked(3)])
        .await;
    assert!(matches!(refused, Err(PushError::Unreachable { .. })));
}

#[tokio::test]
async fn runaway_crashes_escalate_to_the_owner() {
    init_tracing();
    let batches = Arc::new(Batches::default());
    let pipeline = Topology::new("melting", PassThrough { batches }, ())
        .producer("default", 1, || IdleDriver)
        .processors(ProcessorConfig::new().stages(1))
        .max_restarts(1)
        .start()
        .await
        .unwrap();

    let control = pipeline.control();
    let owner = tokio::spawn(pipeline.join());

    // keep killing the processor until the tree gives up on itself
    let mut attempts = 0;
    while !owner.is_finished() && attempts < 500 {
        control.kill_stage("melting.Processor_1");
        tokio::time::sleep(Duration::from_millis(10)).await;
        attempts += 1;
    }

    let result = owner.await.unwrap();
    assert!(matches!(result, Err(FatalError::Meltdown { .. })));

    // the registry still answers, but every stage is gone
    assert!(wait_until(Duration::from_secs(2), || {
        !control.kill_stage("melting.Processor_1")
    })
    .await);
}
