use std::time::Duration;

use thiserror::Error;

/// Rejections raised while validating a topology, before any stage is
/// spawned.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("topology requires a producer group")]
    MissingProducer,

    #[error("topology supports exactly one producer group, got {count}")]
    MultipleProducerGroups { count: usize },

    #[error("duplicate destination key `{key}`")]
    DuplicatePublisher { key: String },

    #[error("destination keys cannot be empty strings")]
    EmptyPublisherKey,

    #[error("{stage} pool must have at least one worker")]
    EmptyPool { stage: &'static str },

    #[error("min_demand ({min}) must be lower than max_demand ({max})")]
    InvalidDemand { min: usize, max: usize },

    #[error("batch_size must be at least 1")]
    ZeroBatchSize,
}

/// Failures injecting messages into a running producer stage.
#[derive(Debug, Error)]
pub enum PushError {
    #[error("no producer stage named `{name}`")]
    UnknownStage { name: String },

    #[error("producer stage `{name}` is not accepting messages")]
    Unreachable { name: String },
}

/// Why a supervision tree stopped on its own. Fatal to the topology and
/// surfaced to the owner; everything below this level is recovered by
/// restarts.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error(
        "supervisor {supervisor} gave up: {restarts} restarts within {window:?}"
    )]
    Meltdown {
        supervisor: String,
        restarts: usize,
        window: Duration,
    },

    #[error("root supervisor terminated abnormally")]
    RootPanic,
}
