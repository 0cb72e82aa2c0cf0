//! Concurrent multi-stage ingestion pipelines.
//!
//! A [`Topology`] wires producers, a processor pool, one batcher per
//! destination key and per-key consumer pools into a supervision tree.
//! Demand flows upstream as credit, data flows downstream against it,
//! and a crashed stage is restarted without taking the rest of the
//! pipeline with it.

/// message & acknowledgement types
mod message;

/// user module contract
mod handler;

/// trait ProducerDriver & producer stage
mod producer;

/// processor pool stage
mod processor;

/// per-destination batcher stage
mod batcher;

/// consumer stage & acknowledgement grouping
mod consumer;

/// credit bookkeeping
mod demand;

/// credit-gated dispatch between stages
mod dispatcher;

/// stage name table
mod registry;

/// restart strategies
mod supervisor;

/// syncing components
mod topology;

/// per-stage configuration
mod config;

/// error types
mod error;

pub use async_trait::async_trait;

pub use config::{
    ProcessorConfig, PublisherConfig, DEFAULT_BATCH_SIZE, DEFAULT_BATCH_TIMEOUT,
    DEFAULT_MAX_DEMAND,
};

pub use error::{ConfigError, FatalError, PushError};

pub use handler::{Handler, HandlerError};

pub use message::{
    Ack, AckHandler, AckState, BatchInfo, Message, NoopAck, PublisherKey, StageId,
    DEFAULT_PUBLISHER,
};

pub use producer::ProducerDriver;

pub use topology::{Pipeline, PipelineControl, Topology};
