use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_DEMAND: usize = 10;

/// How often a subscriber retries links that dropped.
pub(crate) const RESUBSCRIBE_INTERVAL: Duration = Duration::from_millis(25);

/// Consumers take one batch at a time from their batcher.
pub(crate) const CONSUMER_MAX_DEMAND: usize = 1;
pub(crate) const CONSUMER_MIN_DEMAND: usize = 0;

/// Low/high water marks for one subscription edge.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Watermarks {
    pub min: usize,
    pub max: usize,
}

fn resolve_demand(
    min: Option<usize>,
    max: Option<usize>,
) -> Result<Watermarks, ConfigError> {
    let max = max.unwrap_or(DEFAULT_MAX_DEMAND);
    let min = min.unwrap_or(max / 2);
    if max == 0 || min >= max {
        return Err(ConfigError::InvalidDemand { min, max });
    }
    Ok(Watermarks { min, max })
}

/// Settings for the processor pool. Unset fields fall back to
/// defaults: `stages = 2 * cpu_count`, `max_demand = 10`, `min_demand`
/// half of `max_demand`.
#[derive(Clone, Debug, Default)]
pub struct ProcessorConfig {
    stages: Option<usize>,
    min_demand: Option<usize>,
    max_demand: Option<usize>,
}

impl ProcessorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stages(mut self, stages: usize) -> Self {
        self.stages = Some(stages);
        self
    }

    pub fn min_demand(mut self, min_demand: usize) -> Self {
        self.min_demand = Some(min_demand);
        self
    }

    pub fn max_demand(mut self, max_demand: usize) -> Self {
        self.max_demand = Some(max_demand);
        self
    }

    pub(crate) fn resolve(&self) -> Result<ResolvedProcessors, ConfigError> {
        let stages = self.stages.unwrap_or_else(|| 2 * num_cpus::get());
        if stages == 0 {
            return Err(ConfigError::EmptyPool { stage: "processor" });
        }
        Ok(ResolvedProcessors {
            stages,
            demand: resolve_demand(self.min_demand, self.max_demand)?,
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct ResolvedProcessors {
    pub stages: usize,
    pub demand: Watermarks,
}

/// Settings for one destination key: its batcher and consumer pool.
/// The demand watermarks govern the batcher's subscription to the
/// processors.
#[derive(Clone, Debug, Default)]
pub struct PublisherConfig {
    stages: Option<usize>,
    batch_size: Option<usize>,
    batch_timeout: Option<Duration>,
    min_demand: Option<usize>,
    max_demand: Option<usize>,
}

impl PublisherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of consumer workers for this destination.
    pub fn stages(mut self, stages: usize) -> Self {
        self.stages = Some(stages);
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn batch_timeout(mut self, batch_timeout: Duration) -> Self {
        self.batch_timeout = Some(batch_timeout);
        self
    }

    pub fn min_demand(mut self, min_demand: usize) -> Self {
        self.min_demand = Some(min_demand);
        self
    }

    pub fn max_demand(mut self, max_demand: usize) -> Self {
        self.max_demand = Some(max_demand);
        self
    }

    pub(crate) fn resolve(&self) -> Result<ResolvedPublisher, ConfigError> {
        let stages = self.stages.unwrap_or(1);
        if stages == 0 {
            return Err(ConfigError::EmptyPool { stage: "consumer" });
        }
        let batch_size = self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
        if batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        Ok(ResolvedPublisher {
            stages,
            batch_size,
            batch_timeout: self.batch_timeout.unwrap_or(DEFAULT_BATCH_TIMEOUT),
            demand: resolve_demand(self.min_demand, self.max_demand)?,
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct ResolvedPublisher {
    pub stages: usize,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub demand: Watermarks,
}

// Stage names are derivable and stable so callers can locate any stage
// for introspection. The numeric suffix is 1-based and zero-padded to
// the decimal width of the pool size.

fn padded(index: usize, pool: usize) -> String {
    let width = pool.to_string().len();
    format!("{index:0width$}")
}

pub(crate) fn producer_name(
    topology: &str,
    group: &str,
    index: usize,
    pool: usize,
) -> String {
    format!("{topology}.Producer_{group}_{}", padded(index, pool))
}

pub(crate) fn processor_name(topology: &str, index: usize, pool: usize) -> String {
    format!("{topology}.Processor_{}", padded(index, pool))
}

pub(crate) fn batcher_name(topology: &str, key: &str) -> String {
    format!("{topology}.Batcher_{key}")
}

pub(crate) fn consumer_name(
    topology: &str,
    key: &str,
    index: usize,
    pool: usize,
) -> String {
    format!("{topology}.Consumer_{key}_{}", padded(index, pool))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_worker_pools_are_not_padded() {
        assert_eq!(processor_name("t", 1, 1), "t.Processor_1");
        assert_eq!(producer_name("t", "default", 1, 1), "t.Producer_default_1");
    }

    #[test]
    fn padding_follows_pool_width() {
        assert_eq!(processor_name("t", 1, 10), "t.Processor_01");
        assert_eq!(processor_name("t", 10, 10), "t.Processor_10");
        assert_eq!(consumer_name("t", "odd", 7, 120), "t.Consumer_odd_007");
    }

    #[test]
    fn processor_defaults_to_twice_cpu_count() {
        let resolved = ProcessorConfig::new().resolve().unwrap();
        assert_eq!(resolved.stages, 2 * num_cpus::get());
        assert_eq!(resolved.demand.max, DEFAULT_MAX_DEMAND);
        assert_eq!(resolved.demand.min, DEFAULT_MAX_DEMAND / 2);
    }

    #[test]
    fn min_demand_defaults_to_half_of_max() {
        let resolved = ProcessorConfig::new().max_demand(2).resolve().unwrap();
        assert_eq!(resolved.demand.min, 1);
        assert_eq!(resolved.demand.max, 2);
    }

    #[test]
    fn inverted_watermarks_are_rejected() {
        let err = ProcessorConfig::new()
            .min_demand(10)
            .max_demand(10)
            .resolve()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDemand { min: 10, max: 10 }));
    }

    #[test]
    fn publisher_defaults() {
        let resolved = PublisherConfig::new().resolve().unwrap();
        assert_eq!(resolved.stages, 1);
        assert_eq!(resolved.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(resolved.batch_timeout, DEFAULT_BATCH_TIMEOUT);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err = PublisherConfig::new().batch_size(0).resolve().unwrap_err();
        assert!(matches!(err, ConfigError::ZeroBatchSize));
    }
}
