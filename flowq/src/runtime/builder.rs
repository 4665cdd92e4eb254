use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use crate::backoff::{BackoffStrategy, Backoffs};
use crate::queue::Queue;
use crate::store::Store;

use super::processor::Processor;
use super::supervisor::Worker;
use super::worker::WorkerConfig;

/// Builder for a [`Worker`] with explicit dependencies.
///
/// The queue and the processor are required; custom backoff strategies are
/// optional.
///
/// # Example
///
/// ```ignore
/// use flowq::runtime::{WorkerBuilder, WorkerConfig};
///
/// let worker = WorkerBuilder::new(WorkerConfig::new("mailer").with_concurrency(4))
///     .with_queue(queue)
///     .with_processor(Arc::new(SendMail))
///     .with_backoff_strategy("jitter", jitter)
///     .build()?;
/// worker.start().await?;
/// ```
pub struct WorkerBuilder<S, P> {
    config: WorkerConfig,
    queue: Option<Queue<S>>,
    processor: Option<Arc<P>>,
    backoffs: Backoffs,
}

impl<S, P> fmt::Debug for WorkerBuilder<S, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("WorkerBuilder");
        debug.field("config", &self.config);
        debug.field("queue_set", &self.queue.is_some());
        debug.field("processor_set", &self.processor.is_some());
        debug.field("backoffs", &self.backoffs);

        if let Some(queue) = &self.queue {
            debug.field("queue", &queue.name());
            debug.field("store_type", &type_name::<S>());
        }
        if self.processor.is_some() {
            debug.field("processor_type", &type_name::<P>());
        }

        debug.finish()
    }
}

impl<S: Store, P: Processor<S> + 'static> WorkerBuilder<S, P> {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            queue: None,
            processor: None,
            backoffs: Backoffs::new(),
        }
    }

    pub fn with_queue(mut self, queue: Queue<S>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_processor(mut self, processor: Arc<P>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Replace the whole set of custom backoff strategies.
    pub fn with_backoffs(mut self, backoffs: Backoffs) -> Self {
        self.backoffs = backoffs;
        self
    }

    /// Register a custom backoff strategy under `name`.
    pub fn with_backoff_strategy(
        mut self,
        name: impl Into<String>,
        strategy: impl BackoffStrategy + 'static,
    ) -> Self {
        self.backoffs = self.backoffs.with_strategy(name, strategy);
        self
    }

    /// Build the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue or the processor is missing, or if the
    /// configuration is invalid.
    pub fn build(self) -> anyhow::Result<Worker<S, P>> {
        let queue = self
            .queue
            .ok_or_else(|| anyhow::anyhow!("queue dependency missing"))?;
        let processor = self
            .processor
            .ok_or_else(|| anyhow::anyhow!("processor dependency missing"))?;

        Worker::from_parts(queue, processor, self.config, self.backoffs)
    }
}
