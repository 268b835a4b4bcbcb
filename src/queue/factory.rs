use std::sync::{Arc, RwLock};

use crate::clock::Clock;
use crate::queue::{Queue, QueueOptions, ReferenceSink};
use crate::settings::SettingsRepository;
use crate::{Error, Result};

/// Builds queues for the post office.
pub trait QueueFactory: Send + Sync {
    fn create_queue(&self, options: QueueOptions) -> Result<Arc<Queue>>;
}

/// Resolves address settings for each new queue and wires it to the shared
/// reference sink.
pub struct DefaultQueueFactory {
    settings: Arc<SettingsRepository>,
    clock: Arc<dyn Clock>,
    sink: RwLock<Option<Arc<dyn ReferenceSink>>>,
}

impl DefaultQueueFactory {
    pub fn new(settings: Arc<SettingsRepository>, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            sink: RwLock::new(None),
        }
    }

    /// Must be called before the first queue is created.
    pub fn set_sink(&self, sink: Arc<dyn ReferenceSink>) {
        *self.sink.write().unwrap_or_else(|e| e.into_inner()) = Some(sink);
    }
}

impl QueueFactory for DefaultQueueFactory {
    fn create_queue(&self, options: QueueOptions) -> Result<Arc<Queue>> {
        let sink = self
            .sink
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| Error::illegal_state("queue factory has no reference sink"))?;
        let settings = self.settings.match_address(&options.address);
        Ok(Arc::new(Queue::new(options, settings, sink, Arc::clone(&self.clock))))
    }
}
