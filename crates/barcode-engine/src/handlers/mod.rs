//! Stage Handlers. Each handler receives the Image already
//! advanced into its "-ing" entry status by the Worker Runtime and returns
//! the outcome of its work: the terminal status to transition to, a
//! mutation closure recording whatever fields the handler computed, and
//! any Detections to persist alongside the transition.

use async_trait::async_trait;
use barcode_core::{Detection, Image, ImageStatus, PipelineError};

pub mod cleanup;
pub mod decode_fallback;
pub mod decode_primary;
pub mod manual_resolve;
pub mod preprocess;

/// The result of a Stage Handler's work, not yet committed to the store.
pub struct HandlerOutcome {
    pub to: ImageStatus,
    pub mutate: Box<dyn FnOnce(&mut Image) + Send>,
    pub detections: Vec<Detection>,
}

impl HandlerOutcome {
    pub fn new(to: ImageStatus, mutate: impl FnOnce(&mut Image) + Send + 'static) -> Self {
        Self {
            to,
            mutate: Box::new(mutate),
            detections: Vec::new(),
        }
    }

    pub fn with_detections(mut self, detections: Vec<Detection>) -> Self {
        self.detections = detections;
        self
    }
}

/// A unit of work the Worker Runtime executes for a leased job. `image` is
/// already in its entry "-ing" status by the time `run` is called.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn run(&self, image: &Image) -> Result<HandlerOutcome, PipelineError>;
}
