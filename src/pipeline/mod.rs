pub mod controller;
pub mod executor;
pub mod progress;
pub mod stage;

pub use controller::{PipelineController, PipelineHandle};
pub use executor::{StageExecutor, StageExit, StageRun};
pub use progress::{JobOutcome, ProgressChannel, ProgressEvent, ProgressPublisher, Subscription};
pub use stage::{Stage, StageKind};
