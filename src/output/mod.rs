//! Stream output: lifecycle, workers, and the encoder feedback loop.

pub mod feedback;
pub mod stream;

pub use feedback::FeedbackController;
pub use stream::{
    CreateError, StartError, StopReason, StreamOutput, ZixiStream,
};
