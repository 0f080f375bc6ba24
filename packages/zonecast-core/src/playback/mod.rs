//! Playback arbitration and the encoder process it drives.
//!
//! - [`encoder`]: encoder launcher, supervisor state machine, live input
//! - [`session`]: session timing, paused record, playlist queue
//! - [`arbiter`]: who may use the encoder, and when

pub mod arbiter;
pub mod encoder;
pub mod session;

pub use arbiter::{MediaResolver, PassthroughResolver, PlaybackArbiter, PlaybackStatus, StartedSession};
pub use encoder::{
    EncoderError, EncoderLauncher, EncoderState, EncoderSupervisor, FeedOutcome, FfmpegLauncher,
    LiveInput,
};
pub use session::{PausedSession, PlaybackSession, PlaylistQueue, SourceRef};
