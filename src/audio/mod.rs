//! audio - Capture, metering, gating, and utterance segmentation
//!
//! Uses ALSA for audio I/O. The capture session runs the read loop on
//! a dedicated OS thread and feeds every block through the level meter,
//! the noise gate, and the VAD segmenter.

mod alsa_device;
mod gate;
pub mod meter;
mod segmenter;
mod session;

pub use gate::NoiseGate;
pub use segmenter::{should_transmit, Segment, Segmenter, VadConfig};
pub use session::{CaptureSession, SessionConfig, SessionEvent};
