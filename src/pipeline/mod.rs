//! Pipeline orchestration: dedicated threads wired by bounded queues
//!
//! Every thread loops on a shared atomic stop flag; shutdown signals the
//! flag, closes the queues to wake blocked consumers, then joins threads in
//! reverse spawn order.

pub mod host;
pub mod viewer;

pub use host::{AudioCapturePath, HostPipeline, UpstreamAudioPath};
pub use viewer::{MicrophonePath, ViewerAudioPath, ViewerPipeline};
