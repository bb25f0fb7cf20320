//! The decoded event vocabulary and the thread-segmentation pass that
//! groups a CPU's flat event stream for cross-work-item merging.

pub mod recorder;
pub mod types;

pub use recorder::{segment_by_thread, ThreadSegment};
pub use types::Event;
