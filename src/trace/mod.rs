//! Trace container parsing: the fixed header, the AUXTRACE/JVMRUNTIME/
//! sideband record layout wrapping it, and the PSB-based splitter that
//! turns one CPU's PT stream into independently decodable work items.

pub mod header;
pub mod splitter;
pub mod workitem;

pub use header::{HeaderError, TraceHeader, MINIMUM_HEADER_SIZE};
pub use splitter::{SplitError, TraceFile, DEFAULT_SPLIT_NUMBER};
pub use workitem::WorkItem;
