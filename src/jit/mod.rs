//! JIT Section Index component (decoder spec §4.2).

pub mod index;
pub mod section;

pub use index::SectionIndex;
pub use section::{JitSection, JitSectionRef, PcDescriptor};
