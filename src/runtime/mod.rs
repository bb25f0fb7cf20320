//! Runtime Timeline component (decoder spec §4.3) and its collaborators:
//! the JVM dump stream reader and the method registry.

pub mod dump;
pub mod method;
pub mod timeline;

pub use method::{Method, MethodId, MethodTable};
pub use timeline::{Timeline, TimelineError};
