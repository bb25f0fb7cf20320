//! The PT Query Driver and its collaborators: packet decoding, the
//! query-style layer atop it, instruction classification inside JIT
//! sections, and the return-address stack for compressed returns.

pub mod driver;
pub mod insn;
pub mod packet;
pub mod query;
pub mod retstack;

pub use driver::{Driver, DriverError, TimedEvent};
pub use packet::{Packet, PacketDecoder, PacketError};
pub use query::{PtEvent, PtQuery, QueryError};
