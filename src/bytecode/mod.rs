//! Bytecode CFG component (decoder spec §4.1).

pub mod cfg;
pub mod opcodes;

pub use cfg::{Block, BlockId, Cfg, CfgError, ExceptionHandler};
