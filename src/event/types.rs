//! The event vocabulary a decoded trace is made of.
//!
//! This is a closed tag set: every observation the driver makes about a
//! thread's execution boils down to one of these. Kept separate from the
//! recorder's on-disk encoding so the driver can build events without
//! knowing how they are ultimately serialized.

use crate::jit::JitSectionRef;
use crate::runtime::MethodId;

#[derive(Debug, Clone)]
pub enum Event {
    CallBegin,
    CallEnd,
    MethodEntry(MethodId),
    MethodExit(MethodId),
    MethodPoint(MethodId),
    Bci(u32),
    Taken,
    NotTaken,
    SwitchCase(u32),
    SwitchDefault,
    RetCode,
    Deoptimization,
    Throw,
    Rethrow,
    Handle,
    PopFrame,
    EarlyRet,
    NonInvokeRet,
    Osr,
    /// A run of consecutive PCs inside one JIT-compiled section, recorded as
    /// indices into that section's `pc_descriptors` table rather than raw
    /// addresses, so later output stages can resolve inlined frames.
    JitCode { section: JitSectionRef, pc_indices: Vec<usize> },
    DataLoss,
    DecodeError,
}
