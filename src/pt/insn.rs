//! x86-64 instruction length decode and control-flow classification for
//! bytes living in a JIT-compiled section.
//!
//! Grounded on the `ptcov` reference decoder's `InstructionClass`, which
//! classifies every `iced_x86::Instruction` by its `FlowControl` plus a
//! handful of special cases (MOV to CR3, `ptwrite`). We keep the same
//! dispatch shape; `ptcov` tracks coverage edges, we track how far to
//! advance the instruction-pointer and what a PT packet is expected to
//! resolve next.

use iced_x86::{Code, Decoder, DecoderOptions, FlowControl, Instruction, Register};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InsnError {
    #[error("could not decode an instruction at ip {0:#x}")]
    BadInstruction(u64),
    #[error("instruction bytes at ip {0:#x} run past the end of the section")]
    OutOfBounds(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsnClass {
    Other,
    CallDirect,
    CallIndirect,
    CondBranch,
    FarTransfer,
    JumpDirect,
    JumpIndirect,
    MovCr3,
    Return,
    Ptwrite,
}

#[derive(Debug, Clone, Copy)]
pub struct DecodedInsn {
    pub ip: u64,
    pub len: u32,
    pub class: InsnClass,
    /// Resolved target for unconditional direct branches/calls.
    pub direct_target: Option<u64>,
}

/// Decodes exactly one instruction starting at `ip`, where `code[0]`
/// corresponds to address `ip`.
pub fn decode_one(code: &[u8], ip: u64) -> Result<DecodedInsn, InsnError> {
    let mut decoder = Decoder::with_ip(64, code, ip, DecoderOptions::NONE);
    if !decoder.can_decode() {
        return Err(InsnError::OutOfBounds(ip));
    }
    let mut insn = Instruction::default();
    decoder.decode_out(&mut insn);
    if insn.is_invalid() {
        return Err(InsnError::BadInstruction(ip));
    }

    let class = classify(&insn);
    let direct_target = matches!(class, InsnClass::CallDirect | InsnClass::JumpDirect)
        .then(|| insn.near_branch_target());

    Ok(DecodedInsn { ip, len: insn.len() as u32, class, direct_target })
}

fn classify(insn: &Instruction) -> InsnClass {
    if is_ptwrite(insn) {
        return InsnClass::Ptwrite;
    }
    match insn.flow_control() {
        FlowControl::Next => {
            if matches!(insn.code(), Code::Mov_cr_r32 | Code::Mov_cr_r64) && insn.op0_register() == Register::CR3 {
                InsnClass::MovCr3
            } else {
                InsnClass::Other
            }
        }
        FlowControl::ConditionalBranch => InsnClass::CondBranch,
        FlowControl::UnconditionalBranch => {
            if insn.is_jmp_far() {
                InsnClass::FarTransfer
            } else {
                InsnClass::JumpDirect
            }
        }
        FlowControl::IndirectBranch => {
            if insn.is_jmp_far_indirect() {
                InsnClass::FarTransfer
            } else {
                InsnClass::JumpIndirect
            }
        }
        FlowControl::Call => {
            if insn.is_call_near() {
                InsnClass::CallDirect
            } else {
                InsnClass::FarTransfer
            }
        }
        FlowControl::IndirectCall => {
            if insn.is_call_far_indirect() {
                InsnClass::FarTransfer
            } else {
                InsnClass::CallIndirect
            }
        }
        FlowControl::Return => match insn.code() {
            Code::Retnd | Code::Retnq | Code::Retnw | Code::Retnd_imm16 | Code::Retnq_imm16 | Code::Retnw_imm16 => {
                InsnClass::Return
            }
            _ => InsnClass::FarTransfer,
        },
        FlowControl::Interrupt | FlowControl::Exception => InsnClass::FarTransfer,
        FlowControl::XbeginXabortXend => InsnClass::Other,
    }
}

fn is_ptwrite(insn: &Instruction) -> bool {
    matches!(insn.code(), Code::Ptwrite_rm32 | Code::Ptwrite_rm64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_ret_instruction() {
        let code = [0xc3u8]; // ret
        let insn = decode_one(&code, 0x1000).unwrap();
        assert_eq!(insn.class, InsnClass::Return);
        assert_eq!(insn.len, 1);
    }

    #[test]
    fn decodes_a_direct_near_jump() {
        // jmp rel8 +2 (to ip+4)
        let code = [0xebu8, 0x02];
        let insn = decode_one(&code, 0x1000).unwrap();
        assert_eq!(insn.class, InsnClass::JumpDirect);
        assert_eq!(insn.direct_target, Some(0x1004));
    }
}
