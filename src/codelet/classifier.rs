//! Codelet Classifier (decoder spec §4.4).
//!
//! Classification is a membership test against the address slots in
//! `CodeletTable`, built once into a flat lookup map so that classifying an
//! IP is O(1) instead of scanning every table on every instruction. Ties
//! (the same address appearing in two tables) are broken by insertion
//! order, which follows the table's own field order -- the most specific
//! kinds (named return/throw entries) are registered before the broad
//! `normal_table` bytecode-dispatch fallback, so a genuine codelet entry
//! point always wins over an address that also happens to equal some
//! dispatch-row slot.

use rustc_hash::FxHashMap;

use super::table::CodeletTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKind {
    Invoke,
    InvokeInterface,
    InvokeDynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticException {
    ArrayIndexOutOfBounds,
    ArrayStore,
    Arithmetic,
    ClassCast,
    NullPointer,
    StackOverflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Not in any codelet region -- §4.7 enters jit mode on this result.
    Illegal,
    /// Ordinary bytecode dispatch; `bytecode` is the dispatched opcode.
    Bytecode(u8),
    MethodEntry,
    ReturnEntry(ReturnKind),
    Deopt,
    DeoptReexecuteReturn,
    EarlyRet,
    ThrowException,
    RethrowException,
    RemoveActivationPreservingArgs,
    RemoveActivation,
    ArithmeticThrow(ArithmeticException),
    JitcodeEntry,
    JitcodeOsrEntry,
    Jitcode,
}

pub struct Classifier {
    by_addr: FxHashMap<u64, Classification>,
    low_bound: u64,
    high_bound: u64,
}

impl Classifier {
    pub fn new(table: &CodeletTable) -> Classifier {
        let mut by_addr = FxHashMap::default();
        let mut insert = |addr: u64, kind: Classification| {
            if addr != 0 {
                by_addr.entry(addr).or_insert(kind);
            }
        };

        for &addr in table.entry_table.iter() {
            insert(addr, Classification::MethodEntry);
        }
        for &addr in table.invoke_return_entry.iter() {
            insert(addr, Classification::ReturnEntry(ReturnKind::Invoke));
        }
        for &addr in table.invokeinterface_return_entry.iter() {
            insert(addr, Classification::ReturnEntry(ReturnKind::InvokeInterface));
        }
        for &addr in table.invokedynamic_return_entry.iter() {
            insert(addr, Classification::ReturnEntry(ReturnKind::InvokeDynamic));
        }
        for row in table.return_entry.iter() {
            for &addr in row.iter() {
                insert(addr, Classification::ReturnEntry(ReturnKind::Invoke));
            }
        }
        for row in table.deopt_entry.iter() {
            for &addr in row.iter() {
                insert(addr, Classification::Deopt);
            }
        }
        insert(table.deopt_reexecute_return_entry, Classification::DeoptReexecuteReturn);
        for &addr in table.earlyret_entry.iter() {
            insert(addr, Classification::EarlyRet);
        }
        insert(table.throw_exception_entry, Classification::ThrowException);
        insert(table.rethrow_exception_entry, Classification::RethrowException);
        insert(table.remove_activation_preserving_args_entry, Classification::RemoveActivationPreservingArgs);
        insert(table.remove_activation_entry, Classification::RemoveActivation);
        insert(
            table.throw_array_index_out_of_bounds_exception_entry,
            Classification::ArithmeticThrow(ArithmeticException::ArrayIndexOutOfBounds),
        );
        insert(
            table.throw_array_store_exception_entry,
            Classification::ArithmeticThrow(ArithmeticException::ArrayStore),
        );
        insert(
            table.throw_arithmetic_exception_entry,
            Classification::ArithmeticThrow(ArithmeticException::Arithmetic),
        );
        insert(
            table.throw_class_cast_exception_entry,
            Classification::ArithmeticThrow(ArithmeticException::ClassCast),
        );
        insert(
            table.throw_null_pointer_exception_entry,
            Classification::ArithmeticThrow(ArithmeticException::NullPointer),
        );
        insert(
            table.throw_stack_overflow_error_entry,
            Classification::ArithmeticThrow(ArithmeticException::StackOverflow),
        );
        for (opcode, row) in table.normal_table.iter().enumerate() {
            for &addr in row.iter() {
                insert(addr, Classification::Bytecode(opcode as u8));
            }
        }
        for &addr in table.wentry_point.iter() {
            // Wide-prefixed dispatch rows classify to the same bytecode;
            // opcode identity is recovered by the caller from the `wide`
            // prefix byte already consumed, so we don't have it here.
            insert(addr, Classification::Bytecode(0));
        }

        Classifier {
            by_addr,
            low_bound: table.low_bound,
            high_bound: table.high_bound,
        }
    }

    pub fn classify(&self, ip: u64) -> Classification {
        if let Some(&c) = self.by_addr.get(&ip) {
            return c;
        }
        if ip >= self.low_bound && ip < self.high_bound {
            // Inside the interpreter's generated-code range but not at a
            // recognized slot boundary: still "ordinary bytecode dispatch"
            // as far as the spec's two outcomes besides named codelets go,
            // but we cannot name the opcode, so callers must treat this the
            // same as `Illegal` for safety (a decode error, not a guess).
            Classification::Illegal
        } else {
            Classification::Illegal
        }
    }
}
