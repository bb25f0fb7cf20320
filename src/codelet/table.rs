//! Interpreter codelet address table (decoder spec §4.4), laid out exactly
//! like the JVM's `JVMRuntime::CodeletsInfo` struct: a `low_bound`/`high_bound`
//! range plus a fixed collection of address (and address-table) fields, one
//! per codelet kind. `codelet_info` (§6) delivers this as one flat byte blob.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

pub const NUMBER_OF_STATES: usize = 10;
pub const NUMBER_OF_RETURN_ENTRIES: usize = 6;
pub const NUMBER_OF_RETURN_ADDRS: usize = 10;
pub const NUMBER_OF_METHOD_ENTRIES: usize = 34;
pub const NUMBER_OF_RESULT_HANDLERS: usize = 10;
pub const NUMBER_OF_DEOPT_ENTRIES: usize = 7;
pub const DISPATCH_LENGTH: usize = 256;

#[derive(Debug, Error)]
pub enum CodeletTableError {
    #[error("codelet_info payload too short: {0} bytes, need at least {1}")]
    Truncated(usize, usize),
}

#[derive(Debug, Clone)]
pub struct CodeletTable {
    pub low_bound: u64,
    pub high_bound: u64,
    pub slow_signature_handler: u64,
    pub unimplemented_bytecode_entry: u64,
    pub illegal_bytecode_sequence_entry: u64,
    pub return_entry: [[u64; NUMBER_OF_STATES]; NUMBER_OF_RETURN_ENTRIES],
    pub invoke_return_entry: [u64; NUMBER_OF_RETURN_ADDRS],
    pub invokeinterface_return_entry: [u64; NUMBER_OF_RETURN_ADDRS],
    pub invokedynamic_return_entry: [u64; NUMBER_OF_RETURN_ADDRS],
    pub earlyret_entry: [u64; NUMBER_OF_STATES],
    pub native_abi_to_tosca: [u64; NUMBER_OF_RESULT_HANDLERS],
    pub rethrow_exception_entry: u64,
    pub throw_exception_entry: u64,
    pub remove_activation_preserving_args_entry: u64,
    pub remove_activation_entry: u64,
    pub throw_array_index_out_of_bounds_exception_entry: u64,
    pub throw_array_store_exception_entry: u64,
    pub throw_arithmetic_exception_entry: u64,
    pub throw_class_cast_exception_entry: u64,
    pub throw_null_pointer_exception_entry: u64,
    pub throw_stack_overflow_error_entry: u64,
    pub entry_table: [u64; NUMBER_OF_METHOD_ENTRIES],
    pub normal_table: [[u64; NUMBER_OF_STATES]; DISPATCH_LENGTH],
    pub wentry_point: [u64; DISPATCH_LENGTH],
    pub deopt_entry: [[u64; NUMBER_OF_STATES]; NUMBER_OF_DEOPT_ENTRIES],
    pub deopt_reexecute_return_entry: u64,
}

impl CodeletTable {
    pub fn parse(buf: &[u8]) -> Result<CodeletTable, CodeletTableError> {
        let mut r = Reader::new(buf);
        Ok(CodeletTable {
            low_bound: r.u64()?,
            high_bound: r.u64()?,
            slow_signature_handler: r.u64()?,
            unimplemented_bytecode_entry: r.u64()?,
            illegal_bytecode_sequence_entry: r.u64()?,
            return_entry: r.table2::<NUMBER_OF_RETURN_ENTRIES, NUMBER_OF_STATES>()?,
            invoke_return_entry: r.table::<NUMBER_OF_RETURN_ADDRS>()?,
            invokeinterface_return_entry: r.table::<NUMBER_OF_RETURN_ADDRS>()?,
            invokedynamic_return_entry: r.table::<NUMBER_OF_RETURN_ADDRS>()?,
            earlyret_entry: r.table::<NUMBER_OF_STATES>()?,
            native_abi_to_tosca: r.table::<NUMBER_OF_RESULT_HANDLERS>()?,
            rethrow_exception_entry: r.u64()?,
            throw_exception_entry: r.u64()?,
            remove_activation_preserving_args_entry: r.u64()?,
            remove_activation_entry: r.u64()?,
            throw_array_index_out_of_bounds_exception_entry: r.u64()?,
            throw_array_store_exception_entry: r.u64()?,
            throw_arithmetic_exception_entry: r.u64()?,
            throw_class_cast_exception_entry: r.u64()?,
            throw_null_pointer_exception_entry: r.u64()?,
            throw_stack_overflow_error_entry: r.u64()?,
            entry_table: r.table::<NUMBER_OF_METHOD_ENTRIES>()?,
            normal_table: r.table2::<DISPATCH_LENGTH, NUMBER_OF_STATES>()?,
            wentry_point: r.table::<DISPATCH_LENGTH>()?,
            deopt_entry: r.table2::<NUMBER_OF_DEOPT_ENTRIES, NUMBER_OF_STATES>()?,
            deopt_reexecute_return_entry: r.u64()?,
        })
    }

    /// Two installs must describe the same code (§9: "installed exactly
    /// once ... subsequent installs must match -- mismatch is a fatal
    /// decode error").
    pub fn matches(&self, other: &CodeletTable) -> bool {
        self.low_bound == other.low_bound && self.high_bound == other.high_bound && self.entry_table == other.entry_table
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    fn u64(&mut self) -> Result<u64, CodeletTableError> {
        let need = self.pos + 8;
        if need > self.buf.len() {
            return Err(CodeletTableError::Truncated(self.buf.len(), need));
        }
        let v = LittleEndian::read_u64(&self.buf[self.pos..need]);
        self.pos = need;
        Ok(v)
    }

    fn table<const N: usize>(&mut self) -> Result<[u64; N], CodeletTableError> {
        let mut out = [0u64; N];
        for slot in out.iter_mut() {
            *slot = self.u64()?;
        }
        Ok(out)
    }

    fn table2<const N: usize, const M: usize>(&mut self) -> Result<[[u64; M]; N], CodeletTableError> {
        let mut out = [[0u64; M]; N];
        for row in out.iter_mut() {
            *row = self.table::<M>()?;
        }
        Ok(out)
    }
}
