//! One unit of PT decoding work, handed to a worker thread.

#[derive(Debug, Clone)]
pub struct WorkItem {
    pub cpu: u32,
    pub start_time: u64,
    /// `u64::MAX` for the final item of a CPU's stream (no upper bound).
    pub end_time: u64,
    pub pt_data: Vec<u8>,
}
