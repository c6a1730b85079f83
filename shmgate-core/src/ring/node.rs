//! Shared bookkeeping node of the ring.

/// Ring state shared by every process attached to the port.
///
/// `write_cursor` is the index of the next cell to write and always equals
/// `next_sequence % capacity`; both are kept because the cursor drives cell
/// addressing while the sequence drives listener catch-up. Plain fields:
/// every access happens under the owning port's mutex.
#[repr(C)]
pub struct RingNode {
    pub(crate) write_cursor: u32,
    pub(crate) registered_listeners: u32,
    pub(crate) next_sequence: u64,
    pub(crate) capacity: u32,
    _pad: u32,
}

impl RingNode {
    /// Initializes a zeroed node in place.
    ///
    /// # Safety
    ///
    /// `node` must point at writable memory inside a shared segment.
    pub(crate) unsafe fn init(node: *mut RingNode, capacity: u32) {
        (*node).write_cursor = 0;
        (*node).registered_listeners = 0;
        (*node).next_sequence = 0;
        (*node).capacity = capacity;
    }
}
