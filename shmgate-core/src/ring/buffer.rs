//! Process-local view of the descriptor ring.
//!
//! The ring itself (cells + bookkeeping node) lives in a shared segment;
//! [`RingBuffer`] only holds the offsets and resolves them through the
//! segment on every access, so it is valid in any process that mapped the
//! segment. None of these operations synchronize by themselves: the owning
//! port calls them with its inter-process mutex held.

use std::sync::Arc;

use crate::error::PortError;
use crate::ring::{BufferDescriptor, Cell, RingNode};
use crate::segment::SharedSegment;

/// Handle to a ring inside a shared segment.
#[derive(Clone)]
pub struct RingBuffer {
    segment: Arc<SharedSegment>,
    cells_offset: u64,
    node_offset: u64,
}

impl RingBuffer {
    /// Attaches to the ring whose cell array and node sit at the given
    /// offsets of `segment`.
    pub(crate) fn new(segment: Arc<SharedSegment>, cells_offset: u64, node_offset: u64) -> Self {
        Self {
            segment,
            cells_offset,
            node_offset,
        }
    }

    fn node(&self) -> *mut RingNode {
        unsafe { self.segment.at::<RingNode>(self.node_offset) }
    }

    fn cell(&self, index: u32) -> *mut Cell {
        unsafe {
            let cells = self.segment.at::<Cell>(self.cells_offset);
            debug_assert!(index < (*self.node()).capacity);
            cells.add(index as usize)
        }
    }

    /// Number of cells in the ring.
    pub fn capacity(&self) -> u32 {
        unsafe { (*self.node()).capacity }
    }

    /// Writes `descriptor` into the cell at the write cursor.
    ///
    /// Fails with [`PortError::RingFull`] when that cell is still owed reads.
    /// Returns whether any listener was registered at push time; when none
    /// was, the cell's count stays zero and the next push recycles it.
    pub(crate) fn push(&self, descriptor: BufferDescriptor) -> Result<bool, PortError> {
        unsafe {
            let node = self.node();
            let cell = self.cell((*node).write_cursor);

            if (*cell).enqueued_count > 0 {
                return Err(PortError::RingFull);
            }

            (*cell).descriptor = descriptor;
            (*cell).sequence = (*node).next_sequence;
            (*cell).enqueued_count = (*node).registered_listeners;

            (*node).next_sequence += 1;
            (*node).write_cursor = ((*node).write_cursor + 1) % (*node).capacity;

            Ok((*node).registered_listeners > 0)
        }
    }

    /// Registers a new listener.
    ///
    /// Its read cursor starts at the current write position, so descriptors
    /// pushed before registration are never observed.
    pub(crate) fn register_listener(&self) -> Listener {
        unsafe {
            let node = self.node();
            (*node).registered_listeners += 1;
            Listener {
                ring: self.clone(),
                next_sequence: (*node).next_sequence,
            }
        }
    }

    /// Removes one listener from the push-time count.
    ///
    /// Cells that already counted the departed listener keep their count;
    /// they are freed by the remaining consumers or leak until the port
    /// dies.
    pub(crate) fn unregister_listener(&self) {
        unsafe {
            let node = self.node();
            debug_assert!((*node).registered_listeners > 0);
            (*node).registered_listeners -= 1;
        }
    }

    /// Whether no cell is currently owed a read.
    pub(crate) fn is_empty(&self) -> bool {
        unsafe {
            let capacity = (*self.node()).capacity;
            (0..capacity).all(|index| (*self.cell(index)).enqueued_count == 0)
        }
    }

    /// Snapshots every still-enqueued descriptor, oldest first.
    ///
    /// Used by the watchdog when a port dies, so the upstream owner can
    /// release the payload buffers the descriptors reference.
    pub(crate) fn copy_enqueued(&self, out: &mut Vec<BufferDescriptor>) {
        unsafe {
            let capacity = (*self.node()).capacity;
            let mut pending: Vec<&Cell> = (0..capacity)
                .map(|index| &*self.cell(index))
                .filter(|cell| cell.enqueued_count > 0)
                .collect();
            pending.sort_by_key(|cell| cell.sequence);
            out.extend(pending.into_iter().map(|cell| cell.descriptor));
        }
    }
}

/// A registered reader with its own cursor into the ring.
pub struct Listener {
    ring: RingBuffer,
    next_sequence: u64,
}

impl Listener {
    /// The descriptor at this listener's read cursor, if one has been pushed
    /// there since registration.
    pub(crate) fn head(&self) -> Option<BufferDescriptor> {
        unsafe {
            let capacity = (*self.ring.node()).capacity;
            let cell = self.ring.cell((self.next_sequence % capacity as u64) as u32);
            if (*cell).enqueued_count > 0 && (*cell).sequence == self.next_sequence {
                Some((*cell).descriptor)
            } else {
                None
            }
        }
    }

    /// Consumes the descriptor at the read cursor and advances it.
    ///
    /// Returns whether this pop freed the cell (all listeners have read it).
    pub(crate) fn pop(&mut self) -> Result<bool, PortError> {
        unsafe {
            let capacity = (*self.ring.node()).capacity;
            let cell = self.ring.cell((self.next_sequence % capacity as u64) as u32);
            if (*cell).enqueued_count == 0 || (*cell).sequence != self.next_sequence {
                return Err(PortError::RingEmpty);
            }
            (*cell).enqueued_count -= 1;
            self.next_sequence += 1;
            Ok((*cell).enqueued_count == 0)
        }
    }
}
