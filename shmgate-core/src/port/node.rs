//! Shared port header.

use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU32};

use crate::port::MAX_LISTENERS;
use crate::registry::MAX_DOMAIN_NAME_LENGTH;
use crate::segment::{IpcCondvar, IpcMutex};

/// Packed per-listener status byte, read by the watchdog.
///
/// Layout: bit 0 `is_waiting`, bits 1-3 `counter`, bits 4-6
/// `last_verified_counter`, bit 7 unused. The counters are 3 bits wide on
/// purpose: they only need to differ between two adjacent watchdog sweeps,
/// so a waiting listener that bumps its counter at least once per sweep is
/// always seen as advancing.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerStatus(u8);

const WAITING_BIT: u8 = 0b0000_0001;
const COUNTER_SHIFT: u8 = 1;
const VERIFIED_SHIFT: u8 = 4;
const COUNTER_MASK: u8 = 0b111;

impl ListenerStatus {
    pub(crate) fn is_waiting(self) -> bool {
        self.0 & WAITING_BIT != 0
    }

    pub(crate) fn set_waiting(&mut self, waiting: bool) {
        if waiting {
            self.0 |= WAITING_BIT;
        } else {
            self.0 &= !WAITING_BIT;
        }
    }

    pub(crate) fn counter(self) -> u8 {
        (self.0 >> COUNTER_SHIFT) & COUNTER_MASK
    }

    pub(crate) fn set_counter(&mut self, value: u8) {
        self.0 = (self.0 & !(COUNTER_MASK << COUNTER_SHIFT))
            | ((value & COUNTER_MASK) << COUNTER_SHIFT);
    }

    pub(crate) fn last_verified_counter(self) -> u8 {
        (self.0 >> VERIFIED_SHIFT) & COUNTER_MASK
    }

    pub(crate) fn set_last_verified_counter(&mut self, value: u8) {
        self.0 = (self.0 & !(COUNTER_MASK << VERIFIED_SHIFT))
            | ((value & COUNTER_MASK) << VERIFIED_SHIFT);
    }

    /// Advertises liveness: moves `counter` one past `last_verified_counter`.
    pub(crate) fn mark_advanced(&mut self) {
        self.set_counter(self.last_verified_counter().wrapping_add(1));
    }
}

/// The port header, constructed once inside the port segment under the
/// directory key `"port_node"`.
///
/// Locking discipline: every field except the two atomics `ref_counter` and
/// `last_listeners_status_check_time_ms` is read and written only under
/// `empty_cv_mutex`. `is_port_ok` is stored atomically because `Drop` and
/// fast-path checks read it without the mutex, but transitions happen under
/// the mutex.
#[repr(C)]
pub struct PortNode {
    /// Stamp distinguishing same-named reincarnations of a port.
    pub(crate) uuid: [u8; 8],
    pub(crate) port_id: u32,
    _pad0: u32,

    pub(crate) empty_cv: IpcCondvar,
    pub(crate) empty_cv_mutex: IpcMutex,

    /// Offset of the ring's cell array.
    pub(crate) buffer_offset: u64,
    /// Offset of the ring's bookkeeping node.
    pub(crate) buffer_node_offset: u64,

    /// Live `Port` handles across all processes.
    pub(crate) ref_counter: AtomicU32,
    /// Listeners currently blocked in `wait_pop`.
    pub(crate) waiting_count: u32,

    pub(crate) listeners_status: [ListenerStatus; MAX_LISTENERS],
    pub(crate) num_listeners: u32,
    _pad1: u32,

    /// Stamp of the last successful watchdog sweep, in ms since the epoch.
    pub(crate) last_listeners_status_check_time_ms: AtomicI64,
    pub(crate) healthy_check_timeout_ms: u32,
    pub(crate) port_wait_timeout_ms: u32,
    pub(crate) max_buffer_descriptors: u32,

    /// Liveness flag; once cleared every operation fails fast.
    pub(crate) is_port_ok: AtomicU8,
    /// Sticky open-mode flags for the compatibility matrix.
    pub(crate) is_opened_read_exclusive: u8,
    pub(crate) is_opened_for_reading: u8,

    /// Null-terminated domain name.
    pub(crate) domain_name: [u8; MAX_DOMAIN_NAME_LENGTH + 1],
}

impl PortNode {
    /// The domain name as a string slice.
    pub(crate) fn domain_name(&self) -> &str {
        let len = self
            .domain_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_DOMAIN_NAME_LENGTH);
        std::str::from_utf8(&self.domain_name[..len]).unwrap_or("")
    }

    pub(crate) fn set_domain_name(&mut self, name: &str) {
        debug_assert!(name.len() <= MAX_DOMAIN_NAME_LENGTH);
        self.domain_name = [0; MAX_DOMAIN_NAME_LENGTH + 1];
        self.domain_name[..name.len()].copy_from_slice(name.as_bytes());
    }
}
