//! The port handle.
//!
//! A [`Port`] is one process's handle onto a shared port segment. Handles
//! are reference counted across processes through the node's `ref_counter`;
//! the last healthy handle to drop unlinks the segment and its named lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::PortError;
use crate::port::{OpenMode, PortNode, MAX_LISTENERS};
use crate::ring::{BufferDescriptor, Listener, RingBuffer};
use crate::segment::{IpcMutexGuard, NamedLock, SharedSegment};
use crate::watchdog::{PortContext, Watchdog};

/// Outcome of a non-blocking push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushStatus {
    /// The descriptor was written into the ring. `listeners_active` is false
    /// when no listener was registered at push time; the cell will be
    /// recycled by a later push and the caller should treat the push as a
    /// no-op.
    Enqueued { listeners_active: bool },

    /// No free cell; the descriptor was not written. Counted in
    /// [`Port::overflows_count`].
    BufferFull,
}

/// A process-local handle to a shared-memory port.
pub struct Port {
    segment: Arc<SharedSegment>,
    node_offset: u64,
    ring: RingBuffer,
    overflows: AtomicU64,
    watchdog: Arc<Watchdog>,
}

impl Port {
    /// Attaches to the port node at `node_offset`, bumping the shared
    /// reference count and registering with the watchdog.
    pub(crate) fn attach(
        segment: Arc<SharedSegment>,
        node_offset: u64,
        watchdog: Arc<Watchdog>,
    ) -> Self {
        let node = unsafe { segment.at::<PortNode>(node_offset) };
        let ring = unsafe {
            RingBuffer::new(
                segment.clone(),
                (*node).buffer_offset,
                (*node).buffer_node_offset,
            )
        };
        unsafe { (*node).ref_counter.fetch_add(1, Ordering::AcqRel) };

        let port = Self {
            segment,
            node_offset,
            ring,
            overflows: AtomicU64::new(0),
            watchdog,
        };
        port.watchdog.watch(PortContext::new(
            port.segment.clone(),
            port.node_offset,
            port.ring.clone(),
        ));
        port
    }

    pub(crate) fn node(&self) -> *mut PortNode {
        unsafe { self.segment.at::<PortNode>(self.node_offset) }
    }

    fn lock(&self) -> IpcMutexGuard<'_> {
        unsafe { (*self.node()).empty_cv_mutex.lock() }
    }

    fn dead(&self) -> PortError {
        PortError::PortDead {
            port_id: self.port_id(),
        }
    }

    /// Tries to enqueue a descriptor without blocking.
    ///
    /// A full ring is not an error: the overflow counter is bumped and
    /// [`PushStatus::BufferFull`] returned. Backpressure is the caller's
    /// decision. Fails with [`PortError::PortDead`] on a dead port.
    ///
    /// Waiters are notified after the mutex is released: one waiter on an
    /// exclusive port (and only when the ring was empty, since a non-empty
    /// ring means the single listener already has work), every waiter
    /// otherwise.
    pub fn try_push(&self, descriptor: BufferDescriptor) -> Result<PushStatus, PortError> {
        let node = self.node();
        let guard = self.lock();
        unsafe {
            if (*node).is_port_ok.load(Ordering::Relaxed) == 0 {
                return Err(self.dead());
            }

            let was_exclusive = (*node).is_opened_read_exclusive != 0;
            let was_empty = self.ring.is_empty();
            let had_waiters = (*node).waiting_count > 0;

            match self.ring.push(descriptor) {
                Ok(listeners_active) => {
                    drop(guard);
                    if had_waiters {
                        let cv = &(*node).empty_cv;
                        if was_exclusive {
                            if was_empty {
                                cv.notify_one();
                            }
                        } else {
                            cv.notify_all();
                        }
                    }
                    Ok(PushStatus::Enqueued { listeners_active })
                }
                Err(PortError::RingFull) => {
                    drop(guard);
                    self.overflows.fetch_add(1, Ordering::Relaxed);
                    Ok(PushStatus::BufferFull)
                }
                Err(err) => Err(err),
            }
        }
    }

    /// Blocks until the listener has a descriptor to pop or is closed.
    ///
    /// The wait is chunked into `port_wait_timeout_ms` slices; every slice
    /// that elapses without progress bumps the listener's status counter,
    /// which is the heartbeat the watchdog verifies. Timeouts are therefore
    /// not errors. Fails with [`PortError::PortDead`] if the port dies
    /// before or during the wait, and marks the port dead on any failure.
    pub fn wait_pop(
        &self,
        listener: &Listener,
        is_listener_closed: &AtomicBool,
        listener_index: u32,
    ) -> Result<(), PortError> {
        let result = self.wait_pop_inner(listener, is_listener_closed, listener_index);
        if result.is_err() {
            unsafe { (*self.node()).is_port_ok.store(0, Ordering::Relaxed) };
        }
        result
    }

    fn wait_pop_inner(
        &self,
        listener: &Listener,
        is_listener_closed: &AtomicBool,
        listener_index: u32,
    ) -> Result<(), PortError> {
        let node = self.node();
        debug_assert!((listener_index as usize) < MAX_LISTENERS);

        let mut guard = self.lock();
        unsafe {
            if (*node).is_port_ok.load(Ordering::Relaxed) == 0 {
                return Err(self.dead());
            }

            {
                let status = &mut (*node).listeners_status[listener_index as usize];
                status.set_waiting(true);
                status.mark_advanced();
            }
            (*node).waiting_count += 1;

            let slice = Duration::from_millis((*node).port_wait_timeout_ms as u64);
            let cv = &(*node).empty_cv;
            loop {
                let (reacquired, satisfied) = cv.wait_timeout_while(guard, slice, || {
                    is_listener_closed.load(Ordering::Acquire) || listener.head().is_some()
                });
                guard = reacquired;
                if satisfied {
                    break;
                }
                if (*node).is_port_ok.load(Ordering::Relaxed) == 0 {
                    // Dead port: the stale waiting status is never read again.
                    return Err(self.dead());
                }
                (*node).listeners_status[listener_index as usize].mark_advanced();
            }

            (*node).waiting_count -= 1;
            (*node).listeners_status[listener_index as usize].set_waiting(false);
        }
        drop(guard);
        Ok(())
    }

    /// Descriptor at the listener's read cursor, if any.
    pub fn head(&self, listener: &Listener) -> Option<BufferDescriptor> {
        let _guard = self.lock();
        listener.head()
    }

    /// Pops the descriptor at the listener's read cursor.
    ///
    /// Returns whether the pop freed the cell (every listener has now read
    /// it). Fails with [`PortError::RingEmpty`] when nothing is readable.
    pub fn pop(&self, listener: &mut Listener) -> Result<bool, PortError> {
        let _guard = self.lock();
        listener.pop()
    }

    /// Registers a new listener and returns it with its status-slot index.
    ///
    /// The listener only observes descriptors pushed after registration.
    pub fn create_listener(&self) -> Result<(Listener, u32), PortError> {
        let node = self.node();
        let _guard = self.lock();
        unsafe {
            if (*node).num_listeners as usize >= MAX_LISTENERS {
                return Err(PortError::TooManyListeners);
            }
            let index = (*node).num_listeners;
            (*node).num_listeners += 1;
            Ok((self.ring.register_listener(), index))
        }
    }

    /// Unregisters a listener.
    ///
    /// Cells that still count the departed listener are only freed once the
    /// remaining listeners pop them; if none remain, those cells stay
    /// occupied until the port is reclaimed. Deregistration is rare and
    /// ports are short-lived relative to descriptors.
    pub fn unregister_listener(&self, listener: Listener) {
        let node = self.node();
        let _guard = self.lock();
        unsafe {
            debug_assert!((*node).num_listeners > 0);
            (*node).num_listeners -= 1;
        }
        self.ring.unregister_listener();
        drop(listener);
    }

    /// Sets the listener's closed flag and wakes every waiter on the port.
    ///
    /// A listener blocked in [`wait_pop`](Self::wait_pop) returns promptly
    /// without popping; a subsequent `wait_pop` short-circuits. Idempotent.
    pub fn close_listener(&self, is_listener_closed: &AtomicBool) {
        let node = self.node();
        {
            let _guard = self.lock();
            is_listener_closed.store(true, Ordering::Release);
        }
        unsafe { (*node).empty_cv.notify_all() };
    }

    /// Verifies that every currently waiting listener is making progress.
    ///
    /// A port abandoned mid-wait by a crashed process shows a frozen status
    /// counter; polling for up to `healthy_check_timeout_ms` distinguishes
    /// that from a listener which simply has not timed out yet. Fails with
    /// [`PortError::Unhealthy`] when the deadline elapses without a clean
    /// pass, and [`PortError::PortDead`] if the port dies meanwhile.
    pub fn healthy_check(&self) -> Result<(), PortError> {
        let node = self.node();
        unsafe {
            if (*node).is_port_ok.load(Ordering::Relaxed) == 0 {
                return Err(self.dead());
            }

            let deadline =
                Instant::now() + Duration::from_millis((*node).healthy_check_timeout_ms as u64);
            let poll = Duration::from_millis((*node).port_wait_timeout_ms as u64);

            loop {
                {
                    let _guard = self.lock();
                    if (*node).is_port_ok.load(Ordering::Relaxed) == 0 {
                        return Err(self.dead());
                    }
                    if check_status_all_listeners(node) {
                        return Ok(());
                    }
                }
                if Instant::now() >= deadline {
                    return Err(PortError::Unhealthy {
                        port_id: (*node).port_id,
                    });
                }
                std::thread::sleep(poll);
            }
        }
    }

    /// Whether the port is still live.
    pub fn is_port_ok(&self) -> bool {
        unsafe { (*self.node()).is_port_ok.load(Ordering::Relaxed) != 0 }
    }

    /// The numeric port id.
    pub fn port_id(&self) -> u32 {
        unsafe { (*self.node()).port_id }
    }

    /// The mode this port is effectively opened in, considering every handle.
    pub fn open_mode(&self) -> OpenMode {
        let node = self.node();
        let _guard = self.lock();
        unsafe {
            if (*node).is_opened_for_reading != 0 {
                if (*node).is_opened_read_exclusive != 0 {
                    OpenMode::ReadExclusive
                } else {
                    OpenMode::ReadShared
                }
            } else {
                OpenMode::Write
            }
        }
    }

    /// Health-check timeout configured at creation.
    pub fn healthy_check_timeout_ms(&self) -> u32 {
        unsafe { (*self.node()).healthy_check_timeout_ms }
    }

    /// Ring capacity configured at creation.
    pub fn max_buffer_descriptors(&self) -> u32 {
        unsafe { (*self.node()).max_buffer_descriptors }
    }

    /// Pushes rejected by a full ring through this handle.
    pub fn overflows_count(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }
}

/// True when every waiting listener has advanced since the last sweep.
unsafe fn check_status_all_listeners(node: *const PortNode) -> bool {
    let count = (*node).num_listeners as usize;
    (&(*node).listeners_status)[..count]
        .iter()
        .all(|status| !status.is_waiting() || status.counter() != status.last_verified_counter())
}

impl Drop for Port {
    fn drop(&mut self) {
        self.watchdog.unwatch(&self.segment);

        let node = self.node();
        unsafe {
            let was_last = (*node).ref_counter.fetch_sub(1, Ordering::AcqRel) == 1;
            if was_last && (*node).is_port_ok.load(Ordering::Relaxed) != 0 {
                let name = self.segment.name().to_string();
                let overflows = self.overflows.load(Ordering::Relaxed);

                info!(
                    port_id = (*node).port_id,
                    segment = %name,
                    overflows,
                    "removing port"
                );
                if overflows > 0 {
                    warn!(
                        port_id = (*node).port_id,
                        segment = %name,
                        overflows,
                        "port had overflows"
                    );
                }

                if let Err(err) = SharedSegment::remove(&name) {
                    warn!(segment = %name, error = %err, "failed to remove port segment");
                }
                let _ = NamedLock::remove(&format!("{name}_mutex"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PortRegistry;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use uuid::Uuid;

    fn test_port(port_id: u32, capacity: u32, open_mode: OpenMode) -> Port {
        let domain = format!("t{}", &Uuid::new_v4().simple().to_string()[..8]);
        let watchdog = Arc::new(Watchdog::new());
        let registry =
            PortRegistry::with_watchdog(&domain, Box::new(|_, _| {}), watchdog).unwrap();
        registry
            .open_port(port_id, capacity, 900, open_mode)
            .unwrap()
    }

    fn descriptor(tag: u64) -> BufferDescriptor {
        BufferDescriptor::new(Uuid::new_v4(), tag)
    }

    #[test]
    fn test_push_without_listeners_is_a_recycled_noop() {
        let port = test_port(1, 2, OpenMode::ReadShared);

        // Zero listeners: the cells never become owed, so the ring never
        // fills no matter how many pushes go through.
        for tag in 0..3 {
            assert_eq!(
                port.try_push(descriptor(tag)).unwrap(),
                PushStatus::Enqueued {
                    listeners_active: false
                }
            );
        }
        assert_eq!(port.overflows_count(), 0);
    }

    #[test]
    fn test_full_ring_counts_overflow() {
        let port = test_port(2, 2, OpenMode::ReadShared);
        let (_listener, _index) = port.create_listener().unwrap();

        assert_eq!(
            port.try_push(descriptor(1)).unwrap(),
            PushStatus::Enqueued {
                listeners_active: true
            }
        );
        port.try_push(descriptor(2)).unwrap();
        assert_eq!(port.try_push(descriptor(3)).unwrap(), PushStatus::BufferFull);
        assert_eq!(port.overflows_count(), 1);
    }

    #[test]
    fn test_push_wakes_every_shared_listener() {
        let port = test_port(3, 4, OpenMode::ReadShared);
        let pushed = descriptor(0x77);

        thread::scope(|scope| {
            let consumers: Vec<_> = (0..2)
                .map(|_| {
                    let port = &port;
                    let (listener, index) = port.create_listener().unwrap();
                    scope.spawn(move || {
                        let mut listener = listener;
                        let closed = AtomicBool::new(false);
                        port.wait_pop(&listener, &closed, index).unwrap();
                        let head = port.head(&listener).unwrap();
                        port.pop(&mut listener).unwrap();
                        head
                    })
                })
                .collect();

            // Let both consumers reach the wait before publishing.
            thread::sleep(Duration::from_millis(100));
            port.try_push(pushed).unwrap();

            for consumer in consumers {
                assert_eq!(consumer.join().unwrap(), pushed);
            }
        });

        // Both listeners popped, so the cell went back to the ring.
        let (listener, _index) = port.create_listener().unwrap();
        assert_eq!(port.head(&listener), None);
    }

    #[test]
    fn test_push_wakes_exclusive_listener() {
        let port = test_port(4, 4, OpenMode::ReadExclusive);
        let pushed = descriptor(0x88);

        thread::scope(|scope| {
            let (listener, index) = port.create_listener().unwrap();
            let port = &port;
            let consumer = scope.spawn(move || {
                let mut listener = listener;
                let closed = AtomicBool::new(false);
                port.wait_pop(&listener, &closed, index).unwrap();
                let head = port.head(&listener).unwrap();
                port.pop(&mut listener).unwrap();
                head
            });

            thread::sleep(Duration::from_millis(100));
            port.try_push(pushed).unwrap();

            assert_eq!(consumer.join().unwrap(), pushed);
        });
    }

    #[test]
    fn test_close_listener_aborts_wait() {
        let port = test_port(5, 4, OpenMode::ReadShared);

        thread::scope(|scope| {
            let (listener, index) = port.create_listener().unwrap();
            let closed = Arc::new(AtomicBool::new(false));

            let waiter = {
                let port = &port;
                let closed = closed.clone();
                scope.spawn(move || {
                    port.wait_pop(&listener, &closed, index).unwrap();
                    port.head(&listener)
                })
            };

            thread::sleep(Duration::from_millis(100));
            port.close_listener(&closed);

            // Cancelled wait returns without anything to consume.
            assert_eq!(waiter.join().unwrap(), None);
        });
    }

    #[test]
    fn test_listener_table_capacity() {
        let port = test_port(6, 2, OpenMode::ReadShared);

        let mut listeners = Vec::with_capacity(MAX_LISTENERS);
        for expected_index in 0..MAX_LISTENERS as u32 {
            let (listener, index) = port.create_listener().unwrap();
            assert_eq!(index, expected_index);
            listeners.push(listener);
        }

        assert!(matches!(
            port.create_listener(),
            Err(PortError::TooManyListeners)
        ));
    }

    #[test]
    fn test_unregistered_listener_stops_counting() {
        let port = test_port(7, 4, OpenMode::ReadShared);
        let (mut staying, _) = port.create_listener().unwrap();
        let (leaving, _) = port.create_listener().unwrap();

        port.unregister_listener(leaving);

        // Pushes after deregistration count only the remaining listener,
        // so its pop alone frees the cell.
        let pushed = descriptor(0x99);
        port.try_push(pushed).unwrap();
        assert_eq!(port.head(&staying), Some(pushed));
        assert!(port.pop(&mut staying).unwrap());
    }

    #[test]
    fn test_accessors_reflect_creation_parameters() {
        let port = test_port(8, 16, OpenMode::ReadShared);

        assert_eq!(port.port_id(), 8);
        assert_eq!(port.max_buffer_descriptors(), 16);
        assert_eq!(port.healthy_check_timeout_ms(), 900);
        assert_eq!(port.open_mode(), OpenMode::ReadShared);
        assert!(port.is_port_ok());
        assert_eq!(port.overflows_count(), 0);
    }

    #[test]
    fn test_healthy_check_passes_on_idle_port() {
        let port = test_port(9, 4, OpenMode::Write);
        port.healthy_check().unwrap();
        assert_eq!(port.open_mode(), OpenMode::Write);
    }

    #[test]
    fn test_wait_pop_heartbeat_keeps_port_healthy() {
        let port = test_port(10, 4, OpenMode::ReadShared);
        let (listener, index) = port.create_listener().unwrap();
        let closed = Arc::new(AtomicBool::new(false));

        thread::scope(|scope| {
            let waiter = {
                let port = &port;
                let listener = &listener;
                let closed = closed.clone();
                scope.spawn(move || port.wait_pop(listener, &closed, index))
            };

            // Several wait slices elapse; the blocked listener keeps
            // advancing its counter, so the health check stays green.
            thread::sleep(Duration::from_millis(700));
            port.healthy_check().unwrap();

            port.close_listener(&closed);
            waiter.join().unwrap().unwrap();
        });
    }
}
