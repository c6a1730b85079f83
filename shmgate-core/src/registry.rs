//! Port factory.
//!
//! A [`PortRegistry`] ties a domain name to the OS-level names of its ports:
//! segment `<domain>_port<id>`, named lock `<domain>_port<id>_mutex`. Opening
//! a port either adopts the existing segment (after a health check and the
//! open-mode compatibility matrix) or creates it, and recovers from a
//! stale, corrupt or unhealthy segment by deleting and recreating it once.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::PortError;
use crate::port::{OpenMode, Port, PortNode};
use crate::ring::{Cell, RingNode};
use crate::segment::{self, NamedLock, SharedSegment};
use crate::watchdog::{now_millis, FailureHandler, Watchdog};

/// Longest accepted domain name. Long names can exceed OS limits on
/// shared-memory object names once the port suffix is appended.
pub const MAX_DOMAIN_NAME_LENGTH: usize = 16;

/// Headroom left in every port segment beyond the computed object layout.
const SEGMENT_SLACK: usize = 512;

/// Factory for the shared-memory ports of one domain.
pub struct PortRegistry {
    domain_name: String,
    watchdog: Arc<Watchdog>,
}

impl PortRegistry {
    /// Creates a registry for `domain_name` and installs `failure_handler`
    /// on the process-wide watchdog.
    ///
    /// The handler is set-once per watchdog: if one is already installed,
    /// the new one is silently ignored.
    pub fn new(domain_name: &str, failure_handler: FailureHandler) -> Result<Self, PortError> {
        Self::with_watchdog(domain_name, failure_handler, Watchdog::global())
    }

    /// Like [`new`](Self::new) but watched by a caller-supplied watchdog.
    pub fn with_watchdog(
        domain_name: &str,
        failure_handler: FailureHandler,
        watchdog: Arc<Watchdog>,
    ) -> Result<Self, PortError> {
        if domain_name.len() > MAX_DOMAIN_NAME_LENGTH {
            return Err(PortError::DomainNameTooLong(domain_name.to_string()));
        }
        watchdog.set_failure_handler(failure_handler);
        Ok(Self {
            domain_name: domain_name.to_string(),
            watchdog,
        })
    }

    /// The domain this registry serves.
    pub fn domain_name(&self) -> &str {
        &self.domain_name
    }

    /// Opens the port `port_id`, creating it if it does not exist.
    ///
    /// `max_buffer_descriptors` and `healthy_check_timeout_ms` only apply
    /// when this call ends up creating the port. An existing segment that
    /// is corrupt or fails its health check is removed and recreated with a
    /// fresh uuid; handles still attached to the removed incarnation keep
    /// their mapping and fail on their next operation once the watchdog
    /// marks it dead.
    pub fn open_port(
        &self,
        port_id: u32,
        max_buffer_descriptors: u32,
        healthy_check_timeout_ms: u32,
        open_mode: OpenMode,
    ) -> Result<Port, PortError> {
        let segment_name = format!("{}_port{}", self.domain_name, port_id);
        let mutex_name = format!("{segment_name}_mutex");

        info!(segment = %segment_name, mode = %open_mode, "opening port");

        // Serializes open/create/recover against every other process.
        let _port_lock =
            NamedLock::acquire(&mutex_name).map_err(|source| PortError::SegmentOpen {
                name: mutex_name.clone(),
                source,
            })?;

        match self.open_existing(&segment_name, open_mode) {
            Ok(port) => Ok(port),
            Err(err @ PortError::OpenModeConflict { .. }) => Err(err),
            Err(err) => {
                if !matches!(&err, PortError::SegmentOpen { source, .. }
                    if source.kind() == std::io::ErrorKind::NotFound)
                {
                    warn!(segment = %segment_name, error = %err, "existing port unusable; recreating");
                }
                if let Err(remove_err) = SharedSegment::remove(&segment_name) {
                    if remove_err.kind() != std::io::ErrorKind::NotFound {
                        warn!(segment = %segment_name, error = %remove_err, "failed to remove stale segment");
                    }
                }
                self.create_port(
                    &segment_name,
                    port_id,
                    max_buffer_descriptors,
                    healthy_check_timeout_ms,
                    open_mode,
                )
            }
        }
    }

    /// Adopts an existing port segment.
    fn open_existing(&self, segment_name: &str, open_mode: OpenMode) -> Result<Port, PortError> {
        let segment = Arc::new(SharedSegment::open(segment_name)?);
        let node_offset =
            segment
                .find::<PortNode>("port_node")
                .ok_or_else(|| PortError::SegmentCorrupt {
                    name: segment_name.to_string(),
                })?;

        let port = Port::attach(segment, node_offset, self.watchdog.clone());
        port.healthy_check()?;

        let node = port.node();
        unsafe {
            let _guard = (*node).empty_cv_mutex.lock();

            let exclusive_conflict =
                (*node).is_opened_read_exclusive != 0 && open_mode != OpenMode::Write;
            let reader_conflict =
                (*node).is_opened_for_reading != 0 && open_mode == OpenMode::ReadExclusive;
            if exclusive_conflict || reader_conflict {
                let reason = if exclusive_conflict {
                    format!("already opened ReadExclusive (uuid {})", hex(&(*node).uuid))
                } else {
                    format!("already opened for reading (uuid {})", hex(&(*node).uuid))
                };
                return Err(PortError::OpenModeConflict {
                    port_id: (*node).port_id,
                    reason,
                });
            }

            if open_mode == OpenMode::ReadExclusive {
                (*node).is_opened_read_exclusive = 1;
            }
            if open_mode != OpenMode::Write {
                (*node).is_opened_for_reading = 1;
            }

            info!(
                port_id = (*node).port_id,
                uuid = %hex(&(*node).uuid),
                mode = %open_mode,
                "port opened"
            );
        }

        Ok(port)
    }

    /// Creates the port segment and lays out its objects.
    fn create_port(
        &self,
        segment_name: &str,
        port_id: u32,
        max_buffer_descriptors: u32,
        healthy_check_timeout_ms: u32,
        open_mode: OpenMode,
    ) -> Result<Port, PortError> {
        let size = segment::reserved_bytes()
            + std::mem::size_of::<PortNode>()
            + std::mem::size_of::<Cell>() * max_buffer_descriptors as usize
            + std::mem::size_of::<RingNode>()
            + SEGMENT_SLACK;

        let segment = SharedSegment::create(segment_name, size).map_err(|err| {
            error!(segment = %segment_name, error = %err, "failed to create port segment");
            err
        })?;

        let node_offset = segment.construct::<PortNode>("port_node")?;
        let cells_offset = segment.alloc_array::<Cell>(max_buffer_descriptors as usize)?;
        let ring_node_offset = segment.alloc_one::<RingNode>()?;

        unsafe {
            RingNode::init(segment.at(ring_node_offset), max_buffer_descriptors);

            let node = &mut *segment.at::<PortNode>(node_offset);
            node.uuid
                .copy_from_slice(&Uuid::new_v4().as_bytes()[..8]);
            node.port_id = port_id;
            node.buffer_offset = cells_offset;
            node.buffer_node_offset = ring_node_offset;
            node.healthy_check_timeout_ms = healthy_check_timeout_ms;
            node.port_wait_timeout_ms = (healthy_check_timeout_ms / 3).max(1);
            node.max_buffer_descriptors = max_buffer_descriptors;
            node.is_port_ok.store(1, Ordering::Relaxed);
            node.is_opened_read_exclusive = (open_mode == OpenMode::ReadExclusive) as u8;
            node.is_opened_for_reading = (open_mode != OpenMode::Write) as u8;
            node.set_domain_name(&self.domain_name);
            node.last_listeners_status_check_time_ms
                .store(now_millis(), Ordering::Relaxed);

            info!(
                port_id,
                segment = %segment_name,
                uuid = %hex(&node.uuid),
                mode = %open_mode,
                "port created"
            );
        }

        Ok(Port::attach(
            Arc::new(segment),
            node_offset,
            self.watchdog.clone(),
        ))
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::BufferDescriptor;
    use crate::segment::segment_dir;
    use crate::PushStatus;
    use std::sync::atomic::AtomicBool;

    fn test_registry() -> (PortRegistry, Arc<Watchdog>) {
        let domain = format!("t{}", &Uuid::new_v4().simple().to_string()[..8]);
        let watchdog = Arc::new(Watchdog::new());
        let registry =
            PortRegistry::with_watchdog(&domain, Box::new(|_, _| {}), watchdog.clone()).unwrap();
        (registry, watchdog)
    }

    fn port_files_exist(registry: &PortRegistry, port_id: u32) -> (bool, bool) {
        let name = format!("{}_port{}", registry.domain_name(), port_id);
        (
            segment_dir().join(&name).exists(),
            segment_dir().join(format!("{name}_mutex")).exists(),
        )
    }

    #[test]
    fn test_domain_name_length_limit() {
        let watchdog = Arc::new(Watchdog::new());

        let sixteen = "abcdefghijklmnop";
        assert!(PortRegistry::with_watchdog(sixteen, Box::new(|_, _| {}), watchdog.clone()).is_ok());

        let seventeen = "abcdefghijklmnopq";
        assert!(matches!(
            PortRegistry::with_watchdog(seventeen, Box::new(|_, _| {}), watchdog),
            Err(PortError::DomainNameTooLong(_))
        ));
    }

    #[test]
    fn test_single_producer_single_consumer() {
        let (registry, _watchdog) = test_registry();

        let port = registry
            .open_port(42, 4, 1000, OpenMode::ReadShared)
            .unwrap();
        let (mut listener, _index) = port.create_listener().unwrap();

        let descriptor = BufferDescriptor::new(Uuid::new_v4(), 0x100);
        assert_eq!(
            port.try_push(descriptor).unwrap(),
            PushStatus::Enqueued {
                listeners_active: true
            }
        );

        assert_eq!(port.head(&listener), Some(descriptor));
        assert!(port.pop(&mut listener).unwrap());
        assert_eq!(port.head(&listener), None);
        assert!(matches!(
            port.pop(&mut listener),
            Err(PortError::RingEmpty)
        ));

        assert_eq!(port.overflows_count(), 0);
        drop(port);

        // Clean close: no residual OS objects.
        assert_eq!(port_files_exist(&registry, 42), (false, false));
    }

    #[test]
    fn test_open_then_drop_leaves_no_files() {
        let (registry, _watchdog) = test_registry();

        let port = registry.open_port(9, 4, 1000, OpenMode::Write).unwrap();
        assert_eq!(port_files_exist(&registry, 9), (true, true));
        drop(port);
        assert_eq!(port_files_exist(&registry, 9), (false, false));
    }

    #[test]
    fn test_existing_port_is_adopted_not_recreated() {
        let (registry, _watchdog) = test_registry();

        let first = registry
            .open_port(3, 4, 1000, OpenMode::ReadShared)
            .unwrap();
        let first_uuid = unsafe { (*first.node()).uuid };

        let second = registry.open_port(3, 8, 2000, OpenMode::Write).unwrap();
        // Capacity and timeout of the creator win; the uuid proves it is
        // the same incarnation.
        assert_eq!(second.max_buffer_descriptors(), 4);
        assert_eq!(second.healthy_check_timeout_ms(), 1000);
        assert_eq!(unsafe { (*second.node()).uuid }, first_uuid);

        drop(second);
        drop(first);
        assert_eq!(port_files_exist(&registry, 3), (false, false));
    }

    #[test]
    fn test_open_mode_matrix() {
        let (registry, _watchdog) = test_registry();

        let shared = registry
            .open_port(1, 4, 1000, OpenMode::ReadShared)
            .unwrap();
        let writer = registry.open_port(1, 4, 1000, OpenMode::Write).unwrap();
        assert!(matches!(
            registry.open_port(1, 4, 1000, OpenMode::ReadExclusive),
            Err(PortError::OpenModeConflict { port_id: 1, .. })
        ));
        let shared_again = registry
            .open_port(1, 4, 1000, OpenMode::ReadShared)
            .unwrap();

        drop(shared_again);
        drop(writer);
        drop(shared);

        // ReadExclusive blocks every later reader but never writers.
        let exclusive = registry
            .open_port(2, 4, 1000, OpenMode::ReadExclusive)
            .unwrap();
        assert_eq!(exclusive.open_mode(), OpenMode::ReadExclusive);
        assert!(matches!(
            registry.open_port(2, 4, 1000, OpenMode::ReadShared),
            Err(PortError::OpenModeConflict { port_id: 2, .. })
        ));
        assert!(matches!(
            registry.open_port(2, 4, 1000, OpenMode::ReadExclusive),
            Err(PortError::OpenModeConflict { port_id: 2, .. })
        ));
        let writer = registry.open_port(2, 4, 1000, OpenMode::Write).unwrap();

        drop(writer);
        drop(exclusive);
    }

    #[test]
    fn test_mode_conflict_keeps_existing_port_alive() {
        let (registry, _watchdog) = test_registry();

        let exclusive = registry
            .open_port(6, 4, 1000, OpenMode::ReadExclusive)
            .unwrap();
        let _ = registry.open_port(6, 4, 1000, OpenMode::ReadShared);

        // The rejected probe must not have torn anything down.
        assert!(exclusive.is_port_ok());
        assert_eq!(port_files_exist(&registry, 6), (true, true));

        drop(exclusive);
        assert_eq!(port_files_exist(&registry, 6), (false, false));
    }

    #[test]
    fn test_unhealthy_segment_is_recreated() {
        let (registry, watchdog) = test_registry();

        let old = registry
            .open_port(7, 4, 300, OpenMode::ReadShared)
            .unwrap();
        let old_uuid = unsafe { (*old.node()).uuid };
        let (_listener, index) = old.create_listener().unwrap();

        // Stage what a listener whose process was killed mid-wait looks
        // like: waiting, counter frozen at the last verified value.
        unsafe {
            let node = old.node();
            let _guard = (*node).empty_cv_mutex.lock();
            let status = &mut (*node).listeners_status[index as usize];
            status.set_waiting(true);
            status.set_counter(0);
            status.set_last_verified_counter(0);
        }

        // The health check fails, so the segment is replaced wholesale.
        let fresh = registry
            .open_port(7, 4, 300, OpenMode::ReadShared)
            .unwrap();
        assert!(fresh.is_port_ok());
        assert_ne!(unsafe { (*fresh.node()).uuid }, old_uuid);

        // The old incarnation is reaped by the watchdog and every stale
        // handle fails fast from then on.
        unsafe {
            (*old.node())
                .last_listeners_status_check_time_ms
                .store(now_millis() - 60_000, Ordering::Relaxed);
        }
        watchdog.wake_up();
        std::thread::sleep(std::time::Duration::from_millis(200));

        assert!(!old.is_port_ok());
        assert!(matches!(
            old.try_push(BufferDescriptor::new(Uuid::new_v4(), 1)),
            Err(PortError::PortDead { port_id: 7 })
        ));
        assert!(fresh.is_port_ok());

        drop(old);
        drop(fresh);
        let name = format!("{}_port7", registry.domain_name());
        let _ = SharedSegment::remove(&name);
        let _ = NamedLock::remove(&format!("{name}_mutex"));
    }

    #[test]
    fn test_corrupt_segment_is_recreated() {
        let (registry, _watchdog) = test_registry();
        let name = format!("{}_port8", registry.domain_name());

        // Plant a file that is not a valid segment.
        std::fs::write(segment_dir().join(&name), vec![0u8; 4096]).unwrap();

        let port = registry
            .open_port(8, 4, 1000, OpenMode::ReadShared)
            .unwrap();
        assert!(port.is_port_ok());

        let descriptor = BufferDescriptor::new(Uuid::new_v4(), 0x40);
        let (mut listener, _index) = port.create_listener().unwrap();
        port.try_push(descriptor).unwrap();
        assert_eq!(port.head(&listener), Some(descriptor));
        port.pop(&mut listener).unwrap();

        drop(port);
    }

    #[test]
    fn test_wait_pop_with_closed_listener_short_circuits() {
        let (registry, _watchdog) = test_registry();

        let port = registry
            .open_port(5, 4, 900, OpenMode::ReadShared)
            .unwrap();
        let (listener, index) = port.create_listener().unwrap();

        let closed = AtomicBool::new(false);
        port.close_listener(&closed);
        // Closing twice is a no-op.
        port.close_listener(&closed);

        let start = std::time::Instant::now();
        port.wait_pop(&listener, &closed, index).unwrap();
        assert!(start.elapsed() < std::time::Duration::from_millis(300));
        assert_eq!(port.head(&listener), None);

        drop(port);
    }
}
