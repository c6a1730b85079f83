//! Cross-process liveness watchdog.
//!
//! One background thread per process inspects every port the process has
//! opened. A listener blocked in `wait_pop` bumps its status counter at
//! least once per `port_wait_timeout_ms` (one third of the health timeout),
//! so a counter that stays frozen across a full health-timeout window means
//! its process is crashed or deadlocked. Such a port is marked dead and the
//! descriptors still enqueued are handed to the failure handler so the
//! upstream owner can release their payload buffers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::port::PortNode;
use crate::ring::{BufferDescriptor, RingBuffer};
use crate::segment::SharedSegment;

/// Callback invoked with the still-enqueued descriptors and the domain name
/// of a port that has just been declared dead.
pub type FailureHandler = Box<dyn Fn(&[BufferDescriptor], &str) + Send + Sync>;

/// Interval between unforced sweeps.
const TICK: Duration = Duration::from_secs(1);

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Everything the watchdog needs to inspect one opened port.
pub(crate) struct PortContext {
    segment: Arc<SharedSegment>,
    node_offset: u64,
    ring: RingBuffer,
}

impl PortContext {
    pub(crate) fn new(segment: Arc<SharedSegment>, node_offset: u64, ring: RingBuffer) -> Self {
        Self {
            segment,
            node_offset,
            ring,
        }
    }

    fn node(&self) -> *mut PortNode {
        unsafe { self.segment.at::<PortNode>(self.node_offset) }
    }
}

struct Inner {
    watched: Mutex<Vec<PortContext>>,
    wake: Mutex<bool>,
    wake_cv: Condvar,
    exit: AtomicBool,
    handler: OnceLock<FailureHandler>,
}

/// The per-process watchdog task.
///
/// Most callers share [`Watchdog::global`]; tests construct their own
/// instance so they control the failure handler and shutdown.
pub struct Watchdog {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    /// Spawns a watchdog with its own sweep thread.
    pub fn new() -> Self {
        let inner = Arc::new(Inner {
            watched: Mutex::new(Vec::new()),
            wake: Mutex::new(false),
            wake_cv: Condvar::new(),
            exit: AtomicBool::new(false),
            handler: OnceLock::new(),
        });

        let thread = {
            let inner = inner.clone();
            thread::Builder::new()
                .name("shmgate-watchdog".to_string())
                .spawn(move || inner.run())
                .expect("Failed to spawn watchdog thread")
        };

        Self {
            inner,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// The process-wide shared instance, spawned on first use.
    pub fn global() -> Arc<Watchdog> {
        static GLOBAL: OnceLock<Arc<Watchdog>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(Watchdog::new())).clone()
    }

    /// Installs the failure handler.
    ///
    /// The handler is immutable once installed: the first call wins and
    /// every later call is silently ignored.
    pub fn set_failure_handler(&self, handler: FailureHandler) {
        let _ = self.inner.handler.set(handler);
    }

    /// Forces a sweep without waiting for the next tick.
    pub fn wake_up(&self) {
        {
            let mut wake = self.inner.wake.lock().unwrap();
            *wake = true;
        }
        self.inner.wake_cv.notify_one();
    }

    /// Called by the port constructor.
    pub(crate) fn watch(&self, context: PortContext) {
        self.inner.watched.lock().unwrap().push(context);
    }

    /// Called by the port destructor.
    pub(crate) fn unwatch(&self, segment: &Arc<SharedSegment>) {
        self.inner
            .watched
            .lock()
            .unwrap()
            .retain(|context| !Arc::ptr_eq(&context.segment, segment));
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.inner.exit.store(true, Ordering::Relaxed);
        self.wake_up();
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

impl Inner {
    fn run(&self) {
        while !self.exit.load(Ordering::Relaxed) {
            {
                let wake = self.wake.lock().unwrap();
                let (mut wake, _) = self
                    .wake_cv
                    .wait_timeout_while(wake, TICK, |woken| !*woken)
                    .unwrap();
                *wake = false;
            }
            if self.exit.load(Ordering::Relaxed) {
                break;
            }

            let now_ms = now_millis();
            let mut watched = self.watched.lock().unwrap();
            watched.retain(|context| self.inspect(context, now_ms));
        }
    }

    /// Inspects one port. Returns whether to keep watching it.
    fn inspect(&self, context: &PortContext, now_ms: i64) -> bool {
        let node = context.node();
        unsafe {
            let last_check = (*node)
                .last_listeners_status_check_time_ms
                .load(Ordering::Relaxed);
            if now_ms.saturating_sub(last_check) <= (*node).healthy_check_timeout_ms as i64 {
                return true;
            }

            let bound = Duration::from_millis((*node).port_wait_timeout_ms as u64);
            let Some(_guard) = (*node).empty_cv_mutex.try_lock_for(bound) else {
                // A peer died holding the port mutex; nothing left to verify.
                (*node).is_port_ok.store(0, Ordering::Relaxed);
                warn!(
                    port_id = (*node).port_id,
                    "port mutex unobtainable; dropping port from watch"
                );
                return false;
            };

            if update_status_all_listeners(node) {
                (*node)
                    .last_listeners_status_check_time_ms
                    .store(now_ms, Ordering::Relaxed);
            } else if (*node).is_port_ok.load(Ordering::Relaxed) != 0 {
                (*node).is_port_ok.store(0, Ordering::Relaxed);

                let mut enqueued = Vec::new();
                context.ring.copy_enqueued(&mut enqueued);
                let domain = (*node).domain_name().to_string();
                warn!(
                    port_id = (*node).port_id,
                    domain = %domain,
                    enqueued = enqueued.len(),
                    "frozen listener; port marked dead"
                );

                match self.handler.get() {
                    Some(handler) => handler(&enqueued, &domain),
                    None => warn!("no failure handler registered; descriptors dropped"),
                }
            }

            true
        }
    }
}

/// Verifies progress of every waiting listener, recording the counters seen.
/// Returns false on the first frozen listener.
unsafe fn update_status_all_listeners(node: *mut PortNode) -> bool {
    let count = (*node).num_listeners as usize;
    for status in &mut (&mut (*node).listeners_status)[..count] {
        if status.is_waiting() {
            if status.counter() != status.last_verified_counter() {
                status.set_last_verified_counter(status.counter());
            } else {
                return false;
            }
        }
    }
    true
}
