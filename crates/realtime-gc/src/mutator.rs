//! The mutator thread table and the stop-the-world collaborator contract.
//!
//! Every thread that touches the heap registers itself once via
//! [`MutatorThreads::register`]. From then on it must call
//! [`MutatorThreads::safepoint`] reasonably often (the allocator calls it on
//! every slow-path allocation): when the collector has asked for a flip,
//! `safepoint` spills the calling thread's callee-saved registers onto its
//! own stack, records its current stack pointer and cached stack base, and
//! blocks until the collector has finished snapshotting every thread.
//!
//! This is a cooperative safepoint in place of signal-based preemption. A real-time
//! embedder controls where its own threads call into the allocator, so
//! "stop the world" here means "the next few threads to allocate will block
//! briefly," not an asynchronous signal handler.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{GcError, GcResult};

/// A mutator's registered stack bounds, `(low, high)` addresses, queried
/// once at registration time.
fn current_stack_bounds() -> (usize, usize) {
    #[cfg(target_os = "linux")]
    {
        linux_stack_bounds()
    }
    #[cfg(not(target_os = "linux"))]
    {
        fallback_stack_bounds()
    }
}

#[cfg(target_os = "linux")]
fn linux_stack_bounds() -> (usize, usize) {
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return fallback_stack_bounds();
        }
        let mut base: *mut libc::c_void = std::ptr::null_mut();
        let mut size: libc::size_t = 0;
        let ok = libc::pthread_attr_getstack(&attr, &mut base, &mut size) == 0;
        libc::pthread_attr_destroy(&mut attr);
        if !ok || base.is_null() {
            return fallback_stack_bounds();
        }
        (base as usize, base as usize + size)
    }
}

/// Best-effort fallback when the platform offers no stack-bounds query: a
/// fixed window around the current stack pointer. Conservative scanning
/// only ever misses roots if this window is too small, so this is a
/// correctness limitation on unsupported platforms, documented as such
/// rather than silently assumed safe.
fn fallback_stack_bounds() -> (usize, usize) {
    const ASSUMED_STACK_BYTES: usize = 8 * 1024 * 1024;
    let here = &0u8 as *const u8 as usize;
    (here.saturating_sub(ASSUMED_STACK_BYTES / 2), here + ASSUMED_STACK_BYTES / 2)
}

/// Spill the current thread's callee-saved registers so that any object
/// reference a compiler is keeping only in a register (not yet written to
/// the stack) becomes visible to a conservative stack scan of the calling
/// frames. Returns the spilled words; callers treat them exactly like a
/// stack range.
#[cfg_attr(not(any(target_arch = "x86_64", target_arch = "aarch64")), allow(unreachable_code))]
pub fn spill_registers() -> [usize; 6] {
    #[cfg(target_arch = "x86_64")]
    {
        let (rbx, rbp, r12, r13, r14, r15): (usize, usize, usize, usize, usize, usize);
        // SAFETY: pure register reads; `nop` performs no memory access.
        unsafe {
            std::arch::asm!(
                "nop",
                out("rbx") rbx,
                out("rbp") rbp,
                out("r12") r12,
                out("r13") r13,
                out("r14") r14,
                out("r15") r15,
            );
        }
        return [rbx, rbp, r12, r13, r14, r15];
    }
    #[cfg(target_arch = "aarch64")]
    {
        let (x19, x20, x21, x22, x23, x28): (usize, usize, usize, usize, usize, usize);
        // SAFETY: pure register reads; `nop` performs no memory access.
        unsafe {
            std::arch::asm!(
                "nop",
                out("x19") x19,
                out("x20") x20,
                out("x21") x21,
                out("x22") x22,
                out("x23") x23,
                out("x28") x28,
            );
        }
        return [x19, x20, x21, x22, x23, x28];
    }
    #[allow(unreachable_code)]
    [0; 6]
}

/// One registered mutator's bookkeeping.
struct MutatorEntry {
    stack_low: usize,
    stack_high: usize,
    parked: AtomicBool,
    /// Populated by the parking thread at a safepoint; read by the
    /// collector while every mutator is parked.
    snapshot: Mutex<Option<ThreadSnapshot>>,
}

/// What the collector needs from a parked mutator: its live stack range
/// (from the current stack pointer up to the cached base) and its spilled
/// registers.
#[derive(Clone, Copy)]
pub struct ThreadSnapshot {
    pub stack_pointer: usize,
    pub stack_high: usize,
    pub registers: [usize; 6],
}

/// The registered-thread table plus the stop-the-world coordination state.
pub struct MutatorThreads {
    /// Guards structural changes to `threads` — acquired before any group
    /// lock when registering or unregistering a thread.
    total_threads_lock: Mutex<Vec<Arc<MutatorEntry>>>,
    stop_requested: AtomicBool,
    parked_count: AtomicUsize,
    resume_gate: Condvar,
    park_gate: Condvar,
}

thread_local! {
    static THIS_THREAD: std::cell::RefCell<Option<Arc<MutatorEntry>>> = const { std::cell::RefCell::new(None) };
}

impl MutatorThreads {
    #[must_use]
    pub fn new() -> Self {
        Self {
            total_threads_lock: Mutex::new(Vec::new()),
            stop_requested: AtomicBool::new(false),
            parked_count: AtomicUsize::new(0),
            resume_gate: Condvar::new(),
            park_gate: Condvar::new(),
        }
    }

    /// Register the calling thread as a mutator. Must be called once per
    /// thread before it allocates or calls [`Self::safepoint`].
    pub fn register(&self) {
        let (low, high) = current_stack_bounds();
        let entry = Arc::new(MutatorEntry {
            stack_low: low,
            stack_high: high,
            parked: AtomicBool::new(false),
            snapshot: Mutex::new(None),
        });
        self.total_threads_lock.lock().push(Arc::clone(&entry));
        THIS_THREAD.with(|cell| *cell.borrow_mut() = Some(entry));
    }

    /// Remove the calling thread from the table. Must be called before the
    /// thread exits.
    pub fn unregister(&self) {
        if let Some(entry) = THIS_THREAD.with(|cell| cell.borrow_mut().take()) {
            self.total_threads_lock.lock().retain(|t| !Arc::ptr_eq(t, &entry));
        }
    }

    pub(crate) fn registered_count(&self) -> usize {
        self.total_threads_lock.lock().len()
    }

    /// Called by a mutator thread at a point where it holds no references
    /// that exist only in registers it is about to clobber and its own
    /// stack is in a scannable state (i.e. not mid-unwind). If the
    /// collector has requested a flip, spills registers, records a
    /// snapshot, and blocks until the collector releases every thread.
    pub fn safepoint(&self) {
        if !self.stop_requested.load(Ordering::Acquire) {
            return;
        }
        let entry = THIS_THREAD.with(|cell| cell.borrow().clone());
        let Some(entry) = entry else { return };
        let registers = spill_registers();
        let stack_pointer = &registers as *const _ as usize;
        *entry.snapshot.lock() = Some(ThreadSnapshot {
            stack_pointer,
            stack_high: entry.stack_high,
            registers,
        });
        entry.parked.store(true, Ordering::Release);
        self.parked_count.fetch_add(1, Ordering::AcqRel);
        self.park_gate.notify_all();

        let mut guard = self.total_threads_lock.lock();
        while self.stop_requested.load(Ordering::Acquire) {
            self.resume_gate.wait(&mut guard);
        }
        drop(guard);
        entry.parked.store(false, Ordering::Release);
        self.parked_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Ask every registered mutator to park at its next safepoint, then
    /// block until all of them have. Returns a snapshot per thread. The
    /// collector must call [`Self::resume_all`] once it is done reading
    /// these snapshots and root-scanning from them.
    ///
    /// Per §5, this waits for `total_threads - 1` to park, not
    /// `total_threads`: when the calling thread is itself a registered
    /// mutator (the common synchronous-collection path — a mutator calling
    /// `collect_cycle` directly), it is busy running the collector and can
    /// never reach its own `safepoint()`, so it is excluded from both the
    /// park-count target and the expected snapshot count. A dedicated,
    /// never-registered collector thread (e.g. `spawn_collector`'s
    /// background loop) waits for every registered mutator instead.
    pub fn stop_the_world(&self) -> GcResult<Vec<ThreadSnapshot>> {
        self.stop_requested.store(true, Ordering::Release);
        let caller_is_mutator = THIS_THREAD.with(|cell| cell.borrow().is_some());
        let mut guard = self.total_threads_lock.lock();
        let target = if caller_is_mutator {
            guard.len().saturating_sub(1)
        } else {
            guard.len()
        };
        while self.parked_count.load(Ordering::Acquire) < target {
            self.park_gate.wait(&mut guard);
        }
        // Collect snapshots and check completeness under the same lock
        // acquisition that just confirmed every currently registered thread
        // is parked — re-acquiring the lock for this check after returning
        // would leave a window where a newly registered thread makes the
        // counts disagree despite nothing actually being wrong.
        let snapshots: Vec<ThreadSnapshot> = guard.iter().filter_map(|entry| *entry.snapshot.lock()).collect();
        if snapshots.len() != target {
            return Err(GcError::InvariantViolation(
                "stop-the-world snapshot count did not match the registered thread count",
            ));
        }
        Ok(snapshots)
    }

    /// Release every parked mutator.
    pub fn resume_all(&self) {
        let guard = self.total_threads_lock.lock();
        for entry in guard.iter() {
            *entry.snapshot.lock() = None;
        }
        drop(guard);
        self.stop_requested.store(false, Ordering::Release);
        self.resume_gate.notify_all();
    }
}

impl Default for MutatorThreads {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    #[test]
    fn register_and_unregister_round_trip() {
        let threads = MutatorThreads::new();
        threads.register();
        assert_eq!(threads.registered_count(), 1);
        threads.unregister();
        assert_eq!(threads.registered_count(), 0);
    }

    #[test]
    fn stop_the_world_waits_for_every_registered_thread() {
        let threads = Arc::new(MutatorThreads::new());
        let running = Arc::new(AtomicBool::new(true));
        let barrier = Arc::new(Barrier::new(2));
        let t_handle = {
            let threads = Arc::clone(&threads);
            let running = Arc::clone(&running);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                threads.register();
                barrier.wait();
                // Mirrors real mutator usage: call safepoint() repeatedly
                // (the allocator does this on every slow-path allocation)
                // rather than once, so whichever call lands after the
                // collector sets `stop_requested` is the one that parks.
                while running.load(Ordering::Acquire) {
                    threads.safepoint();
                    std::thread::yield_now();
                }
                threads.unregister();
            })
        };
        barrier.wait();
        let snapshots = threads.stop_the_world().unwrap();
        assert_eq!(snapshots.len(), 1);
        threads.resume_all();
        running.store(false, Ordering::Release);
        t_handle.join().unwrap();
    }
}
