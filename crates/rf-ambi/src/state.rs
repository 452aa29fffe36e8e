//! Reconfiguration state machine
//!
//! Two contexts share the engine: the render path (real-time, never blocks)
//! and the control path (setters and codec rebuilds, may block). They
//! coordinate through:
//! - [`CodecStatus`]: whether decoding matrices are usable
//! - [`ProcStatus`]: whether the render path is inside a frame
//! - a generation counter the render path acknowledges at frame boundaries
//!
//! Transitions:
//!
//! | from             | to               | by                              |
//! |------------------|------------------|---------------------------------|
//! | any              | `NotInitialised` | `invalidate` (any config change) |
//! | `NotInitialised` | `Initialising`   | `try_begin_init`                |
//! | `Initialising`   | `Initialised`    | `finish_init` (if not invalidated meanwhile) |

use std::time::Duration;

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use portable_atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};

/// How often a waiting control thread re-checks the render path
const WAIT_RECHECK: Duration = Duration::from_millis(10);

/// Decoder availability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CodecStatus {
    NotInitialised = 0,
    Initialising = 1,
    Initialised = 2,
}

impl CodecStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Initialising,
            2 => Self::Initialised,
            _ => Self::NotInitialised,
        }
    }
}

/// Render path activity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcStatus {
    NotOngoing = 0,
    Ongoing = 1,
}

/// Shared status between render and control paths
pub struct EngineState {
    codec: CachePadded<AtomicU8>,
    proc: CachePadded<AtomicU8>,
    /// Bumped by the control path when it needs a frame boundary
    generation: CachePadded<AtomicU64>,
    /// Last generation the render path saw at a frame start
    observed: CachePadded<AtomicU64>,
    /// Control threads inside `wait_for_render_idle`
    waiters: CachePadded<AtomicUsize>,
    lock: Mutex<()>,
    idle: Condvar,
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineState {
    pub fn new() -> Self {
        Self {
            codec: CachePadded::new(AtomicU8::new(CodecStatus::NotInitialised as u8)),
            proc: CachePadded::new(AtomicU8::new(ProcStatus::NotOngoing as u8)),
            generation: CachePadded::new(AtomicU64::new(0)),
            observed: CachePadded::new(AtomicU64::new(0)),
            waiters: CachePadded::new(AtomicUsize::new(0)),
            lock: Mutex::new(()),
            idle: Condvar::new(),
        }
    }

    pub fn codec_status(&self) -> CodecStatus {
        CodecStatus::from_u8(self.codec.load(Ordering::Acquire))
    }

    pub fn proc_status(&self) -> ProcStatus {
        if self.proc.load(Ordering::Acquire) == ProcStatus::Ongoing as u8 {
            ProcStatus::Ongoing
        } else {
            ProcStatus::NotOngoing
        }
    }

    // ============ Control Path ============

    /// Mark the decoder stale; a running rebuild will not publish
    pub fn invalidate(&self) {
        self.codec.store(CodecStatus::NotInitialised as u8, Ordering::Release);
    }

    /// Claim the rebuild; false if one is running or nothing is stale
    pub fn try_begin_init(&self) -> bool {
        self.codec
            .compare_exchange(
                CodecStatus::NotInitialised as u8,
                CodecStatus::Initialising as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Publish the rebuild; false when a change arrived while building
    pub fn finish_init(&self) -> bool {
        self.codec
            .compare_exchange(
                CodecStatus::Initialising as u8,
                CodecStatus::Initialised as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Abandon a claimed rebuild
    pub fn abort_init(&self) {
        let _ = self.codec.compare_exchange(
            CodecStatus::Initialising as u8,
            CodecStatus::NotInitialised as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Block until the render path is outside any frame that started before this call
    ///
    /// Re-checks every few milliseconds; there is no overall timeout, so a
    /// stalled render thread stalls the caller.
    ///
    /// The generation bump and the status loads pair with the stores in
    /// [`enter_frame`](Self::enter_frame) and are all `SeqCst`: either this
    /// call sees the frame as ongoing, or the frame sees the new generation.
    pub fn wait_for_render_idle(&self) {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let target = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut guard = self.lock.lock();
        while self.proc.load(Ordering::SeqCst) == ProcStatus::Ongoing as u8
            && self.observed.load(Ordering::SeqCst) < target
        {
            self.idle.wait_for(&mut guard, WAIT_RECHECK);
        }
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }

    /// Control threads currently blocked in [`wait_for_render_idle`](Self::wait_for_render_idle)
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }

    // ============ Render Path ============

    /// Frame start: acknowledge pending generations and mark busy
    pub fn enter_frame(&self) {
        self.proc.store(ProcStatus::Ongoing as u8, Ordering::SeqCst);
        let generation = self.generation.load(Ordering::SeqCst);
        self.observed.store(generation, Ordering::SeqCst);
    }

    /// Frame end: mark idle and wake waiting control threads, if any
    pub fn leave_frame(&self) {
        self.proc.store(ProcStatus::NotOngoing as u8, Ordering::SeqCst);
        if self.waiters.load(Ordering::SeqCst) > 0 {
            self.idle.notify_all();
        }
    }
}
