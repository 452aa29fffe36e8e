//! Render Path Allocation Tests
//!
//! Wraps the system allocator so that allocations made by the current thread
//! can be counted while `AmbiEngine::process` runs.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

use rf_ambi::hoa::sh_count;
use rf_ambi::{AmbiEngine, FRAME_SIZE, LoudspeakerPreset, OutputLayout};

struct CountingAllocator;

static ALLOCATIONS: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static COUNTING: Cell<bool> = const { Cell::new(false) };
}

fn record() {
    if COUNTING.with(Cell::get) {
        ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
    }
}

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        record();
        unsafe { System.alloc(layout) }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        record();
        unsafe { System.alloc_zeroed(layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        record();
        unsafe { System.realloc(ptr, layout, new_size) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) }
    }
}

#[global_allocator]
static GLOBAL: CountingAllocator = CountingAllocator;

const SAMPLE_RATE: u32 = 48_000;
const ORDER: usize = 3;
const BLOCKS: usize = 16;

/// Allocations made by this thread while `f` runs
fn count_allocations(f: impl FnOnce()) -> usize {
    let before = ALLOCATIONS.load(Ordering::Relaxed);
    COUNTING.with(|c| c.set(true));
    f();
    COUNTING.with(|c| c.set(false));
    ALLOCATIONS.load(Ordering::Relaxed) - before
}

fn ready_engine(layout: OutputLayout) -> AmbiEngine {
    let engine = AmbiEngine::new();
    engine.init(SAMPLE_RATE);
    engine.set_order(ORDER);
    engine.set_output_layout(layout);
    assert!(engine.init_codec());
    engine
}

fn test_signal(channels: usize) -> Vec<Vec<f32>> {
    (0..channels)
        .map(|c| (0..FRAME_SIZE).map(|i| ((i * 7 + c * 13) % 101) as f32 / 50.0 - 1.0).collect())
        .collect()
}

struct Host {
    engine: AmbiEngine,
    input: Vec<Vec<f32>>,
    output: Vec<Vec<f32>>,
}

impl Host {
    fn new(layout: OutputLayout) -> Self {
        let engine = ready_engine(layout);
        let input = test_signal(sh_count(ORDER));
        let output = vec![vec![0.0f32; FRAME_SIZE]; engine.num_outputs()];
        let mut host = Self { engine, input, output };
        // Warm up so every lazily sized buffer has its final size
        for _ in 0..4 {
            host.block();
        }
        host
    }

    fn block(&mut self) {
        let (num_inputs, num_outputs) = (self.input.len(), self.output.len());
        self.engine
            .process(&self.input, &mut self.output, num_inputs, num_outputs, FRAME_SIZE);
    }

    fn steady_state_allocations(&mut self) -> usize {
        count_allocations(|| {
            for _ in 0..BLOCKS {
                self.block();
            }
        })
    }

    /// Change the rotation before every block, counting only the render calls
    fn rotating_allocations(&mut self) -> usize {
        let mut total = 0;
        for i in 0..BLOCKS {
            self.engine.set_rotation(i as f32 * 20.0, 10.0, -5.0);
            total += count_allocations(|| self.block());
        }
        total
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LOUDSPEAKER OUTPUT
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn loudspeaker_render_does_not_allocate() {
    let mut host = Host::new(OutputLayout::Preset(LoudspeakerPreset::Atmos7_0_4));
    assert_eq!(host.steady_state_allocations(), 0);
}

#[test]
fn loudspeaker_rotation_change_does_not_allocate() {
    let mut host = Host::new(OutputLayout::Preset(LoudspeakerPreset::Atmos7_0_4));
    assert_eq!(host.rotating_allocations(), 0);
    assert_eq!(host.steady_state_allocations(), 0);
}

// ═══════════════════════════════════════════════════════════════════════════════
// BINAURAL OUTPUT
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn binaural_render_does_not_allocate() {
    let mut host = Host::new(OutputLayout::Binaural);
    assert_eq!(host.steady_state_allocations(), 0);
}

#[test]
fn binaural_rotation_change_does_not_allocate() {
    let mut host = Host::new(OutputLayout::Binaural);
    assert_eq!(host.rotating_allocations(), 0);
    assert_eq!(host.steady_state_allocations(), 0);
}
