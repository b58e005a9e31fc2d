//! Downstream (host-OS-facing) collaborator interfaces, per spec §6.
//!
//! The core never talks to real hardware or a real OS directly outside of
//! [`crate::register::RegisterFile`]; everything else — physical address
//! translation, cache-coherent DMA buffer prep, timing — comes in through
//! these traits so the engine and scatter-gather builder stay host-agnostic
//! and unit-testable with a fake implementation.

use alloc::vec::Vec;

/// A physically-contiguous run of host memory, as handed back by
/// [`DmaHost::prepare_dma`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysRun {
    pub phys_addr: u64,
    pub len: usize,
}

/// Direction of a DMA transfer, needed so [`DmaHost::finish_dma`] knows
/// whether to invalidate or flush the host's caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    HostToDevice,
    DeviceToHost,
}

/// Physical-address translation and cache-coherent DMA buffer preparation,
/// per spec §6 "Downstream (host-OS-facing) requirements".
///
/// `prepare_dma` is called iteratively: the first call for a buffer passes
/// `continuing = false`; every subsequent call for the same buffer passes
/// `continuing = true` so the host knows to resume from where the previous
/// run left off. It returns `None` once the buffer is exhausted.
pub trait DmaHost {
    fn prepare_dma(
        &mut self,
        virt_addr: usize,
        remaining: usize,
        continuing: bool,
    ) -> Option<PhysRun>;

    /// Called once, over the *original* buffer bounds, after the transfer
    /// completes (successfully or not) to flush/invalidate caches.
    fn finish_dma(&mut self, virt_addr: usize, len: usize, direction: DmaDirection);

    /// Physical-address translation for a single DMA-visible control
    /// structure (the ACB's Data Structure), per spec §6 "Physical-address
    /// translation for DMA buffers". Unlike [`prepare_dma`] this is a
    /// one-shot lookup: the ACB's `DataStructure` is always contiguous as
    /// far as the chip needs to know, so there is no chunked-run protocol
    /// here — just "what physical address does SCRIPTS use to reach this".
    fn translate(&mut self, virt_addr: usize) -> u64;
}

/// Tick source + delay primitives, per spec §6.
pub trait TimeHost {
    /// Monotonically increasing tick counter, >= 50 Hz resolution.
    fn ticks(&self) -> u64;

    /// Millisecond-capable delay (used by reset sequencing).
    fn delay_ms(&self, ms: u32);

    /// Microsecond-scale delay (used for bus-settle waits).
    fn delay_us(&self, us: u32);
}

/// A trivial in-memory [`DmaHost`] used by unit tests: treats the whole
/// buffer as one physically-contiguous run (fine for property tests that
/// never care about coalescing across real page boundaries; misalignment
/// and chunk-limit behavior is still exercised because the builder caps
/// entries itself).
#[derive(Default)]
pub struct TestDmaHost {
    pub runs: Vec<PhysRun>,
}

impl DmaHost for TestDmaHost {
    fn prepare_dma(&mut self, virt_addr: usize, remaining: usize, continuing: bool) -> Option<PhysRun> {
        if remaining == 0 {
            return None;
        }
        if continuing {
            return None;
        }
        let run = PhysRun { phys_addr: virt_addr as u64, len: remaining };
        self.runs.push(run);
        Some(run)
    }

    fn finish_dma(&mut self, _virt_addr: usize, _len: usize, _direction: DmaDirection) {}

    fn translate(&mut self, virt_addr: usize) -> u64 {
        virt_addr as u64
    }
}

/// A [`TestDmaHost`] that fragments the buffer into fixed-size chunks so
/// scatter-gather chain-building tests can exercise multi-entry chains and
/// coalescing of adjacent chunks.
pub struct ChunkedTestDmaHost {
    pub chunk: usize,
    pub offset: usize,
}

impl ChunkedTestDmaHost {
    pub fn new(chunk: usize) -> Self {
        Self { chunk, offset: 0 }
    }
}

impl DmaHost for ChunkedTestDmaHost {
    fn prepare_dma(&mut self, virt_addr: usize, remaining: usize, continuing: bool) -> Option<PhysRun> {
        if !continuing {
            self.offset = 0;
        }
        if self.offset >= remaining {
            return None;
        }
        let len = core::cmp::min(self.chunk, remaining - self.offset);
        let run = PhysRun { phys_addr: (virt_addr + self.offset) as u64, len };
        self.offset += len;
        Some(run)
    }

    fn finish_dma(&mut self, _virt_addr: usize, _len: usize, _direction: DmaDirection) {}

    fn translate(&mut self, virt_addr: usize) -> u64 {
        virt_addr as u64
    }
}

/// A [`TimeHost`] for tests: ticks are driven explicitly, delays are no-ops.
pub struct TestTimeHost {
    pub tick: core::cell::Cell<u64>,
}

impl Default for TestTimeHost {
    fn default() -> Self {
        Self { tick: core::cell::Cell::new(0) }
    }
}

impl TestTimeHost {
    pub fn advance(&self, by: u64) {
        self.tick.set(self.tick.get() + by);
    }
}

impl TimeHost for TestTimeHost {
    fn ticks(&self) -> u64 {
        self.tick.get()
    }

    fn delay_ms(&self, _ms: u32) {}
    fn delay_us(&self, _us: u32) {}
}
