//! The SCRIPTS image: a pre-assembled DMA program the 53C710 executes to
//! drive SCSI phases. Per spec.md §4.1, the engine never inspects or
//! modifies the program's instructions — it only ever points `DSP` at one
//! of a fixed set of named entry points and reacts to the `DSPS` codes the
//! program raises via `SIR`.
//!
//! The actual microcode bytes are produced by an external SCRIPTS
//! assembler (out of scope per spec.md §1); this module is the contract
//! between that assembler's output and the engine: entry-point symbols and
//! the `DSPS` discriminants the program is required to raise.

/// Named SCRIPTS entry points the engine may set `DSP` to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    /// Arbitrate, select, send identify (+ optional SDTR), transfer CDB,
    /// run data phases, collect status/message-in.
    ScriptsBase,
    /// Re-enter after a phase mismatch; inspects the new phase and resumes
    /// in data-in, data-out, status, command, or message-in.
    Switch,
    /// Park waiting for a reselect with no ACB ready to start.
    WaitReselect,
    /// Acknowledge and discard an unrecognised message-in byte.
    ClearAck,
    /// Resume a data-in phase after reload from a saved pointer.
    DataIn,
    /// Resume a data-out phase after reload from a saved pointer.
    DataOut,
}

/// The `DSPS` values the SCRIPTS image raises via `SIR`, per spec.md §4.1's
/// dispatch table. These are bit-exact with `original_source/siop.c`.
#[allow(dead_code)]
pub mod dsps {
    pub const NORMAL_COMPLETE: u32 = 0xff00;
    pub const SAVE_DP_DISCONNECT_A: u32 = 0xff01;
    pub const SAVE_DP_DISCONNECT_B: u32 = 0xff02;
    pub const RESELECT: u32 = 0xff03;
    pub const RESELECT_INTERRUPTED_BY_SIGP: u32 = 0xff04;
    pub const UNRECOGNIZED_MSG: u32 = 0xff06;
    pub const SYNC_MSG_IN: u32 = 0xff0b;
}

/// Offsets of each entry point within the assembled image. Filled in by the
/// board-support layer that links the SCRIPTS binary; the engine only ever
/// reads through [`ScriptsImage::address_of`].
pub struct ScriptsImage {
    base_addr: u32,
    entries: [(Entry, u32); 6],
}

impl ScriptsImage {
    /// `base_addr` is the physical base address the image is loaded at;
    /// `offsets` gives each entry point's byte offset from `base_addr`, as
    /// produced by the external SCRIPTS assembler.
    pub fn new(base_addr: u32, offsets: [(Entry, u32); 6]) -> Self {
        Self { base_addr, entries: offsets }
    }

    pub fn base_addr(&self) -> u32 {
        self.base_addr
    }

    pub fn address_of(&self, entry: Entry) -> u32 {
        for (e, off) in self.entries.iter() {
            if *e == entry {
                return self.base_addr + off;
            }
        }
        // Every entry must be present; a missing one is a link-time defect
        // in the assembled image, not a runtime condition to recover from.
        panic!("SCRIPTS image missing entry point {:?}", entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> ScriptsImage {
        ScriptsImage::new(
            0x1000,
            [
                (Entry::ScriptsBase, 0x000),
                (Entry::Switch, 0x100),
                (Entry::WaitReselect, 0x140),
                (Entry::ClearAck, 0x160),
                (Entry::DataIn, 0x180),
                (Entry::DataOut, 0x1a0),
            ],
        )
    }

    #[test]
    fn resolves_entry_points_relative_to_base() {
        let img = image();
        assert_eq!(img.address_of(Entry::ScriptsBase), 0x1000);
        assert_eq!(img.address_of(Entry::Switch), 0x1100);
        assert_eq!(img.address_of(Entry::DataOut), 0x11a0);
    }
}
