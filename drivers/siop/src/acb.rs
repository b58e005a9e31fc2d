//! Activity Control Block — the SIOP engine's view of a transfer, arranged
//! for DMA consumption by SCRIPTS. Per spec.md §3 "ACB" and §9's
//! arena+index design note.

use alloc::vec::Vec;

use crate::sg::{SgChain, SgEntry};
use crate::sync_negotiate::SyncParams;
use crate::xfer::XferHandle;

/// Handle into [`crate::engine::Adapter`]'s ACB pool. Stable across moves;
/// never dereferenced directly by anything but the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AcbHandle(pub u16);

/// Identify message byte layout (SCSI-2 `IDENTIFY`).
pub const IDENTIFY_BASE: u8 = 0x80;
pub const IDENTIFY_DISCONNECT_ALLOWED: u8 = 0x40;

/// The DMA-visible Data Structure SCRIPTS dereferences through `DSA`.
/// Field order matters: SCRIPTS indexes into this by byte offset, so this
/// type must stay `repr(C)` with no implicit padding reshuffles once an
/// assembled SCRIPTS image depends on exact offsets (tracked by the board
/// support layer, not this crate).
#[derive(Debug, Clone)]
pub struct DataStructure {
    /// Target id (bits 16..24) and pre-loaded sync setup, word 0 of DS per
    /// spec.md §4.1 "Arbitrate, select target by id stored in DS word 0".
    pub target_word: u32,
    pub identify: u8,
    pub command: Vec<u8>,
    pub status: u8,
    pub msg_in: [u8; 1],
    pub msg_in_ext: [u8; 8],
    pub msg_out: [u8; 8],
    pub chain: Vec<SgEntry>,
}

impl DataStructure {
    pub fn new(target: u8, lun: u8, allow_disconnect: bool, cdb: &[u8]) -> Self {
        let mut identify = IDENTIFY_BASE | (lun & 0x07);
        if allow_disconnect {
            identify |= IDENTIFY_DISCONNECT_ALLOWED;
        }
        Self {
            target_word: (target as u32) << 16,
            identify,
            command: cdb.to_vec(),
            status: 0,
            msg_in: [0],
            msg_in_ext: [0; 8],
            msg_out: [0; 8],
            chain: Vec::new(),
        }
    }

    pub fn set_chain(&mut self, chain: &SgChain) {
        self.chain = chain.entries.clone();
    }

    /// Append an outbound SDTR extended message (`msg_out`), per spec.md
    /// §4.1 "append a Synchronous Data Transfer Request extended message".
    pub fn append_sdtr(&mut self, period_ns: u8, offset: u8) {
        self.msg_out = [0x01, 0x03, 0x01, period_ns, offset, 0, 0, 0];
    }
}

/// The SIOP engine's per-transfer bookkeeping, separate from the DMA'd
/// [`DataStructure`] so ordinary Rust state (linkage, residual, current
/// pointer) doesn't need to live in the `repr(C)` region.
pub struct Acb {
    pub ds: DataStructure,
    pub target: u8,
    pub lun: u8,
    pub sync: SyncParams,
    /// Current-buffer pointer / residual, updated on phase change
    /// (spec.md §4.1 "Phase mismatch").
    pub current_buffer: u64,
    pub current_length: u32,
    /// Index into `ds.chain` of the scatter-gather entry in progress.
    pub chain_index: usize,
    pub timeout_ticks: u64,
    pub urgent: bool,
    /// The pipeline-level transfer this ACB is carrying. Non-owning: the
    /// `Transfer` itself lives in the channel's arena (spec.md §9 "weak
    /// back-references (ACB -> Transfer -> user io_handle) are
    /// non-owning"). Lets the engine hand completions, disconnects, and
    /// reset-induced failures back to the right transfer without the
    /// engine itself knowing about `Channel`.
    pub xfer: XferHandle,
    /// The scatter-gather chain built for this data transfer, kept around
    /// so the host's DMA-prepare call can be matched with a `finish_dma`
    /// once the transfer completes (spec.md §4.3). `None` for transfers
    /// with no data phase.
    pub dma_chain: Option<SgChain>,
}

impl Acb {
    pub fn new(target: u8, lun: u8, allow_disconnect: bool, cdb: &[u8], urgent: bool, xfer: XferHandle) -> Self {
        Self {
            ds: DataStructure::new(target, lun, allow_disconnect, cdb),
            target,
            lun,
            sync: SyncParams::asynchronous(),
            current_buffer: 0,
            current_length: 0,
            chain_index: 0,
            timeout_ticks: 0,
            urgent,
            xfer,
            dma_chain: None,
        }
    }

    /// Record `DNAD`/`DBC` off a phase-mismatch interrupt (spec.md §4.1
    /// DSPS fall-through to `M_A`): `dnad` is the address SCRIPTS had
    /// reached in the current chain entry, `dbc` the bytes it had left to
    /// move there. `chain_index` is recovered by finding which entry
    /// `dnad` falls inside; if none matches (shouldn't happen on real
    /// hardware) the previous index is left alone rather than panicking.
    pub fn record_phase_mismatch(&mut self, dnad: u32, dbc: u32) {
        self.current_buffer = dnad as u64;
        self.current_length = dbc;
        if let Some(idx) = self.ds.chain.iter().position(|e| {
            !e.is_terminator() && self.current_buffer >= e.phys_addr && self.current_buffer < e.phys_addr + e.len as u64
        }) {
            self.chain_index = idx;
        }
    }

    /// Reshape the scatter-gather chain after a disconnect mid-transfer:
    /// entry `[0]` becomes `{current_buffer, current_length}` and the
    /// remaining untouched entries shift down, per spec.md §4.1 DSPS
    /// 0xff01/0xff02 handling and E5.
    pub fn reshape_after_disconnect(&mut self) {
        let mut rebuilt = Vec::with_capacity(self.ds.chain.len());
        rebuilt.push(SgEntry { phys_addr: self.current_buffer, len: self.current_length });
        for entry in self.ds.chain.iter().skip(self.chain_index + 1) {
            if entry.is_terminator() {
                break;
            }
            rebuilt.push(*entry);
        }
        rebuilt.push(SgEntry::terminator());
        self.ds.chain = rebuilt;
        self.chain_index = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_byte_encodes_lun_and_disconnect() {
        let ds = DataStructure::new(3, 2, true, &[0x00; 6]);
        assert_eq!(ds.identify, IDENTIFY_BASE | IDENTIFY_DISCONNECT_ALLOWED | 2);
        assert_eq!(ds.target_word, 3 << 16);
    }

    #[test]
    fn disconnect_allowed_bit_absent_when_forbidden() {
        let ds = DataStructure::new(0, 0, false, &[0x00; 6]);
        assert_eq!(ds.identify & IDENTIFY_DISCONNECT_ALLOWED, 0);
    }

    #[test]
    fn phase_mismatch_locates_the_chain_entry_dnad_fell_inside() {
        let mut acb = Acb::new(0, 0, true, &[0x28, 0, 0, 0, 0, 0, 0, 0, 8, 0], false, XferHandle(0));
        acb.ds.chain = alloc::vec![
            SgEntry { phys_addr: 0x1000, len: 0x2000 },
            SgEntry { phys_addr: 0x3000, len: 0x2000 },
            SgEntry { phys_addr: 0x5000, len: 0x2000 },
            SgEntry::terminator(),
        ];
        acb.record_phase_mismatch(0x3400, 0x1c00);
        assert_eq!(acb.chain_index, 1);
        assert_eq!(acb.current_buffer, 0x3400);
        assert_eq!(acb.current_length, 0x1c00);

        // Reshape can now run straight off the recorded state.
        acb.reshape_after_disconnect();
        assert_eq!(acb.ds.chain[0], SgEntry { phys_addr: 0x3400, len: 0x1c00 });
        assert_eq!(acb.ds.chain[1], SgEntry { phys_addr: 0x5000, len: 0x2000 });
        assert!(acb.ds.chain[2].is_terminator());
    }

    #[test]
    fn reshape_moves_current_pointer_to_entry_zero_and_shifts_rest() {
        let mut acb = Acb::new(0, 0, true, &[0x28, 0, 0, 0, 0, 0, 0, 0, 8, 0], false, XferHandle(0));
        acb.ds.chain = alloc::vec![
            SgEntry { phys_addr: 0x1000, len: 0x2000 },
            SgEntry { phys_addr: 0x3000, len: 0x2000 },
            SgEntry { phys_addr: 0x5000, len: 0x2000 },
            SgEntry { phys_addr: 0x7000, len: 0x2000 },
            SgEntry::terminator(),
        ];
        acb.chain_index = 3;
        acb.current_buffer = 0x7400;
        acb.current_length = 0x1c00;
        acb.reshape_after_disconnect();
        assert_eq!(acb.ds.chain[0], SgEntry { phys_addr: 0x7400, len: 0x1c00 });
        assert!(acb.ds.chain[1].is_terminator());
    }
}
