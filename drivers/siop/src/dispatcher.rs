//! Upstream request surface and CDB synthesis, per spec.md §6's upstream
//! API and §4.5's CDB-synthesis table.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::channel::{Channel, PeripheralHandle};
use crate::error::HostError;
use crate::pipeline::{self, ExecuteOutcome};
use crate::xfer::{CompletedXfer, Continuation, Transfer, XferControl, XferHandle};

/// Upstream request kinds, per spec.md §6.
#[derive(Debug, Clone)]
pub enum RequestKind {
    Read { lba: u64, block_count: u32 },
    Write { lba: u64, block_count: u32 },
    ScsiDirect { cdb: Vec<u8>, data_len: u32, data_out: bool },
    GetGeometry,
    Start,
    Stop,
    TestReady,
    ChangeNum,
    ChangeState,
    ProtectStatus,
    Format,
    Seek { lba: u64 },
    AddChangeInt,
    RemChangeInt,
    /// Supplemented per SPEC_FULL.md §2, grounded in
    /// `original_source/`'s `DEVICE_QUERY` ioctl.
    DeviceQuery,
}

/// A fully-formed upstream request bound to a peripheral.
pub struct Request {
    pub peripheral: PeripheralHandle,
    pub kind: RequestKind,
    pub data_ptr: usize,
    pub block_size: u32,
    pub timeout_ms: u32,
    pub retries: u8,
}

/// Threshold (in LBA/block-count terms) above which the dispatcher must
/// synthesize a READ/WRITE(10) or (16) instead of the 6-byte form, per
/// spec.md §4.5.
const CDB6_MAX_LBA: u64 = 1 << 21; // 21-bit LBA field in CDB6
const CDB6_MAX_BLOCKS: u32 = 256;
const CDB10_MAX_LBA: u64 = 1 << 32;

/// Synthesize the CDB for a read/write request, choosing the shortest form
/// that can address `lba`/`block_count`, per spec.md §4.5 scenarios E1/E2.
pub fn synthesize_rw_cdb(lba: u64, block_count: u32, is_write: bool) -> Vec<u8> {
    if lba < CDB6_MAX_LBA && block_count <= CDB6_MAX_BLOCKS {
        let opcode = if is_write { 0x0a } else { 0x08 };
        let count = if block_count == 256 { 0 } else { block_count as u8 };
        alloc::vec![
            opcode,
            ((lba >> 16) & 0x1f) as u8,
            ((lba >> 8) & 0xff) as u8,
            (lba & 0xff) as u8,
            count,
            0,
        ]
    } else if lba < CDB10_MAX_LBA && block_count <= u16::MAX as u32 {
        let opcode = if is_write { 0x2a } else { 0x28 };
        let lba = lba as u32;
        alloc::vec![
            opcode,
            0,
            (lba >> 24) as u8,
            (lba >> 16) as u8,
            (lba >> 8) as u8,
            lba as u8,
            0,
            (block_count >> 8) as u8,
            block_count as u8,
            0,
        ]
    } else {
        let opcode = if is_write { 0x8a } else { 0x88 };
        alloc::vec![
            opcode,
            0,
            (lba >> 56) as u8,
            (lba >> 48) as u8,
            (lba >> 40) as u8,
            (lba >> 32) as u8,
            (lba >> 24) as u8,
            (lba >> 16) as u8,
            (lba >> 8) as u8,
            lba as u8,
            (block_count >> 24) as u8,
            (block_count >> 16) as u8,
            (block_count >> 8) as u8,
            block_count as u8,
            0,
            0,
        ]
    }
}

/// Build the [`Transfer`] for a [`Request`], per spec.md §4.5/§6. Returns
/// `None` for request kinds that don't map onto a single SCSI command
/// (handled by the probe/geometry chain instead).
pub fn build_transfer(
    channel: &mut Channel,
    req: Request,
    continuation: Continuation,
) -> Option<XferHandle> {
    let (cdb, data_len, data_out): (Vec<u8>, u32, bool) = match &req.kind {
        RequestKind::Read { lba, block_count } => {
            (synthesize_rw_cdb(*lba, *block_count, false), *block_count * req.block_size, false)
        }
        RequestKind::Write { lba, block_count } => {
            (synthesize_rw_cdb(*lba, *block_count, true), *block_count * req.block_size, true)
        }
        RequestKind::ScsiDirect { cdb, data_len, data_out } => (cdb.clone(), *data_len, *data_out),
        RequestKind::Start => (alloc::vec![0x1b, 0, 0, 0, 0x01, 0], 0, false),
        RequestKind::Stop => (alloc::vec![0x1b, 0, 0, 0, 0x00, 0], 0, false),
        RequestKind::TestReady => (alloc::vec![0x00, 0, 0, 0, 0, 0], 0, false),
        RequestKind::Seek { lba } => {
            let lba = *lba as u32;
            (alloc::vec![0x2b, 0, (lba >> 24) as u8, (lba >> 16) as u8, (lba >> 8) as u8, lba as u8, 0, 0, 0, 0], 0, false)
        }
        RequestKind::Format => (alloc::vec![0x04, 0, 0, 0, 0, 0], 0, true),
        RequestKind::ProtectStatus => (alloc::vec![0x1a, 0, 0x00, 0, 0xff, 0], 255, false),
        // GetGeometry / ChangeNum / ChangeState / AddChangeInt /
        // RemChangeInt / DeviceQuery are answered from cached peripheral
        // state by the probe chain or are pure control-path operations;
        // they never become a bus transfer.
        _ => return None,
    };

    let mut control = if data_len > 0 {
        if data_out {
            XferControl::ASYNC | XferControl::DATA_OUT
        } else {
            XferControl::ASYNC | XferControl::DATA_IN
        }
    } else {
        XferControl::ASYNC
    };
    control.insert(XferControl::TAG_SIMPLE);

    let handle = channel.alloc_xfer(|handle| {
        let mut t = Transfer::new(handle, req.peripheral, control, cdb, req.data_ptr, data_len, req.retries, req.timeout_ms)
            .expect("dispatcher never builds a zero-timeout transfer");
        t.continuation = Some(continuation);
        t
    });
    Some(handle)
}

/// Submit a request: build its transfer and push it into the pipeline, per
/// spec.md §4.4 `execute`.
pub fn submit(channel: &mut Channel, req: Request, on_complete: Box<dyn FnOnce(&mut CompletedXfer) + Send>) -> Option<XferHandle> {
    let handle = build_transfer(channel, req, on_complete)?;
    match pipeline::execute(channel, handle) {
        ExecuteOutcome::Queued => Some(handle),
    }
}

/// Host-visible result of a quick-immediate request that doesn't need the
/// bus at all, per spec.md §6 "quick-immediate" path.
pub fn quick_immediate(kind: &RequestKind) -> Option<HostError> {
    match kind {
        RequestKind::AddChangeInt | RequestKind::RemChangeInt => Some(HostError::Ok),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_transfer_uses_cdb6() {
        let cdb = synthesize_rw_cdb(100, 4, false);
        assert_eq!(cdb[0], 0x08);
        assert_eq!(cdb.len(), 6);
    }

    #[test]
    fn large_lba_uses_cdb10() {
        let cdb = synthesize_rw_cdb(1 << 22, 4, false);
        assert_eq!(cdb[0], 0x28);
        assert_eq!(cdb.len(), 10);
    }

    #[test]
    fn huge_block_count_uses_cdb10_not_6() {
        let cdb = synthesize_rw_cdb(0, 512, true);
        assert_eq!(cdb[0], 0x2a);
    }

    #[test]
    fn lba_beyond_32_bit_uses_cdb16() {
        let cdb = synthesize_rw_cdb(1u64 << 33, 4, false);
        assert_eq!(cdb[0], 0x88);
        assert_eq!(cdb.len(), 16);
    }

    #[test]
    fn write_opcodes_differ_from_read_at_every_cdb_size() {
        assert_eq!(synthesize_rw_cdb(0, 1, true)[0], 0x0a);
        assert_eq!(synthesize_rw_cdb(1 << 22, 1, true)[0], 0x2a);
        assert_eq!(synthesize_rw_cdb(1u64 << 33, 1, true)[0], 0x8a);
    }
}
