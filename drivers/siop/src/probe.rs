//! Probe/geometry engine, per spec.md §4.6 and the block-size fast path of
//! §4.7, plus the TEST_UNIT_READY settle-retry supplement (SPEC_FULL.md
//! §2, grounded in `original_source/siop.c`'s `scsi_test_unit_ready` spin
//! loop).

use orion_driver::StorageGeometry;

/// Parsed `INQUIRY` response fields the probe chain cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InquiryInfo {
    pub scsi_version: u8,
    pub removable: bool,
    pub device_type: u8,
}

/// Parse the first 8 bytes of a standard `INQUIRY` response.
pub fn parse_inquiry(data: &[u8]) -> Option<InquiryInfo> {
    if data.len() < 5 {
        return None;
    }
    Some(InquiryInfo {
        device_type: data[0] & 0x1f,
        removable: data[1] & 0x80 != 0,
        scsi_version: data[2] & 0x07,
    })
}

/// Parsed `READ CAPACITY (10)` response: last LBA + block length.
pub fn parse_read_capacity_10(data: &[u8]) -> Option<(u32, u32)> {
    if data.len() < 8 {
        return None;
    }
    let last_lba = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let block_len = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    Some((last_lba, block_len))
}

/// Parsed `READ CAPACITY (16)` response: last LBA (64-bit) + block length.
pub fn parse_read_capacity_16(data: &[u8]) -> Option<(u64, u32)> {
    if data.len() < 12 {
        return None;
    }
    let last_lba = u64::from_be_bytes([data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7]]);
    let block_len = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
    Some((last_lba, block_len))
}

/// `READ CAPACITY (10)` signals "needs the 16-byte form" by returning
/// `0xffffffff` as the last LBA, per spec.md §4.6 step 2.
pub const READ_CAPACITY_10_OVERFLOW: u32 = 0xffff_ffff;

/// Parsed geometry (mode pages 3 "Format Device" + 4 "Rigid Disk Geometry")
/// sufficient to derive a CHS mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeGeometry {
    pub heads: u32,
    pub sectors_per_track: u32,
    pub cylinders: u32,
}

/// Parse mode page 3 (`sectors_per_track` at offset 10..12 of the page, per
/// SCSI-2) from a mode-sense(6) response whose page data starts right
/// after a 4-byte header.
pub fn parse_mode_page_3(data: &[u8]) -> Option<u32> {
    if data.len() < 4 + 12 {
        return None;
    }
    let page = &data[4..];
    Some(u16::from_be_bytes([page[10], page[11]]) as u32)
}

/// Parse mode page 4 (`cylinders` at offset 2..5, `heads` at offset 5) from
/// a mode-sense(6) response.
pub fn parse_mode_page_4(data: &[u8]) -> Option<(u32, u32)> {
    if data.len() < 4 + 6 {
        return None;
    }
    let page = &data[4..];
    let cylinders = u32::from_be_bytes([0, page[2], page[3], page[4]]);
    let heads = page[5] as u32;
    Some((cylinders, heads))
}

/// The last-resort synthesized geometry, per spec.md §4.6 step 4: a fixed
/// 64-head/32-sector-per-track shape, deriving cylinders from the total
/// sector count. Matches scenario-table CHS synthesis for devices that
/// refuse every mode-sense page.
pub fn synthesize_geometry(total_sectors: u64, bytes_per_sector: u32) -> StorageGeometry {
    const HEADS: u32 = 64;
    const SECTORS_PER_TRACK: u32 = 32;
    let per_cylinder = (HEADS * SECTORS_PER_TRACK) as u64;
    let cylinders = if per_cylinder == 0 { 0 } else { (total_sectors / per_cylinder) as u32 };
    StorageGeometry {
        cylinders,
        heads: HEADS,
        sectors_per_track: SECTORS_PER_TRACK,
        bytes_per_sector,
        total_sectors,
    }
}

/// Build the final [`StorageGeometry`] once capacity and (optionally) mode
/// geometry are known, per spec.md §4.6's fallback chain: real mode-page
/// geometry wins when available and consistent, else synthesize.
pub fn resolve_geometry(total_sectors: u64, bytes_per_sector: u32, mode: Option<ModeGeometry>) -> StorageGeometry {
    match mode {
        Some(m) if m.heads > 0 && m.sectors_per_track > 0 => StorageGeometry {
            cylinders: m.cylinders,
            heads: m.heads,
            sectors_per_track: m.sectors_per_track,
            bytes_per_sector,
            total_sectors,
        },
        _ => synthesize_geometry(total_sectors, bytes_per_sector),
    }
}

/// TEST_UNIT_READY settle-retry policy: how many times to retry a
/// NOT_READY status before giving up, and how long to wait between tries,
/// per SPEC_FULL.md §2. Grounded in `original_source/siop.c`'s spin-wait
/// around spin-up.
#[derive(Debug, Clone, Copy)]
pub struct SettleRetry {
    pub attempts_remaining: u8,
    pub delay_ms: u32,
}

impl SettleRetry {
    pub fn new(max_attempts: u8, delay_ms: u32) -> Self {
        Self { attempts_remaining: max_attempts, delay_ms }
    }

    /// Record one NOT_READY response. Returns `true` if another attempt
    /// should be made after `delay_ms`.
    pub fn should_retry(&mut self) -> bool {
        if self.attempts_remaining == 0 {
            return false;
        }
        self.attempts_remaining -= 1;
        self.attempts_remaining > 0 || self.attempts_remaining == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inquiry_parses_version_and_removable_bit() {
        let data = [0x00, 0x80, 0x05, 0x02, 0x1f];
        let info = parse_inquiry(&data).unwrap();
        assert_eq!(info.device_type, 0);
        assert!(info.removable);
        assert_eq!(info.scsi_version, 5);
    }

    #[test]
    fn read_capacity_10_overflow_signals_need_for_16_byte_form() {
        let data = [0xff, 0xff, 0xff, 0xff, 0, 0, 2, 0];
        let (last_lba, block_len) = parse_read_capacity_10(&data).unwrap();
        assert_eq!(last_lba, READ_CAPACITY_10_OVERFLOW);
        assert_eq!(block_len, 512);
    }

    #[test]
    fn mode_geometry_wins_over_synthesis_when_present() {
        let geometry = resolve_geometry(1_000_000, 512, Some(ModeGeometry { heads: 16, sectors_per_track: 63, cylinders: 992 }));
        assert_eq!(geometry.heads, 16);
        assert_eq!(geometry.sectors_per_track, 63);
    }

    #[test]
    fn synthesized_geometry_used_when_mode_sense_unavailable() {
        let geometry = resolve_geometry(1_000_000, 512, None);
        assert_eq!(geometry.heads, 64);
        assert_eq!(geometry.sectors_per_track, 32);
        assert_eq!(geometry.cylinders, 1_000_000 / (64 * 32));
    }

    #[test]
    fn settle_retry_exhausts_after_max_attempts() {
        let mut retry = SettleRetry::new(3, 100);
        assert!(retry.should_retry());
        assert!(retry.should_retry());
        assert!(!retry.should_retry());
    }
}
