//! Adapter configuration, per spec.md §4.1 "Initialization" and SPEC_FULL.md
//! §1's ambient configuration layer plus §2's quirk-table supplement.

use alloc::vec::Vec;

/// Per-target static overrides, looked up by SCSI id at discovery time.
/// Grounded in `original_source/siop.c`'s per-target quirk table (bad
/// targets that lie about tagged queuing, disconnect, or sync capability).
#[derive(Debug, Clone, Copy, Default)]
pub struct TargetQuirk {
    pub no_sync: bool,
    pub no_disconnect: bool,
    pub no_tagged_queuing: bool,
}

/// Adapter-wide configuration, set once at attach time.
pub struct SiopConfig {
    pub initiator_id: u8,
    pub clock_freq_mhz: u32,
    /// Disables synchronous negotiation adapter-wide (spec.md §4.2).
    pub sync_inhibit: bool,
    /// Per-target quirks, indexed by SCSI id (0..target_count).
    pub quirks: Vec<TargetQuirk>,
    pub target_count: u8,
    pub lun_count: u8,
    pub max_openings: u16,
}

impl SiopConfig {
    pub fn new(initiator_id: u8, target_count: u8, lun_count: u8, max_openings: u16, clock_freq_mhz: u32) -> Self {
        let mut quirks = Vec::with_capacity(target_count as usize);
        quirks.resize(target_count as usize, TargetQuirk::default());
        Self {
            initiator_id,
            clock_freq_mhz,
            sync_inhibit: false,
            quirks,
            target_count,
            lun_count,
            max_openings,
        }
    }

    pub fn quirk_for(&self, target: u8) -> TargetQuirk {
        self.quirks.get(target as usize).copied().unwrap_or_default()
    }

    pub fn set_quirk(&mut self, target: u8, quirk: TargetQuirk) {
        if let Some(slot) = self.quirks.get_mut(target as usize) {
            *slot = quirk;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_target_gets_default_quirk() {
        let cfg = SiopConfig::new(7, 8, 8, 16, 40);
        assert!(!cfg.quirk_for(3).no_sync);
    }

    #[test]
    fn quirk_override_is_retrievable() {
        let mut cfg = SiopConfig::new(7, 8, 8, 16, 40);
        cfg.set_quirk(2, TargetQuirk { no_sync: true, no_disconnect: false, no_tagged_queuing: true });
        let q = cfg.quirk_for(2);
        assert!(q.no_sync);
        assert!(q.no_tagged_queuing);
        assert!(!cfg.quirk_for(1).no_sync);
    }
}
