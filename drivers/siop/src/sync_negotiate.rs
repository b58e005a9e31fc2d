//! Synchronous negotiation per target, per spec.md §4.2 and the testable
//! property §8.5 ("Sync-negotiation monotonicity").

/// Per-target synchronous-negotiation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Not yet negotiated (the initial/placeholder state).
    Wide,
    /// An SDTR is outstanding, awaiting the target's response.
    Waits,
    /// Negotiation is settled (synchronous or permanently asynchronous).
    Done,
}

/// Computed SXFER/SBCL bytes programmed into the chip for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncParams {
    pub sxfer: u8,
    pub sbcl: u8,
}

impl SyncParams {
    /// Asynchronous-only: SXFER offset field is zero.
    pub fn asynchronous() -> Self {
        Self { sxfer: 0, sbcl: 0 }
    }
}

pub const MAX_OFFSET: u8 = 8;

/// Bus-clock-scale candidates and their divisors, derived once from
/// `clock_freq` (MHz), per spec.md §9 "Clock-derived timing".
#[derive(Debug, Clone, Copy)]
pub struct ClockTable {
    /// tcp\[sbcl\] in nanoseconds, for sbcl in {1, 2, 3} (index 0 unused).
    pub tcp: [u32; 4],
    /// Fastest period (ns) the chip can propose during negotiation.
    pub minsync: u32,
}

impl ClockTable {
    /// `clock_freq_mhz` is the SCSI core clock, e.g. 40 for the A4091's
    /// 40 MHz SIOP clock.
    pub fn new(clock_freq_mhz: u32) -> Self {
        let base_period_ns = 1_000 / clock_freq_mhz.max(1); // ns per clock cycle
        let tcp = [
            0,
            base_period_ns * 10 / 10,      // divisor 1.0
            base_period_ns * 15 / 10,      // divisor 1.5
            base_period_ns * 20 / 10,      // divisor 2.0
        ];
        // Fastest encodable period is sxfer=0 at the fastest divisor.
        let minsync = tcp[1] * 4;
        Self { tcp, minsync }
    }

    /// Compute `(sxfer, sbcl)` for `period_ns`, per spec.md §4.2: try each
    /// `sbcl` in turn, first candidate whose `sxfer` fits in `[0,7]` wins.
    pub fn encode_period(&self, period_ns: u32) -> Option<(u8, u8)> {
        for sbcl in 1u8..=3 {
            let tcp = self.tcp[sbcl as usize];
            if tcp == 0 {
                continue;
            }
            let sxfer = (period_ns.saturating_sub(1)) / tcp;
            // sxfer must be >= 3 so `sxfer - 3` doesn't underflow, and the
            // result must fit the 3-bit SXFER period field (0..=7).
            if sxfer >= 3 && sxfer - 3 <= 7 {
                return Some(((sxfer - 3) as u8, sbcl));
            }
        }
        None
    }
}

/// Per-target negotiation tracking, owned by the [`crate::engine::Adapter`].
#[derive(Debug, Clone, Copy)]
pub struct TargetSync {
    pub state: SyncState,
    pub params: SyncParams,
    pub sync_inhibited: bool,
}

impl TargetSync {
    pub fn new(sync_inhibited: bool) -> Self {
        Self { state: SyncState::Wide, params: SyncParams::asynchronous(), sync_inhibited }
    }

    /// Called when a selection is about to start: decide whether to append
    /// an outbound SDTR. Transitions `Wide -> Waits` when it does.
    pub fn should_propose_sdtr(&mut self) -> bool {
        if self.sync_inhibited || self.state != SyncState::Wide {
            return false;
        }
        self.state = SyncState::Waits;
        true
    }

    /// The target answered SDTR with `(period_ns, offset)`. Computes and
    /// stores SXFER/SBCL, or falls back to asynchronous if rejected
    /// (offset 0) or unencodable.
    pub fn negotiate_response(&mut self, clock: &ClockTable, period_ns: u32, offset: u8) {
        if offset == 0 {
            self.params = SyncParams::asynchronous();
        } else if let Some((sxfer, sbcl)) = clock.encode_period(period_ns) {
            let offset = core::cmp::min(offset, MAX_OFFSET);
            self.params = SyncParams { sxfer: (sxfer << 4) | offset, sbcl };
        } else {
            self.params = SyncParams::asynchronous();
        }
        self.state = SyncState::Done;
    }

    /// The target ignored the SDTR entirely (completed the command without
    /// answering). Run asynchronous from now on.
    pub fn negotiate_ignored(&mut self) {
        self.params = SyncParams::asynchronous();
        self.state = SyncState::Done;
    }

    /// Reset forces every target back to `Wide` (spec.md §4.2).
    pub fn reset(&mut self) {
        self.state = SyncState::Wide;
        self.params = SyncParams::asynchronous();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_transitions_wide_waits_done() {
        let mut t = TargetSync::new(false);
        assert_eq!(t.state, SyncState::Wide);
        assert!(t.should_propose_sdtr());
        assert_eq!(t.state, SyncState::Waits);
        let clock = ClockTable::new(40);
        t.negotiate_response(&clock, clock.minsync, MAX_OFFSET);
        assert_eq!(t.state, SyncState::Done);
    }

    #[test]
    fn only_reset_returns_to_wide() {
        let mut t = TargetSync::new(false);
        t.should_propose_sdtr();
        let clock = ClockTable::new(40);
        t.negotiate_response(&clock, clock.minsync, MAX_OFFSET);
        assert_eq!(t.state, SyncState::Done);
        t.reset();
        assert_eq!(t.state, SyncState::Wide);
    }

    #[test]
    fn rejected_sdtr_runs_asynchronous() {
        let mut t = TargetSync::new(false);
        t.should_propose_sdtr();
        let clock = ClockTable::new(40);
        t.negotiate_response(&clock, clock.minsync, 0);
        assert_eq!(t.state, SyncState::Done);
        assert_eq!(t.params, SyncParams::asynchronous());
    }

    #[test]
    fn sync_inhibited_target_never_proposes() {
        let mut t = TargetSync::new(true);
        assert!(!t.should_propose_sdtr());
        assert_eq!(t.state, SyncState::Wide);
    }
}
