//! The SIOP engine: register-level reset, ACB pool, selection, and
//! interrupt dispatch, per spec.md §4.1.

use alloc::vec::Vec;

use orion_driver::DriverResult;

use crate::acb::{Acb, AcbHandle};
use crate::config::SiopConfig;
use crate::host::TimeHost;
use crate::register::{DmaInterrupt, RegisterFile, ScsiInterrupt};
use crate::scripts::{dsps, Entry, ScriptsImage};
use crate::sync_negotiate::{ClockTable, TargetSync};

/// Running totals kept per target for diagnostics, per SPEC_FULL.md §2
/// ("per-target `TargetStats`" supplement, grounded in
/// `original_source/siop.c`'s `targ_info` counters).
#[derive(Debug, Clone, Copy, Default)]
pub struct TargetStats {
    pub commands: u64,
    pub disconnects: u64,
    pub sync_negotiations: u64,
    pub parity_errors: u64,
    pub selection_timeouts: u64,
}

/// What the engine wants the caller (driver poll loop) to do in response
/// to an interrupt, per spec.md §4.1's dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    /// The running ACB finished normally; hand its outcome to the
    /// pipeline's `done()`.
    Complete(AcbHandle),
    /// The running ACB disconnected mid-transfer; state was saved, no
    /// pipeline action needed yet.
    Disconnected(AcbHandle),
    /// A target reselected; the matching ACB (if any) was resumed.
    Reselected(AcbHandle),
    /// Reselection was interrupted by a pending `SIGP`; retry next poll.
    ReselectInterruptedBySigp,
    /// Selection timed out — no such device, per spec.md §7.
    SelectionTimeout(AcbHandle),
    /// Phase mismatch mid-transfer; engine reloaded the chain pointer and
    /// resumed automatically. No pipeline action needed.
    PhaseMismatchRecovered,
    /// The target answered SDTR; negotiation settled.
    SyncNegotiated(u8),
    /// An unrecognised message-in byte was acknowledged and discarded.
    UnrecognizedMessage,
    /// A channel-level fatal condition: parity, gross error, illegal
    /// instruction, or bus fault. The caller should fail every live
    /// transfer and reset, per spec.md §7.
    FatalChannelError(AcbHandle),
    /// Target dropped the bus without a proper disconnect message
    /// (`SSTAT0.UDC`). Not fatal to the channel: the caller marks the
    /// transfer `BUSY` to provoke a retry, per spec.md §4.1's dispatch
    /// table. The engine has already resumed waiting for reselection.
    UnexpectedDisconnect(AcbHandle),
    /// Nothing pending.
    Idle,
}

/// The 53C710 core: registers, SCRIPTS image, ACB pool, per-target sync
/// state. Holds no `Channel`/pipeline state — those stay in
/// [`crate::channel::Channel`]; the engine only ever deals in
/// [`AcbHandle`]s and hands the driver layer [`EngineEvent`]s to act on.
pub struct Adapter {
    regs: RegisterFile,
    scripts: ScriptsImage,
    clock: ClockTable,
    initiator_id: u8,
    acbs: Vec<Option<Acb>>,
    free_acbs: Vec<AcbHandle>,
    current_nexus: Option<AcbHandle>,
    /// Disconnected ACBs waiting for their target to reselect, per spec.md
    /// §3 "Adapter" ("ready/nexus/free ACB lists (the pipeline internal to
    /// the SIOP engine)") and §4.1's DSPS 0xff01/0xff02 handling.
    nexus_list: Vec<AcbHandle>,
    /// ACBs that were about to select when a higher-priority reselect
    /// (SIGP) interrupted them; pushed back here to retry, per spec.md
    /// §4.1 DSPS 0xff04.
    ready_list: Vec<AcbHandle>,
    sync: Vec<TargetSync>,
    stats: Vec<TargetStats>,
}

impl Adapter {
    pub fn new(regs: RegisterFile, scripts: ScriptsImage, config: &SiopConfig) -> Self {
        let sync = (0..config.target_count)
            .map(|t| TargetSync::new(config.sync_inhibit || config.quirk_for(t).no_sync))
            .collect();
        let stats = alloc::vec![TargetStats::default(); config.target_count as usize];
        Self {
            regs,
            scripts,
            clock: ClockTable::new(config.clock_freq_mhz),
            initiator_id: config.initiator_id,
            acbs: Vec::new(),
            free_acbs: Vec::new(),
            current_nexus: None,
            nexus_list: Vec::new(),
            ready_list: Vec::new(),
            sync,
            stats,
        }
    }

    pub fn stats(&self, target: u8) -> TargetStats {
        self.stats.get(target as usize).copied().unwrap_or_default()
    }

    pub fn sync_state(&self, target: u8) -> Option<&TargetSync> {
        self.sync.get(target as usize)
    }

    /// `true` when no ACB currently owns the bus, i.e. `start()` may be
    /// called. The single-nexus constraint of spec.md §5 "Scheduling
    /// model": one outstanding selection at a time.
    pub fn is_idle(&self) -> bool {
        self.current_nexus.is_none()
    }

    /// Register-level reset sequence, per spec.md §4.1 "Initialization":
    /// assert and drop SCSI reset, clear status latches, program the
    /// initiator id and clock divisors, unmask the interrupts the engine
    /// acts on, and park SCRIPTS at `WaitReselect`.
    ///
    /// Returns the transfers that were in flight anywhere in the engine
    /// (nexus, disconnected, or about-to-select) — spec.md §4.1 "Move all
    /// in-flight ACBs to error completion with error kind RESET." The
    /// caller (which owns the `Channel` the transfers live in) fails each
    /// one with [`crate::error::XferError::Reset`] and runs `pipeline::done`.
    pub fn reset(&mut self, time: &dyn TimeHost) -> DriverResult<Vec<crate::xfer::XferHandle>> {
        self.regs.scntl1_set(0x08)?; // SCNTL1.RST
        time.delay_us(25);
        self.regs.scntl1_set(0x00)?;
        time.delay_us(2);

        // Drain any latched status from the reset itself.
        let _ = self.regs.read_sstat0_dstat()?;
        self.regs.flush_dma_fifo()?;

        self.regs.scid_set(self.initiator_id)?;
        self.regs.scntl0_set(0x80)?; // SCNTL0: enable full-arbitration mode
        self.regs.dcntl_set(0x00)?;
        self.regs.dmode_set(0x00)?;

        self.regs.sien_set(
            ScsiInterrupt::PAR | ScsiInterrupt::RST | ScsiInterrupt::UDC | ScsiInterrupt::SGE | ScsiInterrupt::STO | ScsiInterrupt::M_A,
        )?;
        self.regs.dien_set(DmaInterrupt::IID | DmaInterrupt::BF | DmaInterrupt::ABRT | DmaInterrupt::SIR)?;

        for s in self.sync.iter_mut() {
            s.reset();
        }

        let mut in_flight = Vec::new();
        if let Some(handle) = self.current_nexus.take() {
            in_flight.push(self.acb(handle).xfer);
            self.release_acb(handle);
        }
        for handle in self.nexus_list.drain(..) {
            in_flight.push(self.acb(handle).xfer);
            self.acbs[handle.0 as usize] = None;
            self.free_acbs.push(handle);
        }
        for handle in self.ready_list.drain(..) {
            in_flight.push(self.acb(handle).xfer);
            self.acbs[handle.0 as usize] = None;
            self.free_acbs.push(handle);
        }

        self.regs.dsp_set(self.scripts.address_of(Entry::WaitReselect))?;
        Ok(in_flight)
    }

    /// Pop an ACB that was bumped off selection by a higher-priority
    /// reselect (spec.md §4.1 DSPS 0xff04), for the caller to retry.
    pub fn take_ready(&mut self) -> Option<AcbHandle> {
        self.ready_list.pop()
    }

    /// Allocate an ACB slot, reusing a released one when available.
    pub fn alloc_acb(&mut self, acb: Acb) -> AcbHandle {
        if let Some(handle) = self.free_acbs.pop() {
            self.acbs[handle.0 as usize] = Some(acb);
            handle
        } else {
            let handle = AcbHandle(self.acbs.len() as u16);
            self.acbs.push(Some(acb));
            handle
        }
    }

    pub fn acb(&self, handle: AcbHandle) -> &Acb {
        self.acbs[handle.0 as usize].as_ref().expect("acb handle dangling")
    }

    pub fn acb_mut(&mut self, handle: AcbHandle) -> &mut Acb {
        self.acbs[handle.0 as usize].as_mut().expect("acb handle dangling")
    }

    pub fn release_acb(&mut self, handle: AcbHandle) {
        self.acbs[handle.0 as usize] = None;
        self.free_acbs.push(handle);
    }

    /// Start a transfer: point `DSA` at the ACB's Data Structure and `DSP`
    /// at `ScriptsBase` (arbitrate, select, identify, run phases). Appends
    /// an outbound SDTR to the ACB's `msg_out` first if negotiation is due.
    ///
    /// `dsa_phys` is the physical address of the ACB's [`crate::acb::DataStructure`],
    /// as translated by the caller's [`crate::host::DmaHost::translate`] —
    /// the engine itself never computes physical addresses (spec.md §6
    /// "Physical-address translation for DMA buffers" is a host
    /// collaborator's job, not the core's).
    pub fn start(&mut self, handle: AcbHandle, dsa_phys: u32) -> DriverResult<()> {
        let target = self.acb(handle).target;
        if let Some(sync) = self.sync.get_mut(target as usize) {
            if sync.should_propose_sdtr() {
                let period_ns = (self.clock.minsync) as u8;
                self.acb_mut(handle).ds.append_sdtr(period_ns, crate::sync_negotiate::MAX_OFFSET);
            }
        }
        if let Some(s) = self.stats.get_mut(target as usize) {
            s.commands += 1;
        }
        self.current_nexus = Some(handle);
        self.regs.dsa_set(dsa_phys)?;
        self.regs.dsp_set(self.scripts.address_of(Entry::ScriptsBase))?;
        Ok(())
    }

    /// Poll for and dispatch one pending interrupt, per spec.md §4.1's
    /// table. Returns [`EngineEvent::Idle`] when `ISTAT` shows nothing
    /// latched.
    pub fn interrupt_poll(&mut self) -> DriverResult<EngineEvent> {
        let istat = self.regs.istat()?;
        if !istat.contains(crate::register::Istat::SIP) && !istat.contains(crate::register::Istat::DIP) {
            return Ok(EngineEvent::Idle);
        }

        let (sstat0, dstat) = self.regs.read_sstat0_dstat()?;
        self.regs.flush_dma_fifo()?;

        if sstat0.contains(ScsiInterrupt::PAR) {
            if let Some(target) = self.current_nexus.map(|h| self.acb(h).target) {
                if let Some(s) = self.stats.get_mut(target as usize) {
                    s.parity_errors += 1;
                }
            }
            return Ok(self.fatal_event());
        }
        if sstat0.contains(ScsiInterrupt::SGE) || dstat.contains(DmaInterrupt::BF) || dstat.contains(DmaInterrupt::IID) {
            return Ok(self.fatal_event());
        }
        if sstat0.contains(ScsiInterrupt::STO) {
            let handle = self.current_nexus.take().expect("selection timeout with no nexus");
            let target = self.acb(handle).target;
            if let Some(s) = self.stats.get_mut(target as usize) {
                s.selection_timeouts += 1;
            }
            return Ok(EngineEvent::SelectionTimeout(handle));
        }
        if sstat0.contains(ScsiInterrupt::UDC) {
            let handle = self.current_nexus.take().expect("unexpected disconnect with no nexus");
            self.regs.dsp_set(self.scripts.address_of(Entry::WaitReselect))?;
            return Ok(EngineEvent::UnexpectedDisconnect(handle));
        }
        if sstat0.contains(ScsiInterrupt::M_A) {
            // Phase mismatch: capture where SCRIPTS got to in the current
            // chain entry before it re-enters at `Switch`, so a disconnect
            // that follows (DSPS 0xff01/0xff02) reshapes the chain from the
            // right spot instead of from entry zero.
            if let Some(handle) = self.current_nexus {
                let dbc = self.regs.dbc()?;
                let dnad = self.regs.dnad()?;
                self.acb_mut(handle).record_phase_mismatch(dnad, dbc);
            }
            self.regs.dsp_set(self.scripts.address_of(Entry::Switch))?;
            return Ok(EngineEvent::PhaseMismatchRecovered);
        }

        if dstat.contains(DmaInterrupt::SIR) {
            let code = self.regs.dsps()?;
            return self.dispatch_dsps(code);
        }

        Ok(EngineEvent::Idle)
    }

    fn fatal_event(&mut self) -> EngineEvent {
        match self.current_nexus.take() {
            Some(handle) => EngineEvent::FatalChannelError(handle),
            None => EngineEvent::Idle,
        }
    }

    fn dispatch_dsps(&mut self, code: u32) -> DriverResult<EngineEvent> {
        match code {
            dsps::NORMAL_COMPLETE => {
                let handle = self.current_nexus.take().expect("normal completion with no nexus");
                let target = self.acb(handle).target;
                // The target answered IDENTIFY and ran the command to
                // completion without ever sending an SDTR reply: it ignored
                // or implicitly rejected the negotiation. Settle on
                // asynchronous rather than leaving it in WAITS forever.
                if let Some(sync) = self.sync.get_mut(target as usize) {
                    if sync.state == crate::sync_negotiate::SyncState::Waits {
                        sync.negotiate_ignored();
                    }
                }
                self.regs.dsp_set(self.scripts.address_of(Entry::WaitReselect))?;
                Ok(EngineEvent::Complete(handle))
            }
            dsps::SAVE_DP_DISCONNECT_A | dsps::SAVE_DP_DISCONNECT_B => {
                let handle = self.current_nexus.take().expect("disconnect with no nexus");
                self.acb_mut(handle).reshape_after_disconnect();
                let target = self.acb(handle).target;
                if let Some(s) = self.stats.get_mut(target as usize) {
                    s.disconnects += 1;
                }
                self.nexus_list.push(handle);
                self.regs.dsp_set(self.scripts.address_of(Entry::WaitReselect))?;
                Ok(EngineEvent::Disconnected(handle))
            }
            dsps::RESELECT => {
                let scratch = self.regs.scratch()?;
                let target = scratch & 0x07;
                // LUN isn't exposed in the register map at this point in
                // the sequence (SFBR isn't modeled), so matching is by
                // target only, per spec.md §4.1's simplified reselect path
                // for this core.
                match self.nexus_list.iter().position(|h| self.acb(*h).target == target) {
                    Some(idx) => {
                        let handle = self.nexus_list.remove(idx);
                        self.current_nexus = Some(handle);
                        self.regs.dsp_set(self.scripts.address_of(Entry::Switch))?;
                        Ok(EngineEvent::Reselected(handle))
                    }
                    None => {
                        log::error!("reselect from target {} with no disconnected nexus on file", target);
                        Ok(EngineEvent::Idle)
                    }
                }
            }
            dsps::RESELECT_INTERRUPTED_BY_SIGP => {
                if let Some(handle) = self.current_nexus.take() {
                    self.ready_list.push(handle);
                }
                Ok(EngineEvent::ReselectInterruptedBySigp)
            }
            dsps::UNRECOGNIZED_MSG => {
                self.regs.dsp_set(self.scripts.address_of(Entry::ClearAck))?;
                Ok(EngineEvent::UnrecognizedMessage)
            }
            dsps::SYNC_MSG_IN => {
                let handle = self.current_nexus.expect("sync msg-in with no nexus");
                let target = self.acb(handle).target;
                let msg = self.acb(handle).ds.msg_in_ext;
                let period_ns = msg[3] as u32;
                let offset = msg[4];
                if let Some(sync) = self.sync.get_mut(target as usize) {
                    sync.negotiate_response(&self.clock, period_ns, offset);
                }
                self.acb_mut(handle).sync = self.sync[target as usize].params;
                if let Some(s) = self.stats.get_mut(target as usize) {
                    s.sync_negotiations += 1;
                }
                self.regs.dsp_set(self.scripts.address_of(Entry::Switch))?;
                Ok(EngineEvent::SyncNegotiated(target))
            }
            _ => Ok(EngineEvent::Idle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_stats_start_zeroed() {
        let stats = TargetStats::default();
        assert_eq!(stats.commands, 0);
        assert_eq!(stats.disconnects, 0);
    }
}
