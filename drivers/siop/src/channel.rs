//! Channel and Peripheral, per spec.md §3.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::xfer::{Transfer, TagAllocator, XferHandle};

/// `(target, lun)` key into a [`Channel`]'s registered peripherals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeripheralHandle {
    pub target: u8,
    pub lun: u8,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChannelFlags: u32 {
        const ACTIVE            = 1 << 0;
        const CAN_GROW_OPENINGS  = 1 << 1;
        const NO_SETTLE_DELAY    = 1 << 2;
        const RESET_PEND         = 1 << 3;
        /// Restart the pending queue after a reset completes.
        const KICK               = 1 << 4;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PeripheralCaps: u16 {
        const SYNC               = 1 << 0;
        const TAGGED_QUEUING     = 1 << 1;
        const LINKED_COMMANDS    = 1 << 2;
        const RELATIVE_ADDRESSING = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QuirkFlags(pub u16);

impl QuirkFlags {
    /// Target never disconnects, so the `IDENTIFY` message must not
    /// advertise disconnect-allowed (spec.md §9 quirk table supplement).
    pub const NO_DISCONNECT: u16 = 1 << 0;
}

pub struct Peripheral {
    pub handle: PeripheralHandle,
    pub scsi_version: u8,
    /// log2(sector size); 0 until discovered.
    pub block_shift: u8,
    pub openings: u8,
    pub openings_in_flight: u8,
    pub caps: PeripheralCaps,
    pub quirks: QuirkFlags,
    pub removable: bool,
    pub media_loaded: bool,
    pub tags: TagAllocator,
    pub recovery_in_progress: bool,
    pub pending_sense_check: Option<XferHandle>,
}

impl Peripheral {
    pub fn new(handle: PeripheralHandle, scsi_version: u8) -> Self {
        Self {
            handle,
            scsi_version,
            block_shift: 0,
            openings: 1,
            openings_in_flight: 0,
            caps: PeripheralCaps::empty(),
            quirks: QuirkFlags::default(),
            removable: false,
            media_loaded: true,
            tags: TagAllocator::default(),
            recovery_in_progress: false,
            pending_sense_check: None,
        }
    }

    pub fn block_size(&self) -> u32 {
        if self.block_shift == 0 {
            0
        } else {
            1u32 << self.block_shift
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.openings_in_flight < self.openings
    }

    pub fn supports_tagged(&self) -> bool {
        self.caps.contains(PeripheralCaps::TAGGED_QUEUING)
    }

    pub fn allow_disconnect(&self) -> bool {
        self.quirks.0 & QuirkFlags::NO_DISCONNECT == 0
    }
}

/// A SCSI bus, per spec.md §3 "Channel".
pub struct Channel {
    pub initiator_id: u8,
    pub target_count: u8,
    pub lun_count: u8,
    pub flags: ChannelFlags,
    pub openings: u16,
    pub max_openings: u16,
    pub in_flight: u16,
    peripherals: Vec<Option<Peripheral>>, // indexed by target*lun_count+lun
    pub pending: VecDeque<XferHandle>,
    pub completion: VecDeque<XferHandle>,
    pub free: Vec<XferHandle>,
    /// Transfer arena. Every handle is `Some` here exactly while it is
    /// live in one of `{free, pending, adapter ready/nexus, completion}` —
    /// see spec.md §8.1 "Ownership of transfers".
    slots: Vec<Option<Transfer>>,
}

impl Channel {
    pub fn new(initiator_id: u8, target_count: u8, lun_count: u8, max_openings: u16) -> Self {
        let slots = target_count as usize * lun_count as usize;
        let mut peripherals = Vec::with_capacity(slots);
        peripherals.resize_with(slots, || None);
        Self {
            initiator_id,
            target_count,
            lun_count,
            flags: ChannelFlags::ACTIVE,
            openings: max_openings,
            max_openings,
            in_flight: 0,
            peripherals,
            pending: VecDeque::new(),
            completion: VecDeque::new(),
            free: Vec::new(),
            slots: Vec::new(),
        }
    }

    /// Allocate a new transfer slot, reusing a released slot when one is
    /// free (spec.md §3 "released to the channel's free list").
    pub fn alloc_xfer(&mut self, build: impl FnOnce(XferHandle) -> Transfer) -> XferHandle {
        if let Some(handle) = self.free.pop() {
            self.slots[handle.0 as usize] = Some(build(handle));
            handle
        } else {
            let handle = XferHandle(self.slots.len() as u32);
            self.slots.push(Some(build(handle)));
            handle
        }
    }

    pub fn xfer(&self, handle: XferHandle) -> &Transfer {
        self.slots[handle.0 as usize].as_ref().expect("xfer handle dangling")
    }

    pub fn xfer_mut(&mut self, handle: XferHandle) -> &mut Transfer {
        self.slots[handle.0 as usize].as_mut().expect("xfer handle dangling")
    }

    /// Return a transfer to the free list. The slot's `Transfer` stays
    /// allocated (for reuse by `alloc_xfer`) but the handle is no longer
    /// considered live.
    pub fn release_xfer(&mut self, handle: XferHandle) {
        self.free.push(handle);
    }

    pub fn all_xfer_handles(&self) -> Vec<XferHandle> {
        (0..self.slots.len() as u32).map(XferHandle).filter(|h| self.slots[h.0 as usize].is_some()).collect()
    }

    fn slot(&self, h: PeripheralHandle) -> usize {
        h.target as usize * self.lun_count as usize + h.lun as usize
    }

    pub fn register_peripheral(&mut self, p: Peripheral) {
        let idx = self.slot(p.handle);
        self.peripherals[idx] = Some(p);
    }

    pub fn unregister_peripheral(&mut self, h: PeripheralHandle) {
        let idx = self.slot(h);
        self.peripherals[idx] = None;
    }

    pub fn peripheral(&self, h: PeripheralHandle) -> Option<&Peripheral> {
        self.peripherals.get(self.slot(h))?.as_ref()
    }

    pub fn peripheral_mut(&mut self, h: PeripheralHandle) -> Option<&mut Peripheral> {
        let idx = self.slot(h);
        self.peripherals.get_mut(idx)?.as_mut()
    }

    pub fn has_adapter_capacity(&self) -> bool {
        self.in_flight < self.openings
    }

    /// Zero every resource-accounting counter: `in_flight`, and each
    /// registered peripheral's `openings_in_flight`, `recovery_in_progress`,
    /// and tag pool. Used after a channel-wide reset (spec.md §4.1), where
    /// every outstanding reservation is moot regardless of whether the
    /// transfer that held it was mid-flight or still queued.
    pub fn reset_resource_counters(&mut self) {
        self.in_flight = 0;
        for p in self.peripherals.iter_mut().flatten() {
            p.openings_in_flight = 0;
            p.recovery_in_progress = false;
            p.tags = TagAllocator::default();
        }
    }

    /// Enqueue ordering per spec.md §4.4 step 6: URGENT transfers go to the
    /// head; everything else appends, except a requeued transfer is
    /// inserted just before the first later entry for the same peripheral
    /// with a lower requeue-count (so repeated retries don't starve).
    pub fn enqueue(&mut self, handle: XferHandle, urgent: bool, requeue: Option<(PeripheralHandle, u8)>) {
        if urgent {
            self.pending.push_front(handle);
            return;
        }
        if let Some((peripheral, requeue_count)) = requeue {
            let pos = self.pending.iter().position(|&h| {
                let t = self.slots[h.0 as usize].as_ref().expect("xfer handle dangling");
                t.peripheral == peripheral && t.requeue_count < requeue_count
            });
            if let Some(pos) = pos {
                self.pending.insert(pos, handle);
                return;
            }
        }
        self.pending.push_back(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peripheral_slot_is_independent_per_target_lun() {
        let mut ch = Channel::new(7, 8, 8, 16);
        ch.register_peripheral(Peripheral::new(PeripheralHandle { target: 0, lun: 0 }, 2));
        ch.register_peripheral(Peripheral::new(PeripheralHandle { target: 1, lun: 0 }, 2));
        assert!(ch.peripheral(PeripheralHandle { target: 0, lun: 0 }).is_some());
        assert!(ch.peripheral(PeripheralHandle { target: 2, lun: 0 }).is_none());
        ch.unregister_peripheral(PeripheralHandle { target: 0, lun: 0 });
        assert!(ch.peripheral(PeripheralHandle { target: 0, lun: 0 }).is_none());
        assert!(ch.peripheral(PeripheralHandle { target: 1, lun: 0 }).is_some());
    }

    #[test]
    fn openings_bound_tracks_adapter_capacity() {
        let mut ch = Channel::new(7, 8, 8, 2);
        assert!(ch.has_adapter_capacity());
        ch.in_flight = 2;
        assert!(!ch.has_adapter_capacity());
    }
}
