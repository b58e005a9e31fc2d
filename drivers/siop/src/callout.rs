//! One-shot timer, per spec.md §3 "Callout" and §5 "Cancellation and
//! timeouts". Grounded in `original_source/callout.h`'s tick-counted
//! callout list; reworked as an owned arena since the source's doubly
//! linked list relies on raw pointers this crate's arena+index design
//! (spec.md §9) replaces throughout.

use alloc::vec::Vec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CalloutHandle(pub u32);

/// What a fired callout means to its owner. The core only ever arms two
/// kinds (spec.md §5): a per-transfer timeout, and a deferred channel
/// thaw/reset debounce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalloutKind {
    TransferTimeout { xfer: crate::xfer::XferHandle },
    DeferredThaw,
}

struct Entry {
    ticks_remaining: u64,
    kind: CalloutKind,
    active: bool,
}

/// A tick-driven callout list. `run` is called once per tick by the
/// consumer context; it returns every callout that fired this tick.
#[derive(Default)]
pub struct CalloutList {
    entries: Vec<Entry>,
}

impl CalloutList {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn reset(&mut self, ticks: u64, kind: CalloutKind) -> CalloutHandle {
        let idx = self.entries.iter().position(|e| !e.active);
        let entry = Entry { ticks_remaining: ticks, kind, active: true };
        match idx {
            Some(i) => {
                self.entries[i] = entry;
                CalloutHandle(i as u32)
            }
            None => {
                self.entries.push(entry);
                CalloutHandle((self.entries.len() - 1) as u32)
            }
        }
    }

    pub fn stop(&mut self, handle: CalloutHandle) -> bool {
        if let Some(e) = self.entries.get_mut(handle.0 as usize) {
            let was_active = e.active;
            e.active = false;
            was_active
        } else {
            false
        }
    }

    pub fn pending(&self, handle: CalloutHandle) -> bool {
        self.entries.get(handle.0 as usize).map(|e| e.active).unwrap_or(false)
    }

    /// Cancel the still-armed `TransferTimeout` for `xfer`, if any. Used
    /// once a transfer's bus work is known to be finished, so a stale
    /// timeout never fires against a reused [`crate::xfer::XferHandle`].
    pub fn stop_for_xfer(&mut self, xfer: crate::xfer::XferHandle) -> bool {
        let idx = self.entries.iter().position(|e| {
            e.active && matches!(e.kind, CalloutKind::TransferTimeout { xfer: x } if x == xfer)
        });
        match idx {
            Some(i) => {
                self.entries[i].active = false;
                true
            }
            None => false,
        }
    }

    /// Advance every active callout by one tick; returns the kinds that
    /// fired (ticks_remaining reached zero), deactivating them.
    pub fn run_tick(&mut self) -> Vec<CalloutKind> {
        let mut fired = Vec::new();
        for e in self.entries.iter_mut() {
            if !e.active {
                continue;
            }
            if e.ticks_remaining == 0 {
                e.active = false;
                fired.push(e.kind);
                continue;
            }
            e.ticks_remaining -= 1;
            if e.ticks_remaining == 0 {
                e.active = false;
                fired.push(e.kind);
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xfer::XferHandle;

    #[test]
    fn fires_after_exact_tick_count() {
        let mut list = CalloutList::new();
        let h = list.reset(3, CalloutKind::TransferTimeout { xfer: XferHandle(0) });
        assert!(list.pending(h));
        assert!(list.run_tick().is_empty());
        assert!(list.run_tick().is_empty());
        let fired = list.run_tick();
        assert_eq!(fired.len(), 1);
        assert!(!list.pending(h));
    }

    #[test]
    fn stop_prevents_firing() {
        let mut list = CalloutList::new();
        let h = list.reset(1, CalloutKind::DeferredThaw);
        assert!(list.stop(h));
        assert!(list.run_tick().is_empty());
    }

    #[test]
    fn stop_for_xfer_cancels_only_the_matching_timeout() {
        let mut list = CalloutList::new();
        let target = XferHandle(4);
        let other = XferHandle(5);
        list.reset(10, CalloutKind::TransferTimeout { xfer: other });
        let h = list.reset(10, CalloutKind::TransferTimeout { xfer: target });
        assert!(list.stop_for_xfer(target));
        assert!(!list.pending(h));
        assert!(!list.stop_for_xfer(target));
    }

    #[test]
    fn slots_are_reused_after_firing() {
        let mut list = CalloutList::new();
        let h1 = list.reset(0, CalloutKind::DeferredThaw);
        let fired = list.run_tick();
        assert_eq!(fired.len(), 1);
        let h2 = list.reset(5, CalloutKind::DeferredThaw);
        assert_eq!(h1, h2);
    }
}
