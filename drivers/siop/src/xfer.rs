//! Transfer descriptors, tag allocation, and the channel's free pool, per
//! spec.md §3 "Transfer (xfer)" and §4.4 "Openings and tags".

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::error::{HostError, XferError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct XferHandle(pub u32);

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct XferControl: u32 {
        const ASYNC            = 1 << 0;
        const POLL             = 1 << 1;
        const DATA_IN          = 1 << 2;
        const DATA_OUT         = 1 << 3;
        const SILENT           = 1 << 4;
        const DISCOVERY        = 1 << 5;
        const TAG_SIMPLE        = 1 << 6;
        const TAG_ORDERED       = 1 << 7;
        const TAG_HEAD          = 1 << 8;
        const REQUEUE_ON_RESET  = 1 << 9;
        const REQUEST_SENSE     = 1 << 10;
        const URGENT            = 1 << 11;
        const UNTAG             = 1 << 12;
    }
}

/// Outcome handler attached to an async transfer. Modeled as a tagged enum
/// per spec.md §9's note that this may be "a tagged enum of outcome
/// handlers or a completion channel/future"; this core uses boxed
/// closures, the idiomatic Rust realization of the source's done-callback
/// pointer.
pub type Continuation = Box<dyn FnOnce(&mut CompletedXfer) + Send>;

/// The result handed to a transfer's continuation once it is fully
/// resolved (after retry exhaustion and sense interpretation).
pub struct CompletedXfer {
    pub handle: XferHandle,
    pub host_error: HostError,
    pub scsi_status: u8,
    pub residual: u32,
    pub sense: [u8; 18],
    pub sense_len: u8,
}

pub struct Transfer {
    pub handle: XferHandle,
    pub peripheral: crate::channel::PeripheralHandle,
    pub control: XferControl,
    pub cdb: Vec<u8>,
    pub data_ptr: usize,
    pub data_len: u32,
    pub residual: u32,
    pub retries_remaining: u8,
    pub requeue_count: u8,
    pub timeout_ms: u32,
    pub error: XferError,
    pub scsi_status: u8,
    pub sense: [u8; 18],
    pub sense_len: u8,
    pub tag: Option<u8>,
    pub done: bool,
    pub continuation: Option<Continuation>,
}

impl Transfer {
    pub fn new(
        handle: XferHandle,
        peripheral: crate::channel::PeripheralHandle,
        control: XferControl,
        cdb: Vec<u8>,
        data_ptr: usize,
        data_len: u32,
        retries: u8,
        timeout_ms: u32,
    ) -> Result<Self, XferError> {
        if timeout_ms == 0 {
            return Err(XferError::DriverStuffup);
        }
        // An async transfer must carry a continuation; enforced by the
        // caller (the dispatcher always attaches one before enqueueing an
        // async xfer) — see `reset_for_submission`'s debug_assert.
        Ok(Self {
            handle,
            peripheral,
            control,
            cdb,
            data_ptr,
            data_len,
            residual: data_len,
            retries_remaining: retries,
            requeue_count: 0,
            timeout_ms,
            error: XferError::NoError,
            scsi_status: 0,
            sense: [0; 18],
            sense_len: 0,
            tag: None,
            done: false,
            continuation: None,
        })
    }

    /// Reset state before (re)submission, per spec.md §4.4 `execute` step 3.
    pub fn reset_for_submission(&mut self) {
        debug_assert!(
            self.control.contains(XferControl::ASYNC) == false || self.continuation.is_some(),
            "async transfer must carry a continuation"
        );
        self.done = false;
        self.error = XferError::NoError;
        self.scsi_status = 0;
        self.residual = self.data_len;
    }

    pub fn is_urgent(&self) -> bool {
        self.control.contains(XferControl::URGENT)
    }

    pub fn is_reqsense(&self) -> bool {
        self.control.contains(XferControl::REQUEST_SENSE)
    }
}

/// Per-peripheral tag allocator: 32x8-bit bitmap words (spec.md §4.4).
#[derive(Clone)]
pub struct TagAllocator {
    words: [u32; 8],
}

impl Default for TagAllocator {
    fn default() -> Self {
        Self { words: [u32::MAX; 8] }
    }
}

impl TagAllocator {
    /// Returns the lowest free tag id and clears its bit, or `None` if the
    /// peripheral has exhausted its 256 tag ids.
    pub fn get_tag(&mut self) -> Option<u8> {
        for (word_idx, word) in self.words.iter_mut().enumerate() {
            if *word != 0 {
                let bit = word.trailing_zeros();
                *word &= !(1 << bit);
                return Some((word_idx as u32 * 32 + bit) as u8);
            }
        }
        None
    }

    pub fn put_tag(&mut self, tag: u8) {
        let word_idx = (tag / 32) as usize;
        let bit = tag % 32;
        self.words[word_idx] |= 1 << bit;
    }

    pub fn is_free(&self, tag: u8) -> bool {
        let word_idx = (tag / 32) as usize;
        let bit = tag % 32;
        self.words[word_idx] & (1 << bit) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_is_rejected() {
        let result = Transfer::new(
            XferHandle(0),
            crate::channel::PeripheralHandle { target: 0, lun: 0 },
            XferControl::empty(),
            alloc::vec![0u8; 6],
            0,
            0,
            0,
            0,
        );
        assert!(result.is_err());
    }

    #[test]
    fn tags_are_unique_until_returned() {
        let mut tags = TagAllocator::default();
        let a = tags.get_tag().unwrap();
        let b = tags.get_tag().unwrap();
        assert_ne!(a, b);
        assert!(!tags.is_free(a));
        tags.put_tag(a);
        assert!(tags.is_free(a));
    }

    #[test]
    fn tag_allocator_exhausts_at_256() {
        let mut tags = TagAllocator::default();
        for _ in 0..256 {
            assert!(tags.get_tag().is_some());
        }
        assert!(tags.get_tag().is_none());
    }
}
