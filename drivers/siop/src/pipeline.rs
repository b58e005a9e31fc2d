//! The request pipeline: submission, completion, retry policy, and
//! channel reset coalescing, per spec.md §4.4.

use alloc::vec::Vec;

use crate::channel::{Channel, ChannelFlags};
use crate::error::{interpret_sense, HostError, SenseKey, SenseOutcome, XferError};
use crate::xfer::{CompletedXfer, Transfer, XferControl, XferHandle};

/// A request-sense transfer synthesised by `done()`. The caller (the
/// engine/adapter) runs it synchronously and feeds its result back into
/// `complete()` via [`SenseData::take_and_release`].
pub struct SenseRequest {
    pub xfer: XferHandle,
}

/// Sense bytes extracted from a completed REQUEST SENSE transfer, copied
/// out of the channel's arena so `complete()` never needs to hold a
/// borrow of `Channel` alongside a `&mut Channel`.
pub struct SenseData {
    pub sense: [u8; 18],
    pub sense_len: u8,
}

impl SenseData {
    /// Copy the sense bytes out of `handle`'s slot and release it. Call
    /// this once the synthesized REQUEST SENSE transfer completes.
    pub fn take_and_release(channel: &mut Channel, handle: XferHandle) -> Self {
        let (sense, sense_len) = {
            let t = channel.xfer(handle);
            (t.sense, t.sense_len)
        };
        channel.release_xfer(handle);
        Self { sense, sense_len }
    }
}

/// What `execute()` wants the caller to do next.
pub enum ExecuteOutcome {
    /// The transfer was enqueued; it may or may not be immediately
    /// runnable — call [`dequeue_runnable`] to find out.
    Queued,
}

/// Submit a transfer for execution, per spec.md §4.4 `execute`.
///
/// Performs steps 1-6 (validate, legacy lun encoding, reset state, tag
/// decision, poll override, enqueue). [`dequeue_runnable`] drains what
/// adapter/peripheral capacity allows.
pub fn execute(channel: &mut Channel, handle: XferHandle) -> ExecuteOutcome {
    let peripheral_handle = channel.xfer(handle).peripheral;
    let scsi_version = channel
        .peripheral(peripheral_handle)
        .map(|p| p.scsi_version)
        .unwrap_or(0);
    let supports_tagged = channel
        .peripheral(peripheral_handle)
        .map(|p| p.supports_tagged())
        .unwrap_or(false);

    {
        let xfer = channel.xfer_mut(handle);
        xfer.reset_for_submission();

        // Legacy lun-in-CDB encoding for SCSI-2-or-older devices (spec.md
        // §4.4 step 2 / §9 "Legacy lun-in-CDB").
        if scsi_version <= 2 && xfer.cdb.len() > 1 {
            xfer.cdb[1] = (xfer.cdb[1] & 0x1f) | ((peripheral_handle.lun & 0x07) << 5);
        }

        if !supports_tagged {
            xfer.control.remove(XferControl::TAG_SIMPLE | XferControl::TAG_ORDERED | XferControl::TAG_HEAD);
        }
    }

    let urgent = channel.xfer(handle).is_urgent();
    let requeue_count = channel.xfer(handle).requeue_count;
    let requeue = if requeue_count > 0 {
        Some((peripheral_handle, requeue_count))
    } else {
        None
    };
    channel.enqueue(handle, urgent, requeue);
    ExecuteOutcome::Queued
}

/// Pop the next runnable transfer from the pending queue: peripheral has
/// capacity, adapter has capacity, and an URGENT transfer always jumps the
/// queue regardless of capacity (recovery commands per spec.md §4.4 step
/// 7). Reserves the adapter/tag resources for whatever it returns.
pub fn dequeue_runnable(channel: &mut Channel) -> Option<XferHandle> {
    let mut skipped = Vec::new();
    let mut result = None;

    while let Some(handle) = channel.pending.pop_front() {
        let peripheral_handle = channel.xfer(handle).peripheral;
        let urgent = channel.xfer(handle).is_urgent();
        let runnable = if urgent {
            true
        } else {
            let peripheral = channel.peripheral(peripheral_handle);
            let recovery_blocked = peripheral.map(|p| p.recovery_in_progress).unwrap_or(false);
            let has_capacity = peripheral.map(|p| p.has_capacity()).unwrap_or(false);
            !recovery_blocked && has_capacity && channel.has_adapter_capacity()
        };

        if runnable {
            result = Some(handle);
            break;
        } else {
            skipped.push(handle);
        }
    }

    for handle in skipped.into_iter().rev() {
        channel.pending.push_front(handle);
    }

    if let Some(handle) = result {
        reserve_resources(channel, handle);
    }
    result
}

fn reserve_resources(channel: &mut Channel, handle: XferHandle) {
    let urgent = channel.xfer(handle).is_urgent();
    let peripheral_handle = channel.xfer(handle).peripheral;

    if urgent {
        if let Some(p) = channel.peripheral_mut(peripheral_handle) {
            p.recovery_in_progress = true;
        }
        return;
    }

    channel.in_flight += 1;
    let wants_tag = channel.xfer(handle).control.contains(XferControl::TAG_SIMPLE);
    let tag = if wants_tag {
        channel.peripheral_mut(peripheral_handle).and_then(|p| {
            p.openings_in_flight += 1;
            p.tags.get_tag()
        })
    } else {
        if let Some(p) = channel.peripheral_mut(peripheral_handle) {
            p.openings_in_flight += 1;
        }
        None
    };

    let xfer = channel.xfer_mut(handle);
    if tag.is_none() {
        xfer.control.insert(XferControl::UNTAG);
    }
    xfer.tag = tag;
}

/// Release the resources reserved by `reserve_resources`, per spec.md
/// §4.4 `done()`: "Releases the adapter resource; releases the tag or the
/// UNTAG mark."
fn release_resources(channel: &mut Channel, handle: XferHandle) {
    let urgent = channel.xfer(handle).is_urgent();
    let peripheral_handle = channel.xfer(handle).peripheral;

    if urgent {
        if let Some(p) = channel.peripheral_mut(peripheral_handle) {
            p.recovery_in_progress = false;
        }
        return;
    }

    channel.in_flight = channel.in_flight.saturating_sub(1);
    let tag = channel.xfer(handle).tag;
    if let Some(p) = channel.peripheral_mut(peripheral_handle) {
        p.openings_in_flight = p.openings_in_flight.saturating_sub(1);
        if let Some(tag) = tag {
            p.tags.put_tag(tag);
        }
    }
    let xfer = channel.xfer_mut(handle);
    xfer.control.remove(XferControl::UNTAG);
    xfer.tag = None;
}

/// Called from the engine (interrupt context) when a transfer's bus work
/// finishes, per spec.md §4.4 `done()`.
///
/// Returns a [`SenseRequest`] when the status demands one; the caller must
/// run it, extract its result with [`SenseData::take_and_release`], and
/// pass that into `complete()`.
pub fn done(channel: &mut Channel, handle: XferHandle) -> Option<SenseRequest> {
    release_resources(channel, handle);
    channel.xfer_mut(handle).done = true;

    let status_check = channel.xfer(handle).scsi_status == 0x02;
    let is_reqsense = channel.xfer(handle).is_reqsense();
    let peripheral_handle = channel.xfer(handle).peripheral;

    if status_check && !is_reqsense {
        if let Some(p) = channel.peripheral_mut(peripheral_handle) {
            p.pending_sense_check = Some(handle);
        }
    }

    let has_error = channel.xfer(handle).error != XferError::NoError;
    let polled = channel.xfer(handle).control.contains(XferControl::POLL);

    if has_error || !polled {
        channel.completion.push_back(handle);
    }

    if status_check && !is_reqsense {
        Some(synthesize_sense_request(channel, handle))
    } else {
        None
    }
}

fn synthesize_sense_request(channel: &mut Channel, original: XferHandle) -> SenseRequest {
    let peripheral = channel.xfer(original).peripheral;
    let cdb = alloc::vec![0x03, 0, 0, 0, 18, 0]; // REQUEST SENSE, alloc length 18
    let sense_xfer = channel.alloc_xfer(|handle| {
        let mut control = XferControl::REQUEST_SENSE | XferControl::URGENT | XferControl::DATA_IN;
        control.insert(XferControl::SILENT);
        Transfer::new(handle, peripheral, control, cdb, 0, 18, 0, 1_000).expect("valid sense xfer")
    });
    SenseRequest { xfer: sense_xfer }
}

/// Translate and retry-decide a completed transfer, per spec.md §4.4
/// `complete()`. Returns `Some(handle)` if the transfer was re-enqueued
/// (still live), or `None` once it has been finally resolved
/// (continuation invoked, slot released).
pub fn complete(channel: &mut Channel, handle: XferHandle, sense: Option<SenseData>) -> Option<XferHandle> {
    if let Some(sense) = sense {
        apply_sense_result(channel, handle, &sense);
    }

    let error = channel.xfer(handle).error;
    let host_error = translate_error(channel, handle, error);

    let should_retry = match host_error {
        Ok(_) => false,
        Err(RetryDecision::Retry) => channel.xfer(handle).retries_remaining > 0,
        Err(RetryDecision::RetryIfPeripheralExists) => {
            let peripheral_handle = channel.xfer(handle).peripheral;
            channel.peripheral(peripheral_handle).is_some() && channel.xfer(handle).retries_remaining > 0
        }
        Err(RetryDecision::Final(_)) => false,
    };

    if should_retry {
        requeue(channel, handle);
        return Some(handle);
    }

    let final_error = match host_error {
        Ok(e) => e,
        Err(RetryDecision::Retry) | Err(RetryDecision::RetryIfPeripheralExists) => error.to_host_error(),
        Err(RetryDecision::Final(e)) => e,
    };

    finalize(channel, handle, final_error);
    None
}

enum RetryDecision {
    Retry,
    RetryIfPeripheralExists,
    Final(HostError),
}

fn apply_sense_result(channel: &mut Channel, handle: XferHandle, sense: &SenseData) {
    let xfer = channel.xfer_mut(handle);
    let n = core::cmp::min(sense.sense.len(), xfer.sense.len());
    xfer.sense[..n].copy_from_slice(&sense.sense[..n]);
    xfer.sense_len = sense.sense_len.min(n as u8);
    if xfer.error == XferError::NoError {
        xfer.error = XferError::Sense;
    }
}

fn translate_error(channel: &Channel, handle: XferHandle, error: XferError) -> Result<HostError, RetryDecision> {
    let xfer = channel.xfer(handle);
    match error {
        XferError::NoError => Ok(HostError::Ok),
        XferError::Sense => {
            let key = SenseKey::from_byte(xfer.sense.get(2).copied().unwrap_or(0));
            let asc = xfer.sense.get(12).copied().unwrap_or(0);
            let ascq = xfer.sense.get(13).copied().unwrap_or(0);
            let discovery = xfer.control.contains(XferControl::DISCOVERY);
            let removable = channel
                .peripheral(xfer.peripheral)
                .map(|p| p.removable)
                .unwrap_or(false);
            let outcome = interpret_sense(key, asc, ascq, discovery, removable);
            match outcome {
                SenseOutcome::RetryAsReset | SenseOutcome::RetryAborted => Err(RetryDecision::Retry),
                other => Ok(other.to_host_error().unwrap_or(HostError::Eio)),
            }
        }
        XferError::ShortSense => Ok(HostError::Eio),
        XferError::Busy => Err(RetryDecision::Retry),
        XferError::SelTimeout => Err(RetryDecision::RetryIfPeripheralExists),
        XferError::Timeout | XferError::Reset | XferError::Requeue => Err(RetryDecision::Retry),
        XferError::DriverStuffup | XferError::ResourceShortage => Err(RetryDecision::Final(HostError::Eio)),
    }
}

fn requeue(channel: &mut Channel, handle: XferHandle) {
    let peripheral_handle = channel.xfer(handle).peripheral;
    let requeue_count = {
        let xfer = channel.xfer_mut(handle);
        xfer.requeue_count += 1;
        xfer.error = XferError::NoError;
        xfer.scsi_status = 0;
        xfer.done = false;
        xfer.requeue_count
    };
    channel.enqueue(handle, false, Some((peripheral_handle, requeue_count)));
}

fn finalize(channel: &mut Channel, handle: XferHandle, host_error: HostError) {
    let (scsi_status, residual, sense, sense_len, continuation) = {
        let xfer = channel.xfer_mut(handle);
        (xfer.scsi_status, xfer.residual, xfer.sense, xfer.sense_len, xfer.continuation.take())
    };

    if let Some(k) = continuation {
        let mut completed = CompletedXfer {
            handle,
            host_error,
            scsi_status,
            residual,
            sense,
            sense_len,
        };
        k(&mut completed);
    }

    channel.release_xfer(handle);
}

/// Called when a per-transfer callout fires, per spec.md §5
/// "Cancellation and timeouts".
///
/// If other transfers are active on the channel, coalesces into a
/// deferred reset (`RESET_PEND`); the last in-flight transfer's `done()`
/// leaves the bus idle for [`should_reset_now`] to notice.
pub fn timeout_fired(channel: &mut Channel, handle: XferHandle) -> bool {
    channel.xfer_mut(handle).error = XferError::Timeout;
    let others_active = channel.in_flight > 1;
    if others_active {
        channel.flags.insert(ChannelFlags::RESET_PEND);
    }
    done(channel, handle);
    !others_active
}

/// Checked after every completion: if `RESET_PEND` is set and the bus is
/// now idle, the reset must run exactly once (spec.md §8.8).
pub fn should_reset_now(channel: &Channel) -> bool {
    channel.flags.contains(ChannelFlags::RESET_PEND) && channel.in_flight == 0
}

pub fn clear_reset_pend(channel: &mut Channel) {
    channel.flags.remove(ChannelFlags::RESET_PEND);
    channel.flags.insert(ChannelFlags::KICK);
}

/// Fail every live transfer with `RESET`, per spec.md §4.1 reset sequence
/// and §7 "channel-level fatal event". A transfer carrying
/// `REQUEUE_ON_RESET` is resubmitted instead of failed. Every reservation a
/// transfer may have held (tag, opening, adapter slot) is moot once the bus
/// itself has been reset, so counters are zeroed wholesale rather than
/// released one reservation at a time.
pub fn fail_all_with_reset(channel: &mut Channel) {
    channel.pending.clear();
    let mut to_requeue = Vec::new();

    for handle in channel.all_xfer_handles() {
        if channel.free.contains(&handle) {
            continue;
        }
        if channel.xfer(handle).control.contains(XferControl::REQUEUE_ON_RESET) {
            let xfer = channel.xfer_mut(handle);
            xfer.done = false;
            xfer.error = XferError::NoError;
            xfer.scsi_status = 0;
            xfer.tag = None;
            to_requeue.push(handle);
            continue;
        }
        let xfer = channel.xfer_mut(handle);
        xfer.error = XferError::Reset;
        xfer.done = true;
        xfer.tag = None;
        if !channel.completion.contains(&handle) {
            channel.completion.push_back(handle);
        }
    }

    channel.reset_resource_counters();
    for handle in to_requeue {
        channel.enqueue(handle, false, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Peripheral, PeripheralHandle};
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use spin::Mutex;

    fn make_channel() -> Channel {
        let mut ch = Channel::new(7, 8, 1, 4);
        let mut p = Peripheral::new(PeripheralHandle { target: 0, lun: 0 }, 2);
        p.openings = 2;
        ch.register_peripheral(p);
        ch
    }

    #[test]
    fn openings_bound_holds_across_reserve_release() {
        let mut ch = make_channel();
        let ph = PeripheralHandle { target: 0, lun: 0 };
        let h1 = ch.alloc_xfer(|h| {
            Transfer::new(h, ph, XferControl::ASYNC, alloc::vec![0x28; 10], 0, 512, 1, 1000).unwrap()
        });
        let h2 = ch.alloc_xfer(|h| {
            Transfer::new(h, ph, XferControl::ASYNC, alloc::vec![0x28; 10], 0, 512, 1, 1000).unwrap()
        });
        execute(&mut ch, h1);
        execute(&mut ch, h2);
        let r1 = dequeue_runnable(&mut ch).unwrap();
        let r2 = dequeue_runnable(&mut ch).unwrap();
        assert!(ch.peripheral(ph).unwrap().openings_in_flight <= ch.peripheral(ph).unwrap().openings);
        done(&mut ch, r1);
        done(&mut ch, r2);
        assert_eq!(ch.peripheral(ph).unwrap().openings_in_flight, 0);
    }

    #[test]
    fn retry_budget_is_respected() {
        let mut ch = make_channel();
        let ph = PeripheralHandle { target: 0, lun: 0 };
        let calls: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));
        let calls2 = calls.clone();
        let h = ch.alloc_xfer(|h| {
            let mut t = Transfer::new(h, ph, XferControl::ASYNC, alloc::vec![0x28; 10], 0, 512, 2, 1000).unwrap();
            t.continuation = Some(Box::new(move |_c| {
                *calls2.lock() += 1;
            }));
            t
        });
        execute(&mut ch, h);
        let mut attempts = 0;
        loop {
            let running = match dequeue_runnable(&mut ch) {
                Some(r) => r,
                None => break,
            };
            attempts += 1;
            ch.xfer_mut(running).error = XferError::Timeout;
            done(&mut ch, running);
            if complete(&mut ch, running, None).is_none() {
                break;
            }
        }
        assert_eq!(attempts, 3); // retries=2 -> 3 attempts total
        assert_eq!(*calls.lock(), 1);
    }

    #[test]
    fn requeue_on_reset_survives_fail_all_with_reset() {
        let mut ch = make_channel();
        let ph = PeripheralHandle { target: 0, lun: 0 };
        let keep = ch.alloc_xfer(|h| {
            Transfer::new(h, ph, XferControl::ASYNC | XferControl::REQUEUE_ON_RESET, alloc::vec![0x28; 10], 0, 512, 1, 1000).unwrap()
        });
        let drop = ch.alloc_xfer(|h| {
            Transfer::new(h, ph, XferControl::ASYNC, alloc::vec![0x28; 10], 0, 512, 1, 1000).unwrap()
        });
        execute(&mut ch, keep);
        execute(&mut ch, drop);
        dequeue_runnable(&mut ch);
        dequeue_runnable(&mut ch);

        fail_all_with_reset(&mut ch);

        assert!(ch.pending.contains(&keep));
        assert!(!ch.pending.contains(&drop));
        assert_eq!(ch.xfer(drop).error, XferError::Reset);
        assert_eq!(ch.xfer(keep).error, XferError::NoError);
        assert_eq!(ch.in_flight, 0);
        assert_eq!(ch.peripheral(ph).unwrap().openings_in_flight, 0);
    }

    #[test]
    fn reset_coalesces_to_a_single_pending_reset() {
        let mut ch = make_channel();
        let ph = PeripheralHandle { target: 0, lun: 0 };
        let h1 = ch.alloc_xfer(|h| Transfer::new(h, ph, XferControl::ASYNC, alloc::vec![0x28; 10], 0, 512, 0, 1000).unwrap());
        let h2 = ch.alloc_xfer(|h| Transfer::new(h, ph, XferControl::ASYNC, alloc::vec![0x28; 10], 0, 512, 0, 1000).unwrap());
        execute(&mut ch, h1);
        execute(&mut ch, h2);
        let r1 = dequeue_runnable(&mut ch).unwrap();
        let r2 = dequeue_runnable(&mut ch).unwrap();
        assert_eq!(ch.in_flight, 2);

        let reset_now = timeout_fired(&mut ch, r1);
        assert!(!reset_now);
        assert!(ch.flags.contains(ChannelFlags::RESET_PEND));

        ch.xfer_mut(r2).error = XferError::NoError;
        done(&mut ch, r2);
        assert!(should_reset_now(&ch));
    }
}
