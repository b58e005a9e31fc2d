//! Error taxonomy translator, per spec.md §7.
//!
//! [`XferError`] is the internal kind a transfer fails with; [`HostError`]
//! is the fixed, host-visible code set the dispatcher returns. The mapping
//! in [`XferError::to_host_error`] is the single source of truth — nothing
//! else in this crate invents a `HostError` value.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferError {
    NoError,
    Sense,
    ShortSense,
    DriverStuffup,
    ResourceShortage,
    SelTimeout,
    Timeout,
    Busy,
    Reset,
    Requeue,
}

/// Host-visible error codes, per spec.md §7's "fixed 10-entry table".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostError {
    Ok,
    UnitBusy,
    SelTimeout,
    Phase,
    Dma,
    OpenFail,
    Eio,
    Einval,
    Erofs,
    Enospc,
    Enodev,
}

impl XferError {
    /// The one and only internal-to-host error translation. Sense
    /// interpretation (spec.md §4.4 `complete` step 2) narrows `Sense`
    /// down to a more specific `HostError` *before* this is called in most
    /// paths; this fallback table covers the remaining kinds directly.
    pub fn to_host_error(self) -> HostError {
        match self {
            XferError::NoError => HostError::Ok,
            XferError::Sense | XferError::ShortSense => HostError::Eio,
            XferError::DriverStuffup => HostError::Dma,
            XferError::ResourceShortage => HostError::OpenFail,
            XferError::SelTimeout => HostError::SelTimeout,
            XferError::Timeout => HostError::Phase,
            XferError::Busy => HostError::UnitBusy,
            XferError::Reset => HostError::Phase,
            XferError::Requeue => HostError::Phase,
        }
    }

    pub fn is_fatal(self) -> bool {
        matches!(self, XferError::DriverStuffup)
    }

    /// Whether the pipeline should retry locally while budget remains,
    /// without informing the submitter (spec.md §7 propagation rules).
    pub fn retries_silently(self) -> bool {
        matches!(self, XferError::Busy | XferError::Timeout | XferError::Reset | XferError::Requeue)
    }
}

/// SCSI sense keys the completion path interprets, per spec.md §4.4
/// `complete` step 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenseKey {
    NoSense,
    RecoveredError,
    NotReady,
    IllegalRequest,
    UnitAttention,
    DataProtect,
    AbortedCommand,
    VolumeOverflow,
    Other(u8),
}

impl SenseKey {
    pub fn from_byte(b: u8) -> Self {
        match b & 0x0f {
            0x0 => SenseKey::NoSense,
            0x1 => SenseKey::RecoveredError,
            0x2 => SenseKey::NotReady,
            0x5 => SenseKey::IllegalRequest,
            0x6 => SenseKey::UnitAttention,
            0x7 => SenseKey::DataProtect,
            0xb => SenseKey::AbortedCommand,
            0xd => SenseKey::VolumeOverflow,
            other => SenseKey::Other(other),
        }
    }
}

/// Outcome of interpreting sense data, per spec.md §4.4 step 2's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenseOutcome {
    Success,
    NoDev,
    Einval,
    RetryAsReset,
    MediaChanged,
    Erofs,
    RetryAborted,
    Enospc,
    Eio,
}

/// Interpret `(sense_key, asc, ascq)` per spec.md §4.4 step 2, given
/// whether this command was issued during discovery and whether the
/// peripheral is removable.
pub fn interpret_sense(
    key: SenseKey,
    asc: u8,
    ascq: u8,
    discovery: bool,
    removable: bool,
) -> SenseOutcome {
    match key {
        SenseKey::NoSense | SenseKey::RecoveredError => SenseOutcome::Success,
        SenseKey::NotReady if asc == 0x3a => SenseOutcome::NoDev,
        SenseKey::IllegalRequest if discovery && asc == 0x25 && ascq == 0x00 => SenseOutcome::Einval,
        SenseKey::UnitAttention if asc == 0x29 => SenseOutcome::RetryAsReset,
        SenseKey::UnitAttention if removable => SenseOutcome::MediaChanged,
        SenseKey::DataProtect => SenseOutcome::Erofs,
        SenseKey::AbortedCommand => SenseOutcome::RetryAborted,
        SenseKey::VolumeOverflow => SenseOutcome::Enospc,
        _ => SenseOutcome::Eio,
    }
}

impl SenseOutcome {
    pub fn to_host_error(self) -> Option<HostError> {
        match self {
            SenseOutcome::Success => Some(HostError::Ok),
            SenseOutcome::NoDev => Some(HostError::Enodev),
            SenseOutcome::Einval => Some(HostError::Einval),
            SenseOutcome::Erofs => Some(HostError::Erofs),
            SenseOutcome::Enospc => Some(HostError::Enospc),
            SenseOutcome::Eio => Some(HostError::Eio),
            // These two resolve via retry, not a direct host error.
            SenseOutcome::RetryAsReset | SenseOutcome::RetryAborted => None,
            SenseOutcome::MediaChanged => Some(HostError::Enodev),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_ejected_maps_to_no_dev() {
        let outcome = interpret_sense(SenseKey::NotReady, 0x3a, 0x00, false, true);
        assert_eq!(outcome, SenseOutcome::NoDev);
    }

    #[test]
    fn illegal_request_only_einval_during_discovery() {
        let outcome = interpret_sense(SenseKey::IllegalRequest, 0x25, 0x00, true, false);
        assert_eq!(outcome, SenseOutcome::Einval);
        let outcome = interpret_sense(SenseKey::IllegalRequest, 0x25, 0x00, false, false);
        assert_eq!(outcome, SenseOutcome::Eio);
    }

    #[test]
    fn unit_attention_bus_reset_retries() {
        let outcome = interpret_sense(SenseKey::UnitAttention, 0x29, 0x00, false, false);
        assert_eq!(outcome, SenseOutcome::RetryAsReset);
    }

    #[test]
    fn driver_stuffup_is_the_only_fatal_kind() {
        assert!(XferError::DriverStuffup.is_fatal());
        assert!(!XferError::Timeout.is_fatal());
    }
}
