//! Unified error types for splitlink.
//!
//! We avoid `alloc` - all error variants carry only fixed-size data.
//! Implements `defmt::Format` for efficient on-target logging.

/// Top-level error type used across the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// No bonded slot is available for the advertising peripheral.
    NoCapacity,

    /// The link does not belong to any reserved or connected slot.
    UnknownLink,

    /// The slot is in the wrong state for the operation
    /// (double release, out-of-range index).
    InvalidState,

    /// The target slot has no established link.
    NotConnected,

    /// The required characteristic handle has not been discovered yet.
    /// Retryable once discovery completes.
    NotYetReady,

    /// The behavior queue stayed full even after evicting its oldest entry.
    QueueFull,

    /// An inbound payload failed structural validation.
    Malformed,

    /// The BLE stack reported an error.
    Transport(TransportError),
}

/// Errors surfaced by `Transport` implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// Scan could not start or stop.
    ScanFailed,
    /// Connection establishment failed.
    ConnectFailed,
    /// GATT service or characteristic discovery failed.
    DiscoveryFailed,
    /// CCC descriptor write for a subscription failed.
    SubscribeFailed,
    /// GATT write failed.
    WriteFailed,
    /// GATT read failed.
    ReadFailed,
    /// The link dropped while an operation was in flight.
    LinkLost,
}

// Convenience conversions

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::Transport(e)
    }
}
