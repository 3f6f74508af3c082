/// Errors surfaced by the MAC sublayer.
///
/// Receive-path failures are never returned to the driver; they are
/// counted in [`Stats`](crate::link::Stats) and the frame is dropped.
/// Send-path and control-surface failures are returned to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// An event arrived in a state that does not expect it.
    InvalidState,
    /// The peer did not respond before the state timer expired.
    Timeout,
    /// A scan is already in progress and the request was not background.
    AlreadyScanning,
    /// Channel or feature outside the radio's capabilities.
    Unsupported,
    /// Received packet number not strictly greater than the replay counter.
    ReplayDetected,
    /// CCMP MIC or WEP ICV verification failed.
    IntegrityFailed,
    /// Frame failed to parse.
    Malformed,
    /// 4-way handshake message out of order, bad MIC, or timed out.
    HandshakeFailed,
    /// Transmit packet number reached 2^48 - 1; the key must be renewed.
    Exhausted,
    /// A fixed pool or queue is full.
    NoMemory,
}

/// Error returned when attempting to join a wireless network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum JoinError {
    /// No BSS with the requested SSID was found by the scan.
    SsidNotFound,
    /// The BSS requires a cipher this station does not support.
    UnsupportedCipher,
    /// Passphrase missing for a protected network, or too long.
    BadCredentials,
    Internal(Error),
}

impl From<Error> for JoinError {
    fn from(e: Error) -> Self {
        JoinError::Internal(e)
    }
}
