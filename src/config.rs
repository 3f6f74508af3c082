use embassy_time::Duration;
use heapless::Vec;

/// Maximum number of characters in an SSID.
pub const MAX_SSID_LEN: usize = 32;

/// Maximum passphrase accepted by the control surface. WPA2-PSK allows up
/// to 64 characters.
pub const MAX_PASSPHRASE_LEN: usize = 64;

/// 802.11b/g channel set; the radio advertises the subset it can tune.
pub const MAX_CHANNELS: usize = 14;

/// Capability bits advertised in association requests.
pub const CAP_ESS: u16 = 0x0001;
pub const CAP_PRIVACY: u16 = 0x0010;

/// Static radio properties, supplied by the driver at registration.
#[derive(Debug, Clone)]
pub struct Properties {
    /// Station MAC address.
    pub mac: [u8; 6],
    /// Channels the radio can tune, in sweep order.
    pub channels: Vec<u8, MAX_CHANNELS>,
    /// Supported rates in 500 kbit/s units, basic rates flagged with 0x80.
    pub rates: Vec<u8, 8>,
    /// Capability bits merged into outgoing management frames.
    pub capabilities: u16,
    /// Seed for the supplicant nonce generator. Feed this from a hardware
    /// entropy source; a predictable seed makes handshake nonces guessable.
    pub nonce_seed: u64,
}

impl Properties {
    pub fn new(mac: [u8; 6], nonce_seed: u64) -> Self {
        Self {
            mac,
            channels: unwrap!(Vec::from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11])),
            rates: unwrap!(Vec::from_slice(&[0x82, 0x84, 0x8b, 0x96, 0x24, 0x30, 0x48, 0x6c])),
            capabilities: CAP_ESS,
            nonce_seed,
        }
    }

    pub fn supports_channel(&self, channel: u8) -> bool {
        self.channels.contains(&channel)
    }
}

/// Protocol timing knobs. The defaults suit a host-driven radio; tighten
/// them on fast interconnects if reconnect latency matters.
#[derive(Debug, Clone)]
pub struct Config {
    /// Time spent listening on each channel during a sweep.
    pub scan_dwell: Duration,
    /// Bound on each of the Probing/Authenticating/Associating/Encrypted
    /// phases before the link is demoted back to Initialized.
    pub state_timeout: Duration,
    /// Bound on the whole 4-way handshake.
    pub handshake_timeout: Duration,
    /// Restart scanning automatically after a failed join.
    pub auto_rescan: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scan_dwell: Duration::from_millis(100),
            state_timeout: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(2),
            auto_rescan: false,
        }
    }
}
