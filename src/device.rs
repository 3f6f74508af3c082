use crate::error::Error;
use crate::link::LinkState;

/// Capability set the radio driver supplies to the MAC.
///
/// All calls are made from the background [`Runner`](crate::Runner) task,
/// never from the receive path, so implementations are free to block on
/// hardware queues.
pub trait Driver {
    /// Tune the radio. The MAC only requests channels present in
    /// [`Properties::channels`](crate::Properties::channels).
    async fn set_channel(&mut self, channel: u8) -> Result<(), Error>;

    /// Notification of a link state change so hardware filters, keys and
    /// BSSID registers can follow.
    async fn set_state(&mut self, state: LinkState) -> Result<(), Error>;

    /// Hand one fully formed MPDU to hardware for transmission.
    async fn transmit(&mut self, mpdu: &[u8]) -> Result<(), Error>;
}
