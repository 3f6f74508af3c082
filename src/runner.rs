//! Background worker for a link.
//!
//! The runner owns the radio driver and performs everything the
//! lock-holding state machine may not do itself: filter updates, frame
//! submission, channel sweeps with their dwell periods, and the deferred
//! half of the state-transition timeout.

use embassy_futures::select::{select, Either};
use embassy_time::Timer;

use crate::device::Driver;
use crate::frame;
use crate::link::{DriverOp, FrameBuf, LinkState, ScanRequest, State};

/// Must be polled (`run().await`) for the link to make progress.
pub struct Runner<'a, D: Driver> {
    state: &'a State,
    driver: D,
}

impl<'a, D: Driver> Runner<'a, D> {
    pub(crate) fn new(state: &'a State, driver: D) -> Self {
        Self { state, driver }
    }

    /// Drive the link until it is torn down.
    pub async fn run(&mut self) {
        // Bring-up.
        self.state.with(|s| s.set_state(LinkState::Initialized));
        self.drain_ops().await;

        loop {
            if let Some(request) = self.state.with(|s| s.take_scan()) {
                self.sweep(request).await;
                self.drain_ops().await;
                continue;
            }
            if self.state.link_state(None) == LinkState::Uninitialized {
                self.driver.set_state(LinkState::Uninitialized).await.ok();
                return;
            }

            let armed = self.state.with(|s| s.timer);
            match armed {
                Some((epoch, deadline)) => {
                    match select(self.state.work.wait(), Timer::at(deadline)).await {
                        Either::First(()) => {}
                        // The deferred half of the timeout: take the lock,
                        // check the epoch, and only then demote.
                        Either::Second(()) => self.state.with(|s| s.timer_expired(epoch)),
                    }
                }
                None => self.state.work.wait().await,
            }
            self.drain_ops().await;
        }
    }

    /// One channel sweep: tune, probe, dwell, harvest (the receive path
    /// fills the BSS table concurrently), then join or restore.
    async fn sweep(&mut self, request: ScanRequest) {
        let proceed = self.state.with(|s| {
            if s.state == LinkState::Uninitialized {
                return false;
            }
            s.scan_return = Some(s.state);
            s.set_state(LinkState::Probing);
            true
        });
        if !proceed {
            return;
        }
        self.drain_ops().await;

        let (channels, dwell, mac, rates) = self.state.with(|s| {
            (
                s.properties.channels.clone(),
                s.config.scan_dwell,
                s.properties.mac,
                s.properties.rates.clone(),
            )
        });
        // A pinned BSSID with a known channel probes that channel alone.
        let pinned = request.bssid.and_then(|_| request.channel);

        for &channel in channels.iter() {
            if pinned.is_some_and(|pin| pin != channel) {
                continue;
            }
            // Torn down or demoted while dwelling: leave the table alone.
            if self.state.link_state(None) != LinkState::Probing {
                return;
            }
            if self.driver.set_channel(channel).await.is_err() {
                continue;
            }

            let mut buf = FrameBuf::new();
            let ssid: &[u8] = if request.broadcast { &[] } else { &request.ssid };
            if frame::probe_request(&mut buf, &mac, request.bssid.as_ref(), ssid, &rates, 0).is_ok()
            {
                self.driver.transmit(&buf).await.ok();
            }
            // Keep the transition timer ahead of the sweep so a slow walk
            // of many channels does not demote us mid-scan.
            self.state.with(|s| s.refresh_timer());
            Timer::after(dwell).await;
            self.drain_ops().await;
        }

        self.state.with(|s| s.finish_scan(&request));
    }

    async fn drain_ops(&mut self) {
        loop {
            let op = self.state.with(|s| s.pop_op());
            match op {
                Some(DriverOp::Filter(state)) => {
                    self.driver.set_state(state).await.ok();
                }
                Some(DriverOp::Transmit(mpdu)) => {
                    if self.driver.transmit(&mpdu).await.is_err() {
                        self.state.with(|s| s.stats.dropped += 1);
                    }
                }
                None => return,
            }
        }
    }
}
