//! The upward-facing surface: control operations for the embedding
//! (scan, join, leave, station listing) and the receive entry point the
//! driver feeds raw MPDUs into.

use embassy_time::{with_timeout, Duration};
use heapless::Vec;

use crate::bss::MAX_BSS;
use crate::error::{Error, JoinError};
use crate::frame::{DataFrame, Frame};
use crate::key::CipherType;
use crate::link::{LinkState, ScanRequest, State, Stats};

/// One row of the station table, as shown by a `stations` listing.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StationInfo {
    #[cfg_attr(feature = "defmt", defmt(Debug2Format))]
    pub ssid: Vec<u8, 32>,
    pub bssid: [u8; 6],
    pub channel: u8,
    pub rssi: i8,
    pub cipher: CipherType,
}

/// A decapsulated inbound payload, handed to the network stack above.
#[derive(Debug, PartialEq, Eq)]
pub struct RxData<'p> {
    pub src: [u8; 6],
    pub dst: [u8; 6],
    pub ethertype: u16,
    pub payload: &'p [u8],
}

/// Control handle over a link.
pub struct Control<'a> {
    state: &'a State,
}

impl<'a> Control<'a> {
    pub(crate) fn new(state: &'a State) -> Self {
        Self { state }
    }

    pub fn link_state(&self) -> LinkState {
        self.state.link_state(None)
    }

    /// Start a sweep. Returns as soon as the request is queued; harvested
    /// networks appear in [`Control::stations`] as the sweep progresses.
    pub fn scan(&self, request: ScanRequest) -> Result<(), Error> {
        self.state.with(|s| {
            if s.state == LinkState::Uninitialized {
                return Err(Error::InvalidState);
            }
            s.request_scan(request)
        })?;
        self.state.kick();
        Ok(())
    }

    /// Scan for `ssid` and connect, returning once the link reaches
    /// Associated. A passphrase is required for WPA2-PSK and WEP networks.
    pub async fn join(&self, ssid: &str, passphrase: Option<&str>) -> Result<(), JoinError> {
        let mut request = ScanRequest {
            join: true,
            ..Default::default()
        };
        request.ssid = Vec::from_slice(ssid.as_bytes())
            .map_err(|_| JoinError::Internal(Error::Malformed))?;
        if let Some(passphrase) = passphrase {
            request.passphrase = Vec::from_slice(passphrase.as_bytes())
                .map_err(|_| JoinError::Internal(Error::Malformed))?;
        }

        self.state.with(|s| {
            if s.state == LinkState::Uninitialized {
                return Err(Error::InvalidState);
            }
            s.request_scan(request)
        })?;
        self.state.kick();

        with_timeout(self.join_deadline(), self.state.wait_join_outcome())
            .await
            .map_err(|_| JoinError::Internal(Error::Timeout))?
    }

    /// Upper bound on a whole join: the sweep plus every state phase.
    fn join_deadline(&self) -> Duration {
        self.state.with(|s| {
            let sweep = s.config.scan_dwell * s.properties.channels.len() as u32;
            sweep + s.config.state_timeout * 4 + s.config.handshake_timeout
                + Duration::from_secs(1)
        })
    }

    /// Disassociate from the current BSS. Safe to repeat.
    pub fn leave(&self) -> Result<(), Error> {
        self.state.with(|s| {
            if s.active.is_none() {
                return Ok(());
            }
            let mac = s.properties.mac;
            if let Some((_, entry)) = s.active_entry() {
                let bssid = entry.description.bssid;
                let mut buf = crate::link::FrameBuf::new();
                if crate::frame::deauth(&mut buf, &mac, &bssid, crate::frame::REASON_LEAVING, 0)
                    .is_ok()
                {
                    s.queue_transmit(buf).ok();
                }
            }
            s.set_state(LinkState::Initialized);
            Ok(())
        })?;
        self.state.kick();
        Ok(())
    }

    /// Re-run association against the current AP; traffic sent meanwhile
    /// is held and released in order afterwards.
    pub fn reassociate(&self) -> Result<(), Error> {
        self.state.with(|s| s.start_reassociation())?;
        self.state.kick();
        Ok(())
    }

    /// Tear the link down: timer cancelled, held packets dropped, every
    /// BSS entry released.
    pub fn shutdown(&self) {
        self.state.with(|s| s.set_state(LinkState::Uninitialized));
        self.state.kick();
    }

    /// Queue one outbound payload. `None` destination broadcasts.
    pub fn send(
        &self,
        payload: &[u8],
        dst: Option<[u8; 6]>,
        ethertype: u16,
    ) -> Result<(), Error> {
        let seq = self.state.next_sequence();
        self.state.with(|s| s.send_data(dst, ethertype, payload, seq))?;
        self.state.kick();
        Ok(())
    }

    /// Hold outbound data frames; they accumulate until [`resume`].
    ///
    /// [`resume`]: Control::resume
    pub fn pause(&self) {
        self.state.with(|s| s.pause_data());
    }

    /// Release held data frames to the driver in FIFO order.
    pub fn resume(&self) {
        self.state.with(|s| s.resume_data());
        self.state.kick();
    }

    pub fn data_paused(&self) -> bool {
        self.state.with(|s| s.data_paused())
    }

    /// Snapshot of the BSS table.
    pub fn stations(&self) -> Vec<StationInfo, MAX_BSS> {
        self.state.with(|s| {
            s.bss
                .iter()
                .map(|(_, e)| station_info(e))
                .collect()
        })
    }

    /// The network this link is joined to (or joining), if any.
    pub fn active_bss(&self) -> Option<StationInfo> {
        self.state.with(|s| {
            let handle = s.get_active()?;
            let info = s.bss.get(handle).map(station_info);
            s.bss.release(handle);
            info
        })
    }

    pub fn stats(&self) -> Stats {
        self.state.with(|s| s.stats)
    }
}

/// Receive handle; the driver calls [`Rx::receive`] for every inbound
/// MPDU, from any context. Processing never suspends.
pub struct Rx<'a> {
    state: &'a State,
}

impl<'a> Rx<'a> {
    pub(crate) fn new(state: &'a State) -> Self {
        Self { state }
    }

    /// Classify and process one MPDU. Returns the decapsulated payload
    /// when the frame is data destined for the stack above; management,
    /// control, EAPOL and dropped frames are consumed here.
    ///
    /// `rssi` is the receive strength the radio reported for this frame.
    pub fn receive<'p>(&self, buf: &'p mut [u8], rssi: i8) -> Option<RxData<'p>> {
        let data_frame = self.classify(buf, rssi)?;
        let seq = self.state.next_sequence();
        let result = self.state.with(|s| {
            let r = s.on_data(buf, &data_frame, seq);
            if let Err(e) = r {
                count_rx_error(&mut s.stats, e);
            }
            r
        });
        self.state.kick();

        let (offset, len, ethertype) = result.ok()??;
        Some(RxData {
            src: data_frame.source(),
            dst: data_frame.destination(),
            ethertype,
            payload: &buf[offset..offset + len],
        })
    }

    /// First pass over the frame: handle everything that is not a data
    /// frame and fall out with the data descriptor otherwise.
    fn classify(&self, buf: &[u8], rssi: i8) -> Option<DataFrame> {
        let parsed = match Frame::parse(buf) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.state.with(|s| count_rx_error(&mut s.stats, e));
                return None;
            }
        };
        match parsed {
            Frame::Data(df) => return Some(df),
            Frame::Beacon(ref info) | Frame::ProbeResponse(ref info) => {
                self.state.with(|s| {
                    s.stats.rx_management += 1;
                    s.on_probe_info(info, rssi);
                });
            }
            Frame::Authentication(ref auth) => {
                self.state.with(|s| {
                    s.stats.rx_management += 1;
                    if let Err(e) = s.on_auth(auth) {
                        count_rx_error(&mut s.stats, e);
                    }
                });
            }
            Frame::AssociationResponse(ref resp) | Frame::ReassociationResponse(ref resp) => {
                self.state.with(|s| {
                    s.stats.rx_management += 1;
                    if let Err(e) = s.on_assoc_resp(resp) {
                        count_rx_error(&mut s.stats, e);
                    }
                });
            }
            Frame::Deauthentication { ref header, reason }
            | Frame::Disassociation { ref header, reason } => {
                self.state.with(|s| {
                    s.stats.rx_management += 1;
                    if let Err(e) = s.on_deauth(&header.addr3, reason) {
                        count_rx_error(&mut s.stats, e);
                    }
                });
            }
            Frame::Control => {
                // Hardware consumes the ones that matter; the rest drop.
                self.state.with(|s| s.stats.rx_control += 1);
            }
            Frame::ProbeRequest | Frame::Other => {
                self.state.with(|s| s.stats.rx_management += 1);
            }
        }
        self.state.kick();
        None
    }
}

fn station_info(entry: &crate::bss::BssEntry) -> StationInfo {
    StationInfo {
        ssid: entry.ssid.clone(),
        bssid: entry.description.bssid,
        channel: entry.description.channel,
        rssi: entry.description.rssi,
        cipher: entry.pairwise_cipher(),
    }
}

fn count_rx_error(stats: &mut Stats, e: Error) {
    match e {
        Error::ReplayDetected => stats.replays += 1,
        Error::IntegrityFailed => stats.integrity_failures += 1,
        Error::Malformed => stats.malformed += 1,
        _ => stats.dropped += 1,
    }
}
