//! Per-link shared state: the 802.11 connection state machine, the
//! pause/resume TX pipeline, the state-transition timer, and the event
//! handlers the receive path feeds.
//!
//! All mutation happens under one blocking mutex. Driver calls are never
//! made from under it; the state setter queues filter/transmit operations
//! that the [`Runner`](crate::runner::Runner) performs asynchronously,
//! and timer expiry is handed back the same way.

use core::cell::RefCell;
use core::future::poll_fn;
use core::task::{Context, Poll};

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_sync::waitqueue::WakerRegistration;
use embassy_time::Instant;
use heapless::{Deque, FnvIndexMap, Vec};
use portable_atomic::{AtomicU16, Ordering};

use crate::bss::{BssEntry, BssHandle, BssTable};
use crate::config::{Config, Properties, CAP_PRIVACY};
use crate::crypto;
use crate::error::{Error, JoinError};
use crate::frame::{self, AssocResponse, AuthBody, DataFrame, ProbeInfo, ETHERTYPE_EAPOL};
use crate::handshake::{self, NonceReader, Supplicant, Update};
use crate::key::{CipherType, Key};
use crate::rsn;

/// Largest MPDU this crate assembles or accepts: Ethernet MTU plus MAC,
/// SNAP and CCMP overhead.
pub const MAX_MPDU: usize = 1600;

const PAUSE_QUEUE_DEPTH: usize = 8;
const OPS_QUEUE_DEPTH: usize = 16;
const DUP_CACHE: usize = 4;

const SEQ_MASK: u16 = 0x0fff;

pub type FrameBuf = Vec<u8, MAX_MPDU>;

/// Connection lifecycle. Declaration order is the monitoring order: an
/// active BSS exists exactly from `Authenticating` up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkState {
    Uninitialized,
    Initialized,
    Probing,
    Authenticating,
    Associating,
    Reassociating,
    Encrypted,
    Associated,
}

/// Per-link frame accounting.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Stats {
    pub rx_management: u32,
    pub rx_control: u32,
    pub rx_data: u32,
    pub dropped: u32,
    pub duplicates: u32,
    pub replays: u32,
    pub integrity_failures: u32,
    pub malformed: u32,
    pub handshake_failures: u32,
}

/// Scan parameters. Ephemeral; nothing here outlives the sweep.
#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    /// Restore the current state after the sweep instead of going idle.
    pub background: bool,
    /// Probe with a wildcard SSID rather than a directed one.
    pub broadcast: bool,
    /// Join the strongest matching BSS once the sweep completes.
    pub join: bool,
    /// Pin the sweep to one BSSID; with a known channel this probes that
    /// channel only.
    pub bssid: Option<[u8; 6]>,
    pub channel: Option<u8>,
    pub ssid: Vec<u8, 32>,
    pub passphrase: Vec<u8, 64>,
}

/// Work the runner performs on the link's behalf, in queue order.
pub(crate) enum DriverOp {
    Filter(LinkState),
    Transmit(FrameBuf),
}

const FLAG_DATA_PAUSED: u8 = 0x01;
const FLAG_TIMER_QUEUED: u8 = 0x02;

pub(crate) struct Shared {
    pub(crate) state: LinkState,
    flags: u8,
    pub(crate) config: Config,
    pub(crate) properties: Properties,

    pub(crate) bss: BssTable,
    pub(crate) active: Option<BssHandle>,

    paused: Deque<FrameBuf, PAUSE_QUEUE_DEPTH>,
    ops: Deque<DriverOp, OPS_QUEUE_DEPTH>,

    /// Epoch-stamped deadline for the state timer. The epoch invalidates
    /// expirations that lost the race with a real transition.
    pub(crate) timer: Option<(u32, Instant)>,
    timer_epoch: u32,

    pub(crate) pending_scan: Option<ScanRequest>,
    /// State to restore once a sweep completes without a join.
    pub(crate) scan_return: Option<LinkState>,
    /// Remembered join parameters for automatic retry.
    last_join: Option<ScanRequest>,

    join_error: Option<JoinError>,
    nonces: NonceReader,

    /// Last seen sequence control per transmitter, for duplicate drops.
    dup: FnvIndexMap<[u8; 6], u16, DUP_CACHE>,

    pub(crate) stats: Stats,

    state_waker: WakerRegistration,
}

/// Storage for one 802.11 link. Lives as long as the interface.
pub struct State {
    shared: Mutex<NoopRawMutex, RefCell<Shared>>,
    /// Outbound data sequence counter; atomic so senders need not hold
    /// the link lock to allocate.
    sequence: AtomicU16,
    /// Wakes the runner whenever queued work appears.
    pub(crate) work: Signal<NoopRawMutex, ()>,
}

impl State {
    pub fn new(properties: Properties, config: Config) -> Self {
        let nonces = NonceReader::new(&properties.mac, properties.nonce_seed);
        Self {
            shared: Mutex::new(RefCell::new(Shared {
                state: LinkState::Uninitialized,
                flags: FLAG_DATA_PAUSED,
                config,
                properties,
                bss: BssTable::new(),
                active: None,
                paused: Deque::new(),
                ops: Deque::new(),
                timer: None,
                timer_epoch: 0,
                pending_scan: None,
                scan_return: None,
                last_join: None,
                join_error: None,
                nonces,
                dup: FnvIndexMap::new(),
                stats: Stats::default(),
                state_waker: WakerRegistration::new(),
            })),
            sequence: AtomicU16::new(0),
            work: Signal::new(),
        }
    }

    /// Next outbound data sequence number, modulo 4096. Management frames
    /// are numbered by hardware and do not draw from this counter.
    pub(crate) fn next_sequence(&self) -> u16 {
        self.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1) & SEQ_MASK
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut Shared) -> R) -> R {
        self.shared.lock(|s| f(&mut s.borrow_mut()))
    }

    pub fn link_state(&self, cx: Option<&mut Context>) -> LinkState {
        self.with(|s| {
            if let Some(cx) = cx {
                s.state_waker.register(cx.waker());
            }
            s.state
        })
    }

    /// Resolution of the current join attempt, either way.
    pub(crate) async fn wait_join_outcome(&self) -> Result<(), JoinError> {
        poll_fn(|cx| {
            self.with(|s| {
                s.state_waker.register(cx.waker());
                if s.state == LinkState::Associated {
                    return Poll::Ready(Ok(()));
                }
                match s.join_error.take() {
                    Some(e) => Poll::Ready(Err(e)),
                    None => Poll::Pending,
                }
            })
        })
        .await
    }

    pub(crate) fn kick(&self) {
        self.work.signal(());
    }
}

impl Shared {
    pub(crate) fn data_paused(&self) -> bool {
        self.flags & FLAG_DATA_PAUSED != 0
    }

    pub(crate) fn timer_queued(&self) -> bool {
        self.flags & FLAG_TIMER_QUEUED != 0
    }

    #[cfg(test)]
    pub(crate) fn paused_len(&self) -> usize {
        self.paused.len()
    }

    fn wake_observers(&mut self) {
        self.state_waker.wake();
    }

    fn push_op(&mut self, op: DriverOp) -> Result<(), Error> {
        self.ops.push_back(op).map_err(|_| Error::NoMemory)
    }

    pub(crate) fn pop_op(&mut self) -> Option<DriverOp> {
        self.ops.pop_front()
    }

    pub(crate) fn queue_transmit(&mut self, mpdu: FrameBuf) -> Result<(), Error> {
        self.push_op(DriverOp::Transmit(mpdu))
    }

    /// Hold outbound data. Assumes the link lock is held. Idempotent.
    pub(crate) fn pause_data(&mut self) {
        self.flags |= FLAG_DATA_PAUSED;
    }

    /// Release outbound data, splicing held frames ahead of new traffic
    /// in their original order. Assumes the link lock is held.
    pub(crate) fn resume_data(&mut self) {
        self.flags &= !FLAG_DATA_PAUSED;
        while let Some(mpdu) = self.paused.pop_front() {
            if self.ops.push_back(DriverOp::Transmit(mpdu)).is_err() {
                self.stats.dropped += 1;
            }
        }
    }

    fn arm_timer(&mut self, interval: embassy_time::Duration) {
        self.timer_epoch = self.timer_epoch.wrapping_add(1);
        self.flags |= FLAG_TIMER_QUEUED;
        self.timer = Some((self.timer_epoch, Instant::now() + interval));
    }

    /// Push the deadline out while a sweep is walking channels.
    pub(crate) fn refresh_timer(&mut self) {
        if self.state == LinkState::Probing {
            self.arm_timer(self.config.state_timeout);
        }
    }

    pub(crate) fn disarm_timer(&mut self) {
        self.timer_epoch = self.timer_epoch.wrapping_add(1);
        self.flags &= !FLAG_TIMER_QUEUED;
        self.timer = None;
    }

    /// Runner upcall once an armed deadline passes. Only an expiry whose
    /// epoch still matches may demote the link; anything else lost the
    /// race against a real transition and is discarded.
    pub(crate) fn timer_expired(&mut self, epoch: u32) {
        if !self.timer_queued() || self.timer_epoch != epoch {
            return;
        }
        self.timer = None;
        self.flags &= !FLAG_TIMER_QUEUED;
        warn!("state transition timed out");
        self.join_error = Some(JoinError::Internal(Error::Timeout));
        self.set_state(LinkState::Initialized);
    }

    /// The state setter. Callers hold the link lock.
    ///
    /// Queues the driver filter notification, manages the pause flag and
    /// queue, arms or disarms the transition timer, and on a fall back to
    /// Initialized releases the active BSS (restarting the remembered
    /// join when configured to).
    pub(crate) fn set_state(&mut self, state: LinkState) {
        let previous = self.state;
        if previous == state {
            return;
        }
        debug!("link state changed");
        self.state = state;
        self.push_op(DriverOp::Filter(state)).ok();

        if previous == LinkState::Associated {
            self.pause_data();
        }

        match state {
            LinkState::Associated => {
                self.disarm_timer();
                self.resume_data();
            }
            LinkState::Probing
            | LinkState::Authenticating
            | LinkState::Associating
            | LinkState::Reassociating => {
                self.arm_timer(self.config.state_timeout);
            }
            LinkState::Encrypted => {
                self.arm_timer(self.config.handshake_timeout);
            }
            LinkState::Initialized | LinkState::Uninitialized => {
                self.disarm_timer();
                self.scan_return = None;
                if let Some(active) = self.active.take() {
                    if let Some(entry) = self.bss.get_mut(active) {
                        entry.supplicant = None;
                    }
                    self.bss.release(active);
                }
                if state == LinkState::Uninitialized {
                    self.teardown();
                } else if self.join_error.is_some()
                    && self.config.auto_rescan
                    && self.pending_scan.is_none()
                {
                    self.pending_scan = self.last_join.clone();
                }
            }
        }
        self.wake_observers();
    }

    fn teardown(&mut self) {
        self.disarm_timer();
        self.paused.clear();
        self.ops.clear();
        self.pending_scan = None;
        self.last_join = None;
        self.bss.remove_all();
        self.dup.clear();
    }

    pub(crate) fn active_entry(&mut self) -> Option<(BssHandle, &mut BssEntry)> {
        let handle = self.active?;
        self.bss.get_mut(handle).map(|e| (handle, e))
    }

    /// Counted grab of the active BSS for use across lock drops. The
    /// caller owns one reference and must release it.
    pub(crate) fn get_active(&mut self) -> Option<BssHandle> {
        let handle = self.active?;
        self.bss.acquire(handle);
        Some(handle)
    }

    // ---- scan plumbing ----

    pub(crate) fn request_scan(&mut self, request: ScanRequest) -> Result<(), Error> {
        if (self.state == LinkState::Probing && !request.background)
            || self.pending_scan.is_some()
        {
            return Err(Error::AlreadyScanning);
        }
        if request.join {
            self.join_error = None;
            self.last_join = Some(request.clone());
        }
        self.pending_scan = Some(request);
        Ok(())
    }

    pub(crate) fn take_scan(&mut self) -> Option<ScanRequest> {
        self.pending_scan.take()
    }

    /// Sweep finished: join the strongest match or restore the prior state.
    pub(crate) fn finish_scan(&mut self, request: &ScanRequest) {
        if self.state != LinkState::Probing {
            // Torn down or demoted mid-sweep; nothing to finish.
            return;
        }
        if !request.join {
            let restore = self.scan_return.take().unwrap_or(LinkState::Initialized);
            self.set_state(restore);
            return;
        }

        self.scan_return = None;
        let found = match request.bssid {
            Some(ref bssid) => self.bss.find_by_bssid(bssid),
            None => self.bss.find_by_ssid(&request.ssid),
        };
        let Some(handle) = found else {
            debug!("no matching BSS after sweep");
            self.join_error = Some(JoinError::SsidNotFound);
            self.set_state(LinkState::Initialized);
            return;
        };

        match self.prepare_join(handle, request) {
            Ok(bssid) => {
                self.bss.acquire(handle);
                self.active = Some(handle);
                self.set_state(LinkState::Authenticating);
                let mac = self.properties.mac;
                let mut buf = FrameBuf::new();
                if frame::auth_request(&mut buf, &mac, &bssid, 0).is_ok() {
                    self.push_op(DriverOp::Transmit(buf)).ok();
                }
            }
            Err(e) => {
                self.join_error = Some(e);
                self.set_state(LinkState::Initialized);
            }
        }
    }

    /// Move the credentials into the entry and settle the cipher choice.
    fn prepare_join(
        &mut self,
        handle: BssHandle,
        request: &ScanRequest,
    ) -> Result<[u8; 6], JoinError> {
        let entry = self.bss.get_mut(handle).ok_or(JoinError::SsidNotFound)?;
        entry.passphrase = request.passphrase.clone();
        if entry.ssid.is_empty() {
            entry.ssid = request.ssid.clone();
        }
        entry.keys.clear();
        entry.supplicant = None;

        match entry.rsn {
            Some(info) if info.pairwise == CipherType::Ccmp && info.psk => {
                if entry.passphrase.is_empty() {
                    return Err(JoinError::BadCredentials);
                }
                entry.sta_rsn = rsn::station_rsn(info.group);
                entry.encrypt_data = true;
            }
            Some(_) => return Err(JoinError::UnsupportedCipher),
            None if entry.description.capabilities & CAP_PRIVACY != 0 => {
                // Privacy without an RSN element: legacy WEP, keyed straight
                // from the passphrase.
                let cipher = match entry.passphrase.len() {
                    5 => CipherType::Wep40,
                    13 => CipherType::Wep104,
                    _ => return Err(JoinError::BadCredentials),
                };
                let key = Key::new(cipher, 0, false, &entry.passphrase)
                    .map_err(JoinError::Internal)?;
                entry.keys.install(key).map_err(JoinError::Internal)?;
                entry.encrypt_data = true;
            }
            None => {
                entry.encrypt_data = false;
            }
        }
        Ok(entry.description.bssid)
    }

    /// Re-run association against the current AP, keeping held traffic.
    pub(crate) fn start_reassociation(&mut self) -> Result<(), Error> {
        if self.state != LinkState::Associated {
            return Err(Error::InvalidState);
        }
        let mac = self.properties.mac;
        let rates = self.properties.rates.clone();
        let mut capabilities = self.properties.capabilities;

        let Some((_, entry)) = self.active_entry() else {
            return Err(Error::InvalidState);
        };
        let bssid = entry.description.bssid;
        let ssid = entry.ssid.clone();
        if entry.encrypt_data {
            capabilities |= CAP_PRIVACY;
        }
        let rsn_body = (!entry.sta_rsn.is_empty()).then(|| entry.sta_rsn.clone());

        self.set_state(LinkState::Reassociating);
        let mut buf = FrameBuf::new();
        frame::assoc_request(
            &mut buf,
            &mac,
            &bssid,
            capabilities,
            10,
            &ssid,
            &rates,
            rsn_body.as_deref(),
            true,
            0,
        )?;
        self.push_op(DriverOp::Transmit(buf))
    }

    // ---- management frame handlers ----

    pub(crate) fn on_probe_info(&mut self, info: &ProbeInfo, rssi: i8) {
        match self.bss.find_by_bssid(&info.bssid()) {
            Some(handle) => {
                if let Some(entry) = self.bss.get_mut(handle) {
                    if entry.refresh(info, rssi).is_err() {
                        self.stats.malformed += 1;
                    }
                }
            }
            None => match BssEntry::from_probe(info, rssi) {
                Ok(entry) => {
                    if self.bss.insert(entry).is_err() {
                        self.stats.dropped += 1;
                    }
                }
                Err(_) => self.stats.malformed += 1,
            },
        }
    }

    pub(crate) fn on_auth(&mut self, auth: &AuthBody) -> Result<(), Error> {
        if self.state != LinkState::Authenticating {
            return Err(Error::InvalidState);
        }
        let mac = self.properties.mac;
        let rates = self.properties.rates.clone();
        let mut capabilities = self.properties.capabilities;

        let (bssid, ssid, rsn_body) = {
            let Some((_, entry)) = self.active_entry() else {
                return Err(Error::InvalidState);
            };
            if auth.header.addr3 != entry.description.bssid {
                return Err(Error::InvalidState);
            }
            if entry.encrypt_data {
                capabilities |= CAP_PRIVACY;
            }
            (
                entry.description.bssid,
                entry.ssid.clone(),
                (!entry.sta_rsn.is_empty()).then(|| entry.sta_rsn.clone()),
            )
        };

        if auth.status != frame::STATUS_SUCCESS
            || auth.algorithm != frame::AUTH_ALGORITHM_OPEN
            || auth.sequence != 2
        {
            warn!("authentication refused, status {}", auth.status);
            self.join_error = Some(JoinError::Internal(Error::Unsupported));
            self.set_state(LinkState::Initialized);
            return Ok(());
        }

        self.set_state(LinkState::Associating);
        let mut buf = FrameBuf::new();
        frame::assoc_request(
            &mut buf,
            &mac,
            &bssid,
            capabilities,
            10,
            &ssid,
            &rates,
            rsn_body.as_deref(),
            false,
            0,
        )?;
        self.push_op(DriverOp::Transmit(buf))
    }

    pub(crate) fn on_assoc_resp(&mut self, resp: &AssocResponse) -> Result<(), Error> {
        if !matches!(
            self.state,
            LinkState::Associating | LinkState::Reassociating
        ) {
            return Err(Error::InvalidState);
        }
        let mac = self.properties.mac;

        let (needs_handshake, passphrase, ssid, bssid, sta_rsn, ap_rsn) = {
            let Some((_, entry)) = self.active_entry() else {
                return Err(Error::InvalidState);
            };
            if resp.header.addr3 != entry.description.bssid {
                return Err(Error::InvalidState);
            }
            if resp.status != frame::STATUS_SUCCESS {
                warn!("association refused, status {}", resp.status);
                self.join_error = Some(JoinError::Internal(Error::Unsupported));
                self.set_state(LinkState::Initialized);
                return Ok(());
            }
            (
                entry.encrypt_data && !entry.sta_rsn.is_empty(),
                entry.passphrase.clone(),
                entry.ssid.clone(),
                entry.description.bssid,
                entry.sta_rsn.clone(),
                entry.ap_rsn.clone(),
            )
        };

        debug!("associated, AID {}", resp.association_id);
        if needs_handshake {
            // An RSN network opens the key handshake before any data flows;
            // reassociation to the same AP renegotiates as well.
            let pmk = handshake::derive_pmk(&passphrase, &ssid)?;
            let snonce = self.nonces.next();
            if let Some((_, entry)) = self.active_entry() {
                entry.keys.clear();
                entry.supplicant =
                    Some(Supplicant::new(mac, bssid, pmk, sta_rsn, ap_rsn, snonce));
            }
            self.set_state(LinkState::Encrypted);
        } else {
            self.set_state(LinkState::Associated);
        }
        Ok(())
    }

    pub(crate) fn on_deauth(&mut self, bssid: &[u8; 6], reason: u16) -> Result<(), Error> {
        let matches_active = self
            .active_entry()
            .map(|(_, e)| e.description.bssid == *bssid)
            .unwrap_or(false);
        if !matches_active {
            return Err(Error::InvalidState);
        }
        info!("disconnected by AP, reason {}", reason);
        self.join_error = Some(JoinError::Internal(Error::InvalidState));
        self.set_state(LinkState::Initialized);
        Ok(())
    }

    // ---- EAPOL ----

    /// Feed one EAPOL PDU to the active BSS's supplicant and apply its
    /// updates: queue outbound frames, install keys in id order, and on
    /// completion open the data path.
    pub(crate) fn on_eapol(&mut self, pdu: &[u8], seq: u16) -> Result<(), Error> {
        if self.state != LinkState::Encrypted {
            return Err(Error::InvalidState);
        }
        let parsed = crate::eapol::KeyFrame::parse(pdu)?;
        let mac = self.properties.mac;

        let (bssid, result) = {
            let Some((_, entry)) = self.active_entry() else {
                return Err(Error::InvalidState);
            };
            let bssid = entry.description.bssid;
            let Some(supplicant) = entry.supplicant.as_mut() else {
                return Err(Error::InvalidState);
            };
            (bssid, supplicant.on_eapol(&parsed))
        };

        let updates = match result {
            Ok(updates) => updates,
            Err(e) => {
                if let Some((_, entry)) = self.active_entry() {
                    entry.supplicant = None;
                }
                self.stats.handshake_failures += 1;
                self.join_error = Some(JoinError::Internal(e));
                self.set_state(LinkState::Initialized);
                return Err(e);
            }
        };

        let mut complete = false;
        for update in updates {
            match update {
                Update::TxEapol(pdu) => {
                    // Handshake frames go out unprotected; no pairwise key
                    // exists on the device yet.
                    let mut buf = FrameBuf::new();
                    frame::data_frame(
                        &mut buf,
                        &mac,
                        &bssid,
                        &bssid,
                        ETHERTYPE_EAPOL,
                        &pdu,
                        seq,
                    )?;
                    self.push_op(DriverOp::Transmit(buf))?;
                }
                Update::InstallPairwise { tk } => {
                    if let Some((_, entry)) = self.active_entry() {
                        entry.keys.install(Key::new(CipherType::Ccmp, 0, true, &tk)?)?;
                    }
                }
                Update::InstallGroup(gtk) => {
                    if let Some((_, entry)) = self.active_entry() {
                        entry
                            .keys
                            .install(Key::new(gtk.cipher, gtk.id, false, &gtk.key)?)?;
                    }
                }
                Update::Complete => complete = true,
            }
        }
        if complete {
            if let Some((_, entry)) = self.active_entry() {
                entry.supplicant = None;
            }
            info!("4-way handshake complete");
            self.set_state(LinkState::Associated);
        }
        Ok(())
    }

    // ---- data receive path ----

    /// Duplicate suppression: a retransmission whose sequence control
    /// matches the last frame seen from its transmitter is dropped.
    pub(crate) fn is_duplicate(&mut self, sender: &[u8; 6], seq_ctrl: u16, retry: bool) -> bool {
        match self.dup.get(sender) {
            Some(&last) if last == seq_ctrl && retry => true,
            _ => {
                if self.dup.insert(*sender, seq_ctrl).is_err() {
                    // Cache full: reset rather than grow stale.
                    self.dup.clear();
                    self.dup.insert(*sender, seq_ctrl).ok();
                }
                false
            }
        }
    }

    /// Process one inbound data MPDU: duplicate check, decrypt, SNAP
    /// decapsulation, EAPOL diversion. Returns the payload location and
    /// EtherType for frames that go up the stack.
    pub(crate) fn on_data(
        &mut self,
        buf: &mut [u8],
        df: &DataFrame,
        seq: u16,
    ) -> Result<Option<(usize, usize, u16)>, Error> {
        let hdr = df.header;
        if self.is_duplicate(&hdr.addr2, hdr.seq_ctrl, hdr.fc.retry()) {
            self.stats.duplicates += 1;
            return Ok(None);
        }
        if df.null_data {
            return Ok(None);
        }

        let link_state = self.state;
        let (start, len) = {
            let Some((_, entry)) = self.active_entry() else {
                return Err(Error::InvalidState);
            };
            if entry.description.bssid != hdr.addr2 {
                return Err(Error::InvalidState);
            }
            if hdr.fc.protected() {
                let key_id = crypto::protected_key_id(buf, df.body_offset)?;
                let key = entry
                    .keys
                    .by_id_mut(key_id)
                    .ok_or(Error::InvalidState)?;
                match key.cipher {
                    CipherType::Ccmp => crypto::ccmp_decrypt(key, buf, df.body_offset)?,
                    CipherType::Wep40 | CipherType::Wep104 => {
                        crypto::wep_decrypt(key, buf, df.body_offset)?
                    }
                    _ => return Err(Error::Unsupported),
                }
            } else if entry.encrypt_data && !entry.keys.is_empty() {
                // Plaintext on a protected link; only pre-key EAPOL may do
                // that, and then the key slots are still empty.
                return Err(Error::InvalidState);
            } else {
                (df.body_offset, buf.len() - df.body_offset)
            }
        };

        let (ethertype, snap_len) = frame::parse_snap(&buf[start..start + len])?;
        if ethertype == ETHERTYPE_EAPOL {
            self.on_eapol(&buf[start + snap_len..start + len], seq)?;
            return Ok(None);
        }
        // A background sweep holds Probing briefly; inbound data from the
        // still-connected BSS keeps flowing through it.
        let delivering = link_state == LinkState::Associated
            || self.scan_return == Some(LinkState::Associated);
        if !delivering {
            return Err(Error::InvalidState);
        }
        self.stats.rx_data += 1;
        Ok(Some((start + snap_len, len - snap_len, ethertype)))
    }

    // ---- send path ----

    /// Assemble and dispatch one outbound payload: SNAP, MAC header with a
    /// fresh sequence number, optional encryption, then the pause queue or
    /// the driver.
    pub(crate) fn send_data(
        &mut self,
        dst: Option<[u8; 6]>,
        ethertype: u16,
        payload: &[u8],
        seq: u16,
    ) -> Result<(), Error> {
        let mac = self.properties.mac;
        let (bssid, encrypt) = {
            let Some((_, entry)) = self.active_entry() else {
                return Err(Error::InvalidState);
            };
            (entry.description.bssid, entry.encrypt_data)
        };
        let dst = dst.unwrap_or(frame::BROADCAST);

        let mut buf = FrameBuf::new();
        frame::data_frame(&mut buf, &mac, &dst, &bssid, ethertype, payload, seq)?;

        if self.state == LinkState::Associated && encrypt {
            let Some((_, entry)) = self.active_entry() else {
                return Err(Error::InvalidState);
            };
            let key = entry.keys.tx_key().ok_or(Error::InvalidState)?;
            match key.cipher {
                CipherType::Ccmp => crypto::ccmp_encrypt(key, &mut buf, frame::MAC_HDR_LEN)?,
                CipherType::Wep40 | CipherType::Wep104 => {
                    crypto::wep_encrypt(key, &mut buf, frame::MAC_HDR_LEN)?
                }
                _ => return Err(Error::Unsupported),
            }
        }

        if self.data_paused() {
            self.paused.push_back(buf).map_err(|_| Error::NoMemory)?;
            return Ok(());
        }
        self.push_op(DriverOp::Transmit(buf))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::{Frame, MacHeader, IE_DS_PARAMS, IE_SSID, IE_SUPPORTED_RATES};

    const AP: [u8; 6] = [0x02, 0x11, 0x22, 0x33, 0x44, 0x55];

    fn state() -> State {
        State::new(
            Properties::new([0x02, 0, 0, 0, 0, 1], 7),
            Config::default(),
        )
    }

    fn beacon(ssid: &[u8]) -> std::vec::Vec<u8> {
        let mut b = std::vec::Vec::new();
        b.extend_from_slice(&[0x80, 0x00, 0x00, 0x00]);
        b.extend_from_slice(&[0xff; 6]);
        b.extend_from_slice(&AP);
        b.extend_from_slice(&AP);
        b.extend_from_slice(&[0x00, 0x00]);
        b.extend_from_slice(&1u64.to_le_bytes());
        b.extend_from_slice(&100u16.to_le_bytes());
        b.extend_from_slice(&0x0001u16.to_le_bytes());
        b.extend_from_slice(&[IE_SSID, ssid.len() as u8]);
        b.extend_from_slice(ssid);
        b.extend_from_slice(&[IE_SUPPORTED_RATES, 2, 0x82, 0x84]);
        b.extend_from_slice(&[IE_DS_PARAMS, 1, 6]);
        b
    }

    /// Park the link in Associated against an open BSS named "cafe".
    fn associate(state: &State) {
        let bytes = beacon(b"cafe");
        state.with(|s| {
            s.state = LinkState::Initialized;
            match Frame::parse(&bytes).unwrap() {
                Frame::Beacon(info) => s.on_probe_info(&info, -50),
                _ => unreachable!(),
            }
            let handle = s.bss.find_by_ssid(b"cafe").unwrap();
            s.bss.acquire(handle);
            s.active = Some(handle);
            s.set_state(LinkState::Associated);
            // Drain transition noise so tests see only their own ops.
            while s.pop_op().is_some() {}
        });
    }

    fn queued_frames(state: &State) -> std::vec::Vec<FrameBuf> {
        state.with(|s| {
            let mut frames = std::vec::Vec::new();
            while let Some(op) = s.pop_op() {
                if let DriverOp::Transmit(f) = op {
                    frames.push(f);
                }
            }
            frames
        })
    }

    #[test]
    fn sequence_counter_wraps_at_4096() {
        let state = state();
        for _ in 0..4095 {
            state.next_sequence();
        }
        assert_eq!(state.next_sequence(), 0);
        assert_eq!(state.next_sequence(), 1);
    }

    #[test]
    fn paused_flag_tracks_state() {
        let state = state();
        associate(&state);
        state.with(|s| {
            assert!(!s.data_paused());
            s.set_state(LinkState::Reassociating);
            assert!(s.data_paused());
            s.set_state(LinkState::Associated);
            assert!(!s.data_paused());
        });
    }

    #[test]
    fn pause_queue_preserves_order_and_sequencing() {
        let state = state();
        associate(&state);
        state.with(|s| s.pause_data());
        for payload in [&b"one"[..], b"two", b"three"] {
            let seq = state.next_sequence();
            state
                .with(|s| s.send_data(Some(AP), 0x0800, payload, seq))
                .unwrap();
        }
        assert_eq!(state.with(|s| s.paused_len()), 3);
        assert!(queued_frames(&state).is_empty());

        state.with(|s| s.resume_data());
        let frames = queued_frames(&state);
        assert_eq!(frames.len(), 3);
        let mut last_seq = 0;
        for (frame, expected) in frames.iter().zip([&b"one"[..], b"two", b"three"]) {
            let hdr = MacHeader::parse(frame).unwrap();
            assert!(hdr.sequence() > last_seq);
            last_seq = hdr.sequence();
            assert_eq!(&frame[frame.len() - expected.len()..], expected);
        }
    }

    #[test]
    fn repeated_pause_leaves_queue_alone() {
        let state = state();
        associate(&state);
        state.with(|s| s.pause_data());
        let seq = state.next_sequence();
        state
            .with(|s| s.send_data(None, 0x0800, b"held", seq))
            .unwrap();
        state.with(|s| s.pause_data());
        state.with(|s| s.pause_data());
        assert_eq!(state.with(|s| s.paused_len()), 1);
    }

    #[test]
    fn stale_timer_expiry_is_discarded() {
        let state = state();
        associate(&state);
        state.with(|s| {
            s.set_state(LinkState::Reassociating);
            let (epoch, _) = s.timer.unwrap();
            // A real transition lands before the deadline fires.
            s.set_state(LinkState::Associated);
            s.timer_expired(epoch);
            assert_eq!(s.state, LinkState::Associated);
        });
    }

    #[test]
    fn current_timer_expiry_demotes() {
        let state = state();
        associate(&state);
        state.with(|s| {
            s.set_state(LinkState::Reassociating);
            let (epoch, _) = s.timer.unwrap();
            s.timer_expired(epoch);
            assert_eq!(s.state, LinkState::Initialized);
            assert!(s.active.is_none());
            assert!(!s.timer_queued());
        });
    }

    #[test]
    fn demotion_releases_active_reference() {
        let state = state();
        associate(&state);
        state.with(|s| {
            let handle = s.active.unwrap();
            s.set_state(LinkState::Initialized);
            // Only the list reference remains.
            assert_eq!(s.bss.refs(handle), Some(1));
            assert!(s.active.is_none());
        });
    }

    #[test]
    fn held_active_reference_outlives_demotion() {
        let state = state();
        associate(&state);
        state.with(|s| {
            let handle = s.get_active().unwrap();
            assert_eq!(s.bss.refs(handle), Some(3));
            // Demotion and removal still leave the holder's entry alive.
            s.set_state(LinkState::Initialized);
            s.bss.remove(handle);
            assert!(s.bss.get(handle).is_some());
            s.bss.release(handle);
            assert!(s.bss.get(handle).is_none());
        });
    }

    #[test]
    fn duplicate_retry_frames_are_dropped() {
        let state = state();
        state.with(|s| {
            assert!(!s.is_duplicate(&AP, 0x0120, true));
            assert!(s.is_duplicate(&AP, 0x0120, true));
            // Same sequence without the retry bit is a new frame.
            assert!(!s.is_duplicate(&AP, 0x0120, false));
            assert!(!s.is_duplicate(&AP, 0x0130, true));
        });
    }

    #[test]
    fn scan_conflicts_are_rejected() {
        let state = state();
        state.with(|s| {
            s.state = LinkState::Probing;
            let req = ScanRequest::default();
            assert_eq!(s.request_scan(req).unwrap_err(), Error::AlreadyScanning);

            let mut background = ScanRequest::default();
            background.background = true;
            s.request_scan(background).unwrap();
            // Second request queues behind the first: also a conflict.
            let mut another = ScanRequest::default();
            another.background = true;
            assert_eq!(
                s.request_scan(another).unwrap_err(),
                Error::AlreadyScanning
            );
        });
    }

    #[test]
    fn send_without_active_bss_fails() {
        let state = state();
        let seq = state.next_sequence();
        let err = state
            .with(|s| s.send_data(None, 0x0800, b"x", seq))
            .unwrap_err();
        assert_eq!(err, Error::InvalidState);
    }

    #[test]
    fn teardown_clears_everything() {
        let state = state();
        associate(&state);
        state.with(|s| s.pause_data());
        let seq = state.next_sequence();
        state
            .with(|s| s.send_data(None, 0x0800, b"doomed", seq))
            .unwrap();

        state.with(|s| {
            s.set_state(LinkState::Uninitialized);
            assert_eq!(s.paused_len(), 0);
            assert!(s.pop_op().is_none());
            assert!(s.active.is_none());
            assert_eq!(s.bss.iter().count(), 0);
        });
    }
}
