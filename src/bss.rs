//! The table of BSSes within range: a fixed pool of reference-counted
//! entries addressed by handle.
//!
//! List membership holds one reference; the active-BSS slot holds one;
//! transient users (frame handlers, the scan worker) take their own. An
//! entry is freed exactly when the last reference goes, which can be
//! well after it left the table.

use heapless::Vec;

use crate::error::Error;
use crate::frame::ProbeInfo;
use crate::handshake::Supplicant;
use crate::key::KeySlots;
use crate::rsn::{self, RsnInfo, MAX_RSN_LEN};

pub const MAX_BSS: usize = 8;
pub const MAX_RATES: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BssHandle(u8);

/// What a beacon or probe response told us about a network.
#[derive(Debug, Clone)]
pub struct BssDescription {
    pub bssid: [u8; 6],
    pub channel: u8,
    pub beacon_interval: u16,
    pub capabilities: u16,
    pub rssi: i8,
    pub rates: Vec<u8, MAX_RATES>,
    pub timestamp: u64,
}

pub struct BssEntry {
    pub description: BssDescription,
    pub ssid: Vec<u8, 32>,
    pub passphrase: Vec<u8, 64>,
    /// Parsed view of the AP's RSN element, when it advertises one.
    pub rsn: Option<RsnInfo>,
    /// Raw RSN element bodies; both non-empty iff the pairwise cipher is
    /// negotiated.
    pub ap_rsn: Vec<u8, MAX_RSN_LEN>,
    pub sta_rsn: Vec<u8, MAX_RSN_LEN>,
    pub keys: KeySlots,
    /// Present only while the 4-way handshake is running.
    pub supplicant: Option<Supplicant>,
    pub encrypt_data: bool,
}

impl BssEntry {
    pub(crate) fn from_probe(info: &ProbeInfo, rssi: i8) -> Result<Self, Error> {
        let mut entry = Self {
            description: BssDescription {
                bssid: info.bssid(),
                channel: info.channel().unwrap_or(0),
                beacon_interval: info.beacon_interval,
                capabilities: info.capabilities,
                rssi,
                rates: Vec::new(),
                timestamp: info.timestamp,
            },
            ssid: Vec::new(),
            passphrase: Vec::new(),
            rsn: None,
            ap_rsn: Vec::new(),
            sta_rsn: Vec::new(),
            keys: KeySlots::new(),
            supplicant: None,
            encrypt_data: false,
        };
        entry.refresh(info, rssi)?;
        if let Some(ssid) = info.ssid() {
            entry.ssid = Vec::from_slice(ssid).map_err(|_| Error::Malformed)?;
        }
        Ok(entry)
    }

    /// Fold a later beacon or probe response into the entry. Signal
    /// strength, rates, capabilities and timestamp follow the air; the
    /// SSID and passphrase placed by a join request stay put; the RSN
    /// element is replaced only on a byte-for-byte difference, which also
    /// invalidates any handshake in flight.
    pub fn refresh(&mut self, info: &ProbeInfo, rssi: i8) -> Result<(), Error> {
        let desc = &mut self.description;
        desc.rssi = rssi;
        desc.capabilities = info.capabilities;
        desc.beacon_interval = info.beacon_interval;
        desc.timestamp = info.timestamp;
        if let Some(channel) = info.channel() {
            desc.channel = channel;
        }
        if let Some(rates) = info.rates() {
            desc.rates = Vec::from_slice(&rates[..rates.len().min(MAX_RATES)])
                .map_err(|_| Error::Malformed)?;
        }
        if self.ssid.is_empty() {
            if let Some(ssid) = info.ssid() {
                self.ssid = Vec::from_slice(ssid).map_err(|_| Error::Malformed)?;
            }
        }

        let advertised = info.rsn().unwrap_or(&[]);
        if advertised != self.ap_rsn.as_slice() {
            self.ap_rsn = Vec::from_slice(advertised).map_err(|_| Error::NoMemory)?;
            self.rsn = if advertised.is_empty() {
                None
            } else {
                rsn::parse(advertised).ok()
            };
            if self.supplicant.take().is_some() {
                warn!("RSN element changed mid-handshake; invalidating");
            }
        }
        Ok(())
    }

    /// Cipher protecting data on this BSS: the advertised RSN pairwise
    /// suite, or the installed static key's cipher on legacy WEP networks
    /// that carry no RSN element.
    pub fn pairwise_cipher(&self) -> crate::key::CipherType {
        match self.rsn {
            Some(rsn) => rsn.pairwise,
            None => self
                .keys
                .tx_key()
                .map(|k| k.cipher)
                .unwrap_or(crate::key::CipherType::None),
        }
    }
}

struct Slot {
    refs: u8,
    listed: bool,
    entry: BssEntry,
}

/// Fixed-capacity BSS pool. All operations assume the link lock is held.
pub struct BssTable {
    slots: [Option<Slot>; MAX_BSS],
}

impl BssTable {
    pub const fn new() -> Self {
        Self {
            slots: [None, None, None, None, None, None, None, None],
        }
    }

    pub fn insert(&mut self, entry: BssEntry) -> Result<BssHandle, Error> {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(Slot {
                    refs: 1,
                    listed: true,
                    entry,
                });
                return Ok(BssHandle(i as u8));
            }
        }
        Err(Error::NoMemory)
    }

    pub fn find_by_bssid(&self, bssid: &[u8; 6]) -> Option<BssHandle> {
        self.iter()
            .find(|(_, e)| e.description.bssid == *bssid)
            .map(|(h, _)| h)
    }

    /// Strongest listed BSS broadcasting the given SSID.
    pub fn find_by_ssid(&self, ssid: &[u8]) -> Option<BssHandle> {
        self.iter()
            .filter(|(_, e)| e.ssid.as_slice() == ssid)
            .max_by_key(|(_, e)| e.description.rssi)
            .map(|(h, _)| h)
    }

    pub fn get(&self, handle: BssHandle) -> Option<&BssEntry> {
        self.slot(handle).map(|s| &s.entry)
    }

    pub fn get_mut(&mut self, handle: BssHandle) -> Option<&mut BssEntry> {
        self.slot_mut(handle).map(|s| &mut s.entry)
    }

    /// Take an additional reference to the entry.
    pub fn acquire(&mut self, handle: BssHandle) {
        if let Some(slot) = self.slot_mut(handle) {
            slot.refs += 1;
        }
    }

    /// Drop one reference; the entry is freed once unlisted and unreferenced.
    pub fn release(&mut self, handle: BssHandle) {
        let idx = handle.0 as usize;
        if let Some(slot) = self.slots[idx].as_mut() {
            slot.refs -= 1;
            if slot.refs == 0 {
                debug_assert!(!slot.listed);
                self.slots[idx] = None;
            }
        }
    }

    /// Unlink from the table. Holders of other references keep a live
    /// entry until they release it.
    pub fn remove(&mut self, handle: BssHandle) {
        if let Some(slot) = self.slot_mut(handle) {
            if slot.listed {
                slot.listed = false;
                self.release(handle);
            }
        }
    }

    /// Teardown: unlink everything.
    pub fn remove_all(&mut self) {
        for i in 0..MAX_BSS {
            self.remove(BssHandle(i as u8));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (BssHandle, &BssEntry)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.as_ref()
                .filter(|s| s.listed)
                .map(|s| (BssHandle(i as u8), &s.entry))
        })
    }

    #[cfg(test)]
    pub(crate) fn refs(&self, handle: BssHandle) -> Option<u8> {
        self.slot(handle).map(|s| s.refs)
    }

    #[cfg(test)]
    pub(crate) fn live_slots(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    fn slot(&self, handle: BssHandle) -> Option<&Slot> {
        self.slots.get(handle.0 as usize).and_then(|s| s.as_ref())
    }

    fn slot_mut(&mut self, handle: BssHandle) -> Option<&mut Slot> {
        self.slots
            .get_mut(handle.0 as usize)
            .and_then(|s| s.as_mut())
    }
}

impl Default for BssTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::{Frame, IE_DS_PARAMS, IE_RSN, IE_SSID, IE_SUPPORTED_RATES};

    const AP: [u8; 6] = [0x02, 0x11, 0x22, 0x33, 0x44, 0x55];

    fn beacon(ssid: &[u8], rssi_channel: u8, rsn: Option<&[u8]>) -> std::vec::Vec<u8> {
        let mut b = std::vec::Vec::new();
        b.extend_from_slice(&[0x80, 0x00, 0x00, 0x00]);
        b.extend_from_slice(&[0xff; 6]);
        b.extend_from_slice(&AP);
        b.extend_from_slice(&AP);
        b.extend_from_slice(&[0x00, 0x00]);
        b.extend_from_slice(&7u64.to_le_bytes());
        b.extend_from_slice(&100u16.to_le_bytes());
        b.extend_from_slice(&0x0411u16.to_le_bytes());
        b.extend_from_slice(&[IE_SSID, ssid.len() as u8]);
        b.extend_from_slice(ssid);
        b.extend_from_slice(&[IE_SUPPORTED_RATES, 2, 0x82, 0x84]);
        b.extend_from_slice(&[IE_DS_PARAMS, 1, rssi_channel]);
        if let Some(rsn) = rsn {
            b.extend_from_slice(&[IE_RSN, rsn.len() as u8]);
            b.extend_from_slice(rsn);
        }
        b
    }

    fn probe_info(bytes: &[u8]) -> crate::frame::ProbeInfo<'_> {
        match Frame::parse(bytes).unwrap() {
            Frame::Beacon(info) => info,
            _ => panic!("expected beacon"),
        }
    }

    #[test]
    fn insert_find_remove() {
        let mut table = BssTable::new();
        let bytes = beacon(b"cafe", 6, None);
        let entry = BssEntry::from_probe(&probe_info(&bytes), -50).unwrap();
        let handle = table.insert(entry).unwrap();

        assert_eq!(table.find_by_bssid(&AP), Some(handle));
        assert_eq!(table.find_by_ssid(b"cafe"), Some(handle));
        assert_eq!(table.refs(handle), Some(1));

        table.remove(handle);
        assert_eq!(table.find_by_bssid(&AP), None);
        assert_eq!(table.live_slots(), 0);
    }

    #[test]
    fn entry_outlives_removal_while_referenced() {
        let mut table = BssTable::new();
        let bytes = beacon(b"cafe", 6, None);
        let handle = table
            .insert(BssEntry::from_probe(&probe_info(&bytes), -50).unwrap())
            .unwrap();

        table.acquire(handle);
        table.remove(handle);
        // Unlisted but still alive for the holder.
        assert_eq!(table.find_by_bssid(&AP), None);
        assert!(table.get(handle).is_some());
        assert_eq!(table.live_slots(), 1);

        table.release(handle);
        assert_eq!(table.live_slots(), 0);
    }

    #[test]
    fn acquire_release_pairs_leave_count_unchanged() {
        let mut table = BssTable::new();
        let bytes = beacon(b"cafe", 6, None);
        let handle = table
            .insert(BssEntry::from_probe(&probe_info(&bytes), -50).unwrap())
            .unwrap();
        table.acquire(handle);
        table.acquire(handle);
        table.release(handle);
        table.release(handle);
        assert_eq!(table.refs(handle), Some(1));
    }

    #[test]
    fn refresh_updates_signal_and_preserves_join_data() {
        let mut table = BssTable::new();
        let bytes = beacon(b"cafe", 6, None);
        let handle = table
            .insert(BssEntry::from_probe(&probe_info(&bytes), -70).unwrap())
            .unwrap();
        table.get_mut(handle).unwrap().passphrase =
            Vec::from_slice(b"hunter22").unwrap();

        let newer = beacon(b"cafe", 11, None);
        table
            .get_mut(handle)
            .unwrap()
            .refresh(&probe_info(&newer), -40)
            .unwrap();

        let entry = table.get(handle).unwrap();
        assert_eq!(entry.description.rssi, -40);
        assert_eq!(entry.description.channel, 11);
        assert_eq!(entry.passphrase.as_slice(), b"hunter22");
        assert_eq!(entry.ssid.as_slice(), b"cafe");
    }

    #[test]
    fn rsn_change_drops_supplicant() {
        let rsn_a = crate::rsn::station_rsn(crate::key::CipherType::Ccmp);
        let mut table = BssTable::new();
        let bytes = beacon(b"home", 6, Some(&rsn_a));
        let handle = table
            .insert(BssEntry::from_probe(&probe_info(&bytes), -50).unwrap())
            .unwrap();

        // Fake an in-flight handshake.
        let pmk = [0u8; 32];
        let entry = table.get_mut(handle).unwrap();
        entry.supplicant = Some(Supplicant::new(
            [2, 0, 0, 0, 0, 1],
            AP,
            pmk,
            rsn_a.clone(),
            rsn_a.clone(),
            [0; 32],
        ));
        assert!(entry.rsn.is_some());

        // Same RSN: handshake survives.
        entry.refresh(&probe_info(&bytes), -55).unwrap();
        assert!(entry.supplicant.is_some());

        // Different RSN: handshake invalidated.
        let rsn_b = crate::rsn::station_rsn(crate::key::CipherType::Tkip);
        let changed = beacon(b"home", 6, Some(&rsn_b));
        entry.refresh(&probe_info(&changed), -55).unwrap();
        assert!(entry.supplicant.is_none());
        assert_eq!(entry.ap_rsn.as_slice(), rsn_b.as_slice());
    }

    #[test]
    fn find_by_ssid_picks_strongest() {
        let mut table = BssTable::new();
        let bytes = beacon(b"mesh", 1, None);
        let weak = table
            .insert(BssEntry::from_probe(&probe_info(&bytes), -80).unwrap())
            .unwrap();
        let mut other = BssEntry::from_probe(&probe_info(&bytes), -40).unwrap();
        other.description.bssid = [0x02, 0x99, 0x99, 0x99, 0x99, 0x99];
        let strong = table.insert(other).unwrap();

        assert_ne!(weak, strong);
        assert_eq!(table.find_by_ssid(b"mesh"), Some(strong));
    }

    #[test]
    fn pool_exhaustion_reports_no_memory() {
        let mut table = BssTable::new();
        let bytes = beacon(b"x", 1, None);
        for i in 0..MAX_BSS {
            let mut entry = BssEntry::from_probe(&probe_info(&bytes), -50).unwrap();
            entry.description.bssid[5] = i as u8;
            table.insert(entry).unwrap();
        }
        let overflow = BssEntry::from_probe(&probe_info(&bytes), -50).unwrap();
        assert_eq!(table.insert(overflow).unwrap_err(), Error::NoMemory);
    }
}
