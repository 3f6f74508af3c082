//! Cipher keys installed on a BSS: the pairwise key from the 4-way
//! handshake, the group key from message 3, or a static WEP key.

use portable_atomic::{AtomicU64, Ordering};

use crate::error::Error;

/// CCMP allows key ids 0..=3; WEP reuses the same id space.
pub const MAX_KEY_COUNT: usize = 4;
pub const MAX_KEY_LEN: usize = 32;

/// Largest valid 48-bit packet number.
pub const PN_MAX: u64 = (1 << 48) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CipherType {
    None,
    Wep40,
    Wep104,
    Tkip,
    Ccmp,
}

impl CipherType {
    pub fn key_len(self) -> usize {
        match self {
            CipherType::None => 0,
            CipherType::Wep40 => 5,
            CipherType::Wep104 => 13,
            CipherType::Tkip => 32,
            CipherType::Ccmp => 16,
        }
    }
}

/// One installed key.
///
/// The transmit packet number is atomic so the send path can allocate
/// without the link lock; the replay counter belongs to the receive path
/// alone, which runs under the lock.
#[derive(Debug)]
pub struct Key {
    pub cipher: CipherType,
    pub id: u8,
    pub pairwise: bool,
    len: usize,
    value: [u8; MAX_KEY_LEN],
    packet_number: AtomicU64,
    pub replay_counter: u64,
}

impl Key {
    pub fn new(cipher: CipherType, id: u8, pairwise: bool, material: &[u8]) -> Result<Self, Error> {
        if id as usize >= MAX_KEY_COUNT || material.len() > MAX_KEY_LEN {
            return Err(Error::Unsupported);
        }
        if material.len() != cipher.key_len() {
            return Err(Error::Malformed);
        }
        let mut value = [0; MAX_KEY_LEN];
        value[..material.len()].copy_from_slice(material);
        Ok(Self {
            cipher,
            id,
            pairwise,
            len: material.len(),
            value,
            packet_number: AtomicU64::new(0),
            replay_counter: 0,
        })
    }

    pub fn value(&self) -> &[u8] {
        &self.value[..self.len]
    }

    /// Allocate the next transmit packet number. Strictly monotonic; fails
    /// once the 48-bit space is spent and stays failed until rekey.
    pub fn next_packet_number(&self) -> Result<u64, Error> {
        let pn = self.packet_number.fetch_add(1, Ordering::Relaxed) + 1;
        if pn > PN_MAX {
            return Err(Error::Exhausted);
        }
        Ok(pn)
    }

    /// Place the counter so that the next allocation yields `pn + 1`.
    #[cfg(test)]
    pub(crate) fn set_packet_number(&self, pn: u64) {
        self.packet_number.store(pn, Ordering::Relaxed);
    }

    /// Accept `pn` as the most recent verified receive packet number.
    /// Callers must have verified the MIC first.
    pub fn advance_replay(&mut self, pn: u64) {
        debug_assert!(pn > self.replay_counter);
        self.replay_counter = pn;
    }
}

/// The key slots of one BSS.
#[derive(Debug, Default)]
pub struct KeySlots {
    slots: [Option<Key>; MAX_KEY_COUNT],
}

impl KeySlots {
    pub const fn new() -> Self {
        Self {
            slots: [None, None, None, None],
        }
    }

    /// Install a key. During the handshake keys arrive pairwise first and
    /// group second; enforcing ascending ids rejects a group key replayed
    /// from an earlier exchange.
    pub fn install(&mut self, key: Key) -> Result<(), Error> {
        let id = key.id as usize;
        for (i, slot) in self.slots.iter().enumerate() {
            if i > id && slot.is_some() {
                return Err(Error::InvalidState);
            }
        }
        self.slots[id] = Some(key);
        Ok(())
    }

    pub fn by_id_mut(&mut self, id: u8) -> Option<&mut Key> {
        self.slots.get_mut(id as usize).and_then(|s| s.as_mut())
    }

    /// Key used for outbound data: the pairwise key when present, else the
    /// lowest-id installed key (static WEP).
    pub fn tx_key(&self) -> Option<&Key> {
        self.slots
            .iter()
            .flatten()
            .find(|k| k.pairwise)
            .or_else(|| self.slots.iter().flatten().next())
    }

    pub fn clear(&mut self) {
        self.slots = [None, None, None, None];
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }
}
