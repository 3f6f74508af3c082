//! WPA/WPA2-PSK key negotiation: PMK derivation, the PRF-384 PTK
//! expansion, and the supplicant side of the 4-way handshake.
//!
//! The supplicant consumes inbound EAPOL-Key frames and yields a short
//! update list: frames to transmit, keys to install, and a completion
//! marker. It holds no timer; the link state machine bounds the whole
//! exchange with its Encrypted-state timeout.

use heapless::Vec;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::eapol::{
    aes_unwrap, parse_key_data, Gtk, KeyFrame, KeyInformation, EAPOL_VERSION,
    KEY_DESCRIPTOR_VERSION_2, MAX_KEY_DATA, MIC_LEN, NONCE_LEN,
};
use crate::error::Error;
use crate::frame::IE_RSN;
use crate::rsn::MAX_RSN_LEN;

type HmacSha1 = Hmac<Sha1>;

pub const PMK_LEN: usize = 32;
/// KCK ‖ KEK ‖ TK for a CCMP pairwise cipher.
pub const PTK_LEN: usize = 48;

const PRF_LABEL: &[u8] = b"Pairwise key expansion";

/// PMK = PBKDF2-HMAC-SHA1(passphrase, ssid, 4096 rounds, 256 bits).
pub fn derive_pmk(passphrase: &[u8], ssid: &[u8]) -> Result<[u8; PMK_LEN], Error> {
    let mut pmk = [0u8; PMK_LEN];
    pbkdf2::pbkdf2::<HmacSha1>(passphrase, ssid, 4096, &mut pmk)
        .map_err(|_| Error::Malformed)?;
    Ok(pmk)
}

fn hmac_sha1(key: &[u8], parts: &[&[u8]]) -> [u8; 20] {
    // HMAC accepts keys of any length; new_from_slice cannot fail.
    let mut mac = HmacSha1::new_from_slice(key).unwrap_or_else(|_| unreachable!());
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// The pairwise transient key, kept split into its three parts.
#[derive(Debug, Clone)]
pub struct Ptk {
    bytes: [u8; PTK_LEN],
}

impl Ptk {
    /// PRF-384(PMK, "Pairwise key expansion", min/max of the two MAC
    /// addresses followed by min/max of the two nonces).
    pub fn derive(
        pmk: &[u8; PMK_LEN],
        ap_addr: &[u8; 6],
        sta_addr: &[u8; 6],
        anonce: &[u8; NONCE_LEN],
        snonce: &[u8; NONCE_LEN],
    ) -> Self {
        let (min_addr, max_addr) = if ap_addr < sta_addr {
            (ap_addr, sta_addr)
        } else {
            (sta_addr, ap_addr)
        };
        let (min_nonce, max_nonce) = if anonce < snonce {
            (anonce, snonce)
        } else {
            (snonce, anonce)
        };

        let mut bytes = [0u8; PTK_LEN];
        let mut written = 0;
        let mut counter = 0u8;
        while written < PTK_LEN {
            let digest = hmac_sha1(
                pmk,
                &[
                    PRF_LABEL,
                    &[0],
                    min_addr,
                    max_addr,
                    min_nonce,
                    max_nonce,
                    &[counter],
                ],
            );
            let take = digest.len().min(PTK_LEN - written);
            bytes[written..written + take].copy_from_slice(&digest[..take]);
            written += take;
            counter += 1;
        }
        Self { bytes }
    }

    pub fn kck(&self) -> &[u8] {
        &self.bytes[..16]
    }

    pub fn kek(&self) -> &[u8] {
        &self.bytes[16..32]
    }

    pub fn tk(&self) -> &[u8] {
        &self.bytes[32..48]
    }
}

/// MIC over the serialized frame with the MIC field zeroed, truncated to
/// 16 bytes (key descriptor version 2).
pub(crate) fn compute_mic(kck: &[u8], frame: &KeyFrame) -> Result<[u8; MIC_LEN], Error> {
    let mut buf: Vec<u8, 512> = Vec::new();
    frame.write(&mut buf, true)?;
    let digest = hmac_sha1(kck, &[buf.as_slice()]);
    let mut mic = [0u8; MIC_LEN];
    mic.copy_from_slice(&digest[..MIC_LEN]);
    Ok(mic)
}

/// Deterministic nonce generator in the shape of an HMAC counter PRF,
/// keyed from the station address and an embedding-supplied seed.
#[derive(Debug)]
pub struct NonceReader {
    key: [u8; 20],
    counter: u64,
}

impl NonceReader {
    pub fn new(addr: &[u8; 6], seed: u64) -> Self {
        Self {
            key: hmac_sha1(&seed.to_be_bytes(), &[addr]),
            counter: 0,
        }
    }

    pub fn next(&mut self) -> [u8; NONCE_LEN] {
        self.counter += 1;
        let a = hmac_sha1(&self.key, &[&self.counter.to_be_bytes(), &[0]]);
        let b = hmac_sha1(&self.key, &[&self.counter.to_be_bytes(), &[1]]);
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..20].copy_from_slice(&a);
        nonce[20..].copy_from_slice(&b[..12]);
        nonce
    }
}

/// What the caller must do after feeding a frame to the supplicant.
#[derive(Debug)]
pub enum Update {
    TxEapol(Vec<u8, 512>),
    InstallPairwise { tk: [u8; 16] },
    InstallGroup(Gtk),
    Complete,
}

pub type Updates = Vec<Update, 4>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum State {
    AwaitMsg1,
    AwaitMsg3,
    Complete,
    Failed,
}

/// Supplicant half of the 4-way handshake for one BSS.
pub struct Supplicant {
    state: State,
    pmk: [u8; PMK_LEN],
    sta_addr: [u8; 6],
    ap_addr: [u8; 6],
    snonce: [u8; NONCE_LEN],
    anonce: [u8; NONCE_LEN],
    ptk: Option<Ptk>,
    /// Station RSN element body, echoed in message 2.
    sta_rsn: Vec<u8, MAX_RSN_LEN>,
    /// AP RSN element body, checked against the copy in message 3.
    ap_rsn: Vec<u8, MAX_RSN_LEN>,
    replay_counter: Option<u64>,
}

impl Supplicant {
    pub fn new(
        sta_addr: [u8; 6],
        ap_addr: [u8; 6],
        pmk: [u8; PMK_LEN],
        sta_rsn: Vec<u8, MAX_RSN_LEN>,
        ap_rsn: Vec<u8, MAX_RSN_LEN>,
        snonce: [u8; NONCE_LEN],
    ) -> Self {
        Self {
            state: State::AwaitMsg1,
            pmk,
            sta_addr,
            ap_addr,
            snonce,
            anonce: [0; NONCE_LEN],
            ptk: None,
            sta_rsn,
            ap_rsn,
            replay_counter: None,
        }
    }

    /// Feed one inbound EAPOL-Key frame. Any protocol violation poisons
    /// the handshake; the caller demotes the link.
    pub fn on_eapol(&mut self, frame: &KeyFrame) -> Result<Updates, Error> {
        let result = self.dispatch(frame);
        if result.is_err() {
            self.state = State::Failed;
        }
        result
    }

    fn dispatch(&mut self, frame: &KeyFrame) -> Result<Updates, Error> {
        let info = frame.key_info;
        if info.descriptor_version() != KEY_DESCRIPTOR_VERSION_2 || !info.pairwise() {
            return Err(Error::HandshakeFailed);
        }
        // Error/request flow only runs supplicant-to-authenticator.
        if info.error() || info.request() {
            return Err(Error::HandshakeFailed);
        }
        // Replay counters only move forward.
        if let Some(last) = self.replay_counter {
            if frame.replay_counter <= last {
                return Err(Error::HandshakeFailed);
            }
        }

        let is_msg1 = info.ack() && !info.mic() && !info.install();
        let is_msg3 = info.ack() && info.mic() && info.install() && info.secure();
        match (self.state, is_msg1, is_msg3) {
            (State::AwaitMsg1, true, _) => self.on_msg1(frame),
            (State::AwaitMsg3, _, true) => self.on_msg3(frame),
            _ => Err(Error::HandshakeFailed),
        }
    }

    fn on_msg1(&mut self, frame: &KeyFrame) -> Result<Updates, Error> {
        self.anonce = frame.nonce;
        self.replay_counter = Some(frame.replay_counter);
        let ptk = Ptk::derive(
            &self.pmk,
            &self.ap_addr,
            &self.sta_addr,
            &self.anonce,
            &self.snonce,
        );

        let mut key_data: Vec<u8, MAX_KEY_DATA> = Vec::new();
        key_data
            .extend_from_slice(&[IE_RSN, self.sta_rsn.len() as u8])
            .map_err(|_| Error::NoMemory)?;
        key_data
            .extend_from_slice(&self.sta_rsn)
            .map_err(|_| Error::NoMemory)?;

        let mut msg2 = KeyFrame {
            version: EAPOL_VERSION,
            key_info: KeyInformation(0x010a),
            key_len: 0,
            replay_counter: frame.replay_counter,
            nonce: self.snonce,
            iv: [0; 16],
            rsc: 0,
            mic: [0; MIC_LEN],
            key_data,
        };
        msg2.mic = compute_mic(ptk.kck(), &msg2)?;

        let mut tx: Vec<u8, 512> = Vec::new();
        msg2.write(&mut tx, false)?;

        self.ptk = Some(ptk);
        self.state = State::AwaitMsg3;

        let mut updates = Updates::new();
        updates.push(Update::TxEapol(tx)).ok();
        Ok(updates)
    }

    fn on_msg3(&mut self, frame: &KeyFrame) -> Result<Updates, Error> {
        let ptk = self.ptk.as_ref().ok_or(Error::HandshakeFailed)?;

        // The ANonce must repeat message 1's; a different value means a
        // parallel exchange or an attacker in the middle.
        if frame.nonce != self.anonce {
            return Err(Error::HandshakeFailed);
        }
        let expected = compute_mic(ptk.kck(), frame)?;
        if expected != frame.mic {
            return Err(Error::HandshakeFailed);
        }
        if !frame.key_info.encrypted_key_data() {
            return Err(Error::HandshakeFailed);
        }

        let mut plain: Vec<u8, MAX_KEY_DATA> = Vec::new();
        aes_unwrap(ptk.kek(), &frame.key_data, &mut plain)
            .map_err(|_| Error::HandshakeFailed)?;
        let (gtk, echoed_rsn) = parse_key_data(&plain)?;
        let gtk = gtk.ok_or(Error::HandshakeFailed)?;

        // The AP must echo the RSN element it beaconed; a difference is a
        // downgrade attempt.
        match echoed_rsn {
            Some(rsn) if rsn == self.ap_rsn.as_slice() => {}
            _ => return Err(Error::HandshakeFailed),
        }

        self.replay_counter = Some(frame.replay_counter);

        let mut msg4 = KeyFrame {
            version: EAPOL_VERSION,
            key_info: KeyInformation(0x030a),
            key_len: 0,
            replay_counter: frame.replay_counter,
            nonce: [0; NONCE_LEN],
            iv: [0; 16],
            rsc: 0,
            mic: [0; MIC_LEN],
            key_data: Vec::new(),
        };
        msg4.mic = compute_mic(ptk.kck(), &msg4)?;
        let mut tx: Vec<u8, 512> = Vec::new();
        msg4.write(&mut tx, false)?;

        let mut tk = [0u8; 16];
        tk.copy_from_slice(ptk.tk());

        self.state = State::Complete;

        let mut updates = Updates::new();
        updates.push(Update::InstallPairwise { tk }).ok();
        updates.push(Update::InstallGroup(gtk)).ok();
        updates.push(Update::TxEapol(tx)).ok();
        updates.push(Update::Complete).ok();
        Ok(updates)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use aes::cipher::generic_array::GenericArray;
    use aes::cipher::{BlockEncrypt, KeyInit};
    use aes::Aes128;
    use crate::key::CipherType;

    const STA: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
    const AP: [u8; 6] = [0x02, 0x11, 0x22, 0x33, 0x44, 0x55];

    fn aes_wrap(kek: &[u8], plain: &[u8]) -> std::vec::Vec<u8> {
        assert_eq!(plain.len() % 8, 0);
        let n = plain.len() / 8;
        let cipher = Aes128::new(GenericArray::from_slice(kek));
        let mut a = [0xa6u8; 8];
        let mut r = plain.to_vec();
        for j in 0..6u64 {
            for i in 1..=n {
                let mut block = [0u8; 16];
                block[..8].copy_from_slice(&a);
                block[8..].copy_from_slice(&r[(i - 1) * 8..i * 8]);
                cipher.encrypt_block(GenericArray::from_mut_slice(&mut block));
                let t = (n as u64) * j + i as u64;
                a.copy_from_slice(&block[..8]);
                for (b, tb) in a.iter_mut().zip(t.to_be_bytes()) {
                    *b ^= tb;
                }
                r[(i - 1) * 8..i * 8].copy_from_slice(&block[8..]);
            }
        }
        let mut out = a.to_vec();
        out.extend_from_slice(&r);
        out
    }

    fn station_rsn() -> Vec<u8, MAX_RSN_LEN> {
        crate::rsn::station_rsn(CipherType::Ccmp)
    }

    fn msg1(anonce: &[u8; NONCE_LEN], replay: u64) -> KeyFrame {
        KeyFrame {
            version: EAPOL_VERSION,
            key_info: KeyInformation(0x008a),
            key_len: 16,
            replay_counter: replay,
            nonce: *anonce,
            iv: [0; 16],
            rsc: 0,
            mic: [0; MIC_LEN],
            key_data: Vec::new(),
        }
    }

    fn msg3(ptk: &Ptk, anonce: &[u8; NONCE_LEN], gtk: &[u8; 16], replay: u64) -> KeyFrame {
        let mut key_data = std::vec::Vec::new();
        key_data.extend_from_slice(&[0xdd, 22, 0x00, 0x0f, 0xac, 0x01, 0x01, 0x00]);
        key_data.extend_from_slice(gtk);
        let rsn = station_rsn();
        key_data.extend_from_slice(&[IE_RSN, rsn.len() as u8]);
        key_data.extend_from_slice(&rsn);
        key_data.push(0xdd);
        while key_data.len() % 8 != 0 {
            key_data.push(0);
        }
        let wrapped = aes_wrap(ptk.kek(), &key_data);

        let mut frame = KeyFrame {
            version: EAPOL_VERSION,
            key_info: KeyInformation(0x13ca),
            key_len: 16,
            replay_counter: replay,
            nonce: *anonce,
            iv: [0; 16],
            rsc: 0,
            mic: [0; MIC_LEN],
            key_data: Vec::from_slice(&wrapped).unwrap(),
        };
        frame.mic = compute_mic(ptk.kck(), &frame).unwrap();
        frame
    }

    fn supplicant() -> (Supplicant, [u8; NONCE_LEN]) {
        let pmk = derive_pmk(b"abcdefgh", b"home").unwrap();
        let mut nonces = NonceReader::new(&STA, 7);
        let snonce = nonces.next();
        let sup = Supplicant::new(STA, AP, pmk, station_rsn(), station_rsn(), snonce);
        (sup, snonce)
    }

    #[test]
    fn pmk_is_stable_and_sized() {
        let a = derive_pmk(b"abcdefgh", b"home").unwrap();
        let b = derive_pmk(b"abcdefgh", b"home").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, derive_pmk(b"abcdefgi", b"home").unwrap());
    }

    #[test]
    fn ptk_derivation_is_symmetric_in_inputs() {
        let pmk = [0x11u8; PMK_LEN];
        let an = [0x22u8; NONCE_LEN];
        let sn = [0x33u8; NONCE_LEN];
        let a = Ptk::derive(&pmk, &AP, &STA, &an, &sn);
        // The authenticator computes with the same min/max rule.
        let b = Ptk::derive(&pmk, &AP, &STA, &an, &sn);
        assert_eq!(a.kck(), b.kck());
        assert_eq!(a.tk(), b.tk());
    }

    #[test]
    fn nonces_do_not_repeat() {
        let mut reader = NonceReader::new(&STA, 7);
        let a = reader.next();
        let b = reader.next();
        assert_ne!(a, b);
    }

    #[test]
    fn full_exchange_installs_keys_in_order() {
        let (mut sup, snonce) = supplicant();
        let anonce = [0x5au8; NONCE_LEN];

        let updates = sup.on_eapol(&msg1(&anonce, 1)).unwrap();
        let m2 = match &updates[..] {
            [Update::TxEapol(bytes)] => KeyFrame::parse(bytes).unwrap(),
            other => panic!("unexpected updates: {:?}", other),
        };
        assert_eq!(m2.key_info.0, 0x010a);
        assert_eq!(m2.nonce, snonce);
        assert_eq!(m2.replay_counter, 1);

        // The AP derives the same PTK from the SNonce in message 2.
        let pmk = derive_pmk(b"abcdefgh", b"home").unwrap();
        let ptk = Ptk::derive(&pmk, &AP, &STA, &anonce, &m2.nonce);
        // Verify the station's MIC the way the authenticator would.
        let expected = compute_mic(ptk.kck(), &m2).unwrap();
        assert_eq!(expected, m2.mic);

        let gtk_bytes = [0x77u8; 16];
        let updates = sup.on_eapol(&msg3(&ptk, &anonce, &gtk_bytes, 2)).unwrap();
        match &updates[..] {
            [Update::InstallPairwise { tk }, Update::InstallGroup(gtk), Update::TxEapol(m4), Update::Complete] =>
            {
                assert_eq!(tk, ptk.tk());
                assert_eq!(gtk.key.as_slice(), &gtk_bytes);
                assert_eq!(gtk.id, 1);
                let m4 = KeyFrame::parse(m4).unwrap();
                assert_eq!(m4.key_info.0, 0x030a);
                assert_eq!(m4.replay_counter, 2);
                assert_eq!(compute_mic(ptk.kck(), &m4).unwrap(), m4.mic);
            }
            other => panic!("unexpected updates: {:?}", other),
        }
        // Complete: the exchange does not accept further messages.
        assert!(sup.on_eapol(&msg1(&anonce, 3)).is_err());
    }

    #[test]
    fn msg3_before_msg1_fails() {
        let (mut sup, _) = supplicant();
        let pmk = derive_pmk(b"abcdefgh", b"home").unwrap();
        let ptk = Ptk::derive(&pmk, &AP, &STA, &[0; NONCE_LEN], &[0; NONCE_LEN]);
        let err = sup
            .on_eapol(&msg3(&ptk, &[0; NONCE_LEN], &[0u8; 16], 1))
            .unwrap_err();
        assert_eq!(err, Error::HandshakeFailed);
        // Poisoned: even a well-formed message 1 is refused now.
        assert!(sup.on_eapol(&msg1(&[1; NONCE_LEN], 2)).is_err());
    }

    #[test]
    fn msg3_with_bad_mic_fails() {
        let (mut sup, _) = supplicant();
        let anonce = [0x5au8; NONCE_LEN];
        let updates = sup.on_eapol(&msg1(&anonce, 1)).unwrap();
        let m2 = match &updates[..] {
            [Update::TxEapol(bytes)] => KeyFrame::parse(bytes).unwrap(),
            _ => unreachable!(),
        };
        let pmk = derive_pmk(b"abcdefgh", b"home").unwrap();
        let ptk = Ptk::derive(&pmk, &AP, &STA, &anonce, &m2.nonce);

        let mut bad = msg3(&ptk, &anonce, &[0u8; 16], 2);
        bad.mic[0] ^= 1;
        assert_eq!(sup.on_eapol(&bad).unwrap_err(), Error::HandshakeFailed);
    }

    #[test]
    fn stale_replay_counter_fails() {
        let (mut sup, _) = supplicant();
        let anonce = [0x5au8; NONCE_LEN];
        sup.on_eapol(&msg1(&anonce, 5)).unwrap();
        // Counter goes backwards.
        assert!(sup.on_eapol(&msg1(&anonce, 4)).is_err());
    }

    #[test]
    fn msg3_rsn_mismatch_fails() {
        let (mut sup, _) = supplicant();
        let anonce = [0x5au8; NONCE_LEN];
        let updates = sup.on_eapol(&msg1(&anonce, 1)).unwrap();
        let m2 = match &updates[..] {
            [Update::TxEapol(bytes)] => KeyFrame::parse(bytes).unwrap(),
            _ => unreachable!(),
        };
        let pmk = derive_pmk(b"abcdefgh", b"home").unwrap();
        let ptk = Ptk::derive(&pmk, &AP, &STA, &anonce, &m2.nonce);

        // Echo a different RSN element in the encrypted key data.
        let mut key_data = std::vec::Vec::new();
        key_data.extend_from_slice(&[0xdd, 22, 0x00, 0x0f, 0xac, 0x01, 0x01, 0x00]);
        key_data.extend_from_slice(&[0x42u8; 16]);
        key_data.extend_from_slice(&[IE_RSN, 2, 0x01, 0x00]);
        key_data.push(0xdd);
        while key_data.len() % 8 != 0 {
            key_data.push(0);
        }
        let wrapped = aes_wrap(ptk.kek(), &key_data);
        let mut frame = KeyFrame {
            version: EAPOL_VERSION,
            key_info: KeyInformation(0x13ca),
            key_len: 16,
            replay_counter: 2,
            nonce: anonce,
            iv: [0; 16],
            rsc: 0,
            mic: [0; MIC_LEN],
            key_data: Vec::from_slice(&wrapped).unwrap(),
        };
        frame.mic = compute_mic(ptk.kck(), &frame).unwrap();
        assert_eq!(sup.on_eapol(&frame).unwrap_err(), Error::HandshakeFailed);
    }
}
