//! Payload protection: CCMP (AES-CCM, 8-byte MIC) and legacy WEP.
//!
//! Both paths operate on complete MPDUs in place. The caller locates the
//! frame body (past the MAC header) and selects the key; this module owns
//! the CCMP/WEP header layout, the nonce and AAD construction, and the
//! replay discipline.

use aes::Aes128;
use ccm::{
    aead::{generic_array::GenericArray, AeadInPlace},
    consts::{U13, U8},
    Ccm, KeyInit,
};
use heapless::Vec;

use crate::error::Error;
use crate::frame::{self, MacHeader, CCMP_HDR_LEN, CCMP_MIC_LEN};
use crate::key::Key;

type Aes128Ccm = Ccm<Aes128, U8, U13>;

pub const WEP_HDR_LEN: usize = 4;
pub const WEP_ICV_LEN: usize = 4;

const EXT_IV: u8 = 0x20;

/// Nonce = priority octet, transmitter address, 48-bit PN big-endian.
fn ccmp_nonce(addr2: &[u8; 6], pn: u64) -> [u8; 13] {
    let mut nonce = [0u8; 13];
    nonce[1..7].copy_from_slice(addr2);
    nonce[7..13].copy_from_slice(&pn.to_be_bytes()[2..]);
    nonce
}

/// AAD over the immutable header fields: masked frame control, the three
/// addresses, and the sequence control with the sequence number zeroed.
fn ccmp_aad(header: &MacHeader) -> [u8; 22] {
    let mut aad = [0u8; 22];
    aad[..2].copy_from_slice(&header.fc.masked_for_aad().to_le_bytes());
    aad[2..8].copy_from_slice(&header.addr1);
    aad[8..14].copy_from_slice(&header.addr2);
    aad[14..20].copy_from_slice(&header.addr3);
    aad[20..22].copy_from_slice(&(header.seq_ctrl & 0x000f).to_le_bytes());
    aad
}

fn write_ccmp_header(hdr: &mut [u8], pn: u64, key_id: u8) {
    let pn = pn.to_be_bytes();
    hdr[0] = pn[7];
    hdr[1] = pn[6];
    hdr[2] = 0;
    hdr[3] = (key_id << 6) | EXT_IV;
    hdr[4] = pn[5];
    hdr[5] = pn[4];
    hdr[6] = pn[3];
    hdr[7] = pn[2];
}

fn read_ccmp_header(hdr: &[u8]) -> Result<(u64, u8), Error> {
    if hdr[3] & EXT_IV == 0 {
        return Err(Error::Malformed);
    }
    let pn = u64::from_be_bytes([0, 0, hdr[7], hdr[6], hdr[5], hdr[4], hdr[1], hdr[0]]);
    Ok((pn, hdr[3] >> 6))
}

/// Key id carried by a protected frame, for key selection before decrypt.
pub fn protected_key_id(mpdu: &[u8], hdr_len: usize) -> Result<u8, Error> {
    if mpdu.len() < hdr_len + CCMP_HDR_LEN {
        return Err(Error::Malformed);
    }
    Ok(read_ccmp_header(&mpdu[hdr_len..])?.1)
}

/// Encrypt a fully formed MPDU in place: allocate a packet number, insert
/// the CCMP header, encrypt the body, append the MIC and flag the frame
/// protected.
pub fn ccmp_encrypt<const N: usize>(
    key: &Key,
    mpdu: &mut Vec<u8, N>,
    hdr_len: usize,
) -> Result<(), Error> {
    if mpdu.len() < hdr_len {
        return Err(Error::Malformed);
    }
    let header = MacHeader::parse(mpdu)?;
    let pn = key.next_packet_number()?;

    let body_len = mpdu.len() - hdr_len;
    mpdu.resize(hdr_len + CCMP_HDR_LEN + body_len + CCMP_MIC_LEN, 0)
        .map_err(|_| Error::NoMemory)?;
    let buf = mpdu.as_mut_slice();
    buf.copy_within(hdr_len..hdr_len + body_len, hdr_len + CCMP_HDR_LEN);
    write_ccmp_header(&mut buf[hdr_len..hdr_len + CCMP_HDR_LEN], pn, key.id);

    let cipher = Aes128Ccm::new(GenericArray::from_slice(key.value()));
    let nonce = ccmp_nonce(&header.addr2, pn);
    let aad = ccmp_aad(&header);
    let body = hdr_len + CCMP_HDR_LEN..hdr_len + CCMP_HDR_LEN + body_len;
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(&nonce), &aad, &mut buf[body])
        .map_err(|_| Error::IntegrityFailed)?;
    buf[hdr_len + CCMP_HDR_LEN + body_len..].copy_from_slice(&tag);

    frame::set_protected(buf, true);
    Ok(())
}

/// Decrypt a protected MPDU in place. On success the replay counter
/// advances and the plaintext body location is returned; on any failure
/// the counter is untouched.
pub fn ccmp_decrypt(
    key: &mut Key,
    mpdu: &mut [u8],
    hdr_len: usize,
) -> Result<(usize, usize), Error> {
    if mpdu.len() < hdr_len + CCMP_HDR_LEN + CCMP_MIC_LEN {
        return Err(Error::Malformed);
    }
    let header = MacHeader::parse(mpdu)?;
    let (pn, _) = read_ccmp_header(&mpdu[hdr_len..])?;
    if pn <= key.replay_counter {
        return Err(Error::ReplayDetected);
    }

    let body_start = hdr_len + CCMP_HDR_LEN;
    let mic_start = mpdu.len() - CCMP_MIC_LEN;
    let cipher = Aes128Ccm::new(GenericArray::from_slice(key.value()));
    let nonce = ccmp_nonce(&header.addr2, pn);
    let aad = ccmp_aad(&header);
    let mut tag = [0u8; CCMP_MIC_LEN];
    tag.copy_from_slice(&mpdu[mic_start..]);
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(&nonce),
            &aad,
            &mut mpdu[body_start..mic_start],
            GenericArray::from_slice(&tag),
        )
        .map_err(|_| Error::IntegrityFailed)?;

    key.advance_replay(pn);
    Ok((body_start, mic_start - body_start))
}

// WEP. Kept for legacy networks whose privacy bit is set without an RSN
// element; the key is the raw 5- or 13-byte passphrase.

struct Rc4 {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    fn new(key: &[u8]) -> Self {
        let mut s = [0u8; 256];
        for (i, v) in s.iter_mut().enumerate() {
            *v = i as u8;
        }
        let mut j: u8 = 0;
        for i in 0..256 {
            j = j
                .wrapping_add(s[i])
                .wrapping_add(key[i % key.len()]);
            s.swap(i, j as usize);
        }
        Self { s, i: 0, j: 0 }
    }

    fn apply(&mut self, data: &mut [u8]) {
        for b in data {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.s[self.i as usize]);
            self.s.swap(self.i as usize, self.j as usize);
            let k = self.s[(self.s[self.i as usize].wrapping_add(self.s[self.j as usize])) as usize];
            *b ^= k;
        }
    }
}

fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xffff_ffff;
    for &b in data {
        crc ^= b as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xedb8_8320 & mask);
        }
    }
    !crc
}

pub fn wep_encrypt<const N: usize>(
    key: &Key,
    mpdu: &mut Vec<u8, N>,
    hdr_len: usize,
) -> Result<(), Error> {
    if mpdu.len() < hdr_len {
        return Err(Error::Malformed);
    }
    // The packet number doubles as the IV source; 24 bits of it go on air.
    let iv = (key.next_packet_number()? & 0x00ff_ffff) as u32;

    let body_len = mpdu.len() - hdr_len;
    mpdu.resize(hdr_len + WEP_HDR_LEN + body_len + WEP_ICV_LEN, 0)
        .map_err(|_| Error::NoMemory)?;
    let buf = mpdu.as_mut_slice();
    buf.copy_within(hdr_len..hdr_len + body_len, hdr_len + WEP_HDR_LEN);
    let iv_bytes = iv.to_le_bytes();
    buf[hdr_len] = iv_bytes[0];
    buf[hdr_len + 1] = iv_bytes[1];
    buf[hdr_len + 2] = iv_bytes[2];
    buf[hdr_len + 3] = key.id << 6;

    let body = hdr_len + WEP_HDR_LEN..hdr_len + WEP_HDR_LEN + body_len;
    let icv = crc32(&buf[body.clone()]).to_le_bytes();
    buf[hdr_len + WEP_HDR_LEN + body_len..].copy_from_slice(&icv);

    let mut rc4_key: Vec<u8, 16> = Vec::new();
    rc4_key.extend_from_slice(&iv_bytes[..3]).ok();
    rc4_key.extend_from_slice(key.value()).map_err(|_| Error::Unsupported)?;
    Rc4::new(&rc4_key).apply(&mut buf[hdr_len + WEP_HDR_LEN..]);

    frame::set_protected(buf, true);
    Ok(())
}

pub fn wep_decrypt(key: &Key, mpdu: &mut [u8], hdr_len: usize) -> Result<(usize, usize), Error> {
    if mpdu.len() < hdr_len + WEP_HDR_LEN + WEP_ICV_LEN {
        return Err(Error::Malformed);
    }
    let mut rc4_key: Vec<u8, 16> = Vec::new();
    rc4_key.extend_from_slice(&mpdu[hdr_len..hdr_len + 3]).ok();
    rc4_key.extend_from_slice(key.value()).map_err(|_| Error::Unsupported)?;
    Rc4::new(&rc4_key).apply(&mut mpdu[hdr_len + WEP_HDR_LEN..]);

    let icv_start = mpdu.len() - WEP_ICV_LEN;
    let expected = crc32(&mpdu[hdr_len + WEP_HDR_LEN..icv_start]).to_le_bytes();
    if mpdu[icv_start..] != expected {
        return Err(Error::IntegrityFailed);
    }
    Ok((hdr_len + WEP_HDR_LEN, icv_start - hdr_len - WEP_HDR_LEN))
}
