//! EAPOL-Key frames (IEEE 802.1X carrying the 802.11i key descriptor),
//! the key-data element walk, and NIST AES key unwrap for message 3.
//!
//! All multi-byte fields on this wire are big-endian.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, KeyInit};
use aes::Aes128;
use heapless::Vec;

use crate::error::Error;
use crate::key::CipherType;

pub const EAPOL_VERSION: u8 = 1;
pub const PACKET_TYPE_KEY: u8 = 3;
pub const DESCRIPTOR_RSN: u8 = 2;

/// HMAC-SHA1 MIC + AES key wrap; the only descriptor version a CCMP
/// station negotiates.
pub const KEY_DESCRIPTOR_VERSION_2: u16 = 2;

pub const NONCE_LEN: usize = 32;
pub const MIC_LEN: usize = 16;
pub const MAX_KEY_DATA: usize = 128;

/// Fixed part: 4-byte EAPOL header + 95-byte key descriptor.
pub const FIXED_LEN: usize = 99;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct KeyInformation(pub u16);

impl KeyInformation {
    pub fn descriptor_version(self) -> u16 {
        self.0 & 0x0007
    }

    pub fn pairwise(self) -> bool {
        self.0 & 0x0008 != 0
    }

    pub fn install(self) -> bool {
        self.0 & 0x0040 != 0
    }

    pub fn ack(self) -> bool {
        self.0 & 0x0080 != 0
    }

    pub fn mic(self) -> bool {
        self.0 & 0x0100 != 0
    }

    pub fn secure(self) -> bool {
        self.0 & 0x0200 != 0
    }

    pub fn error(self) -> bool {
        self.0 & 0x0400 != 0
    }

    pub fn request(self) -> bool {
        self.0 & 0x0800 != 0
    }

    pub fn encrypted_key_data(self) -> bool {
        self.0 & 0x1000 != 0
    }
}

/// One EAPOL-Key frame, parsed into owned fields.
#[derive(Debug, Clone)]
pub struct KeyFrame {
    pub version: u8,
    pub key_info: KeyInformation,
    pub key_len: u16,
    pub replay_counter: u64,
    pub nonce: [u8; NONCE_LEN],
    pub iv: [u8; 16],
    pub rsc: u64,
    pub mic: [u8; MIC_LEN],
    pub key_data: Vec<u8, MAX_KEY_DATA>,
}

impl KeyFrame {
    pub fn parse(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < FIXED_LEN {
            return Err(Error::Malformed);
        }
        if buf[1] != PACKET_TYPE_KEY || buf[4] != DESCRIPTOR_RSN {
            return Err(Error::Unsupported);
        }
        let body_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let key_data_len = u16::from_be_bytes([buf[97], buf[98]]) as usize;
        if body_len < FIXED_LEN - 4 || buf.len() < FIXED_LEN + key_data_len {
            return Err(Error::Malformed);
        }
        if key_data_len > MAX_KEY_DATA {
            return Err(Error::NoMemory);
        }

        let mut nonce = [0; NONCE_LEN];
        nonce.copy_from_slice(&buf[17..49]);
        let mut iv = [0; 16];
        iv.copy_from_slice(&buf[49..65]);
        let mut rsc = [0; 8];
        rsc.copy_from_slice(&buf[65..73]);
        let mut mic = [0; MIC_LEN];
        mic.copy_from_slice(&buf[81..97]);
        let mut replay = [0; 8];
        replay.copy_from_slice(&buf[9..17]);

        Ok(Self {
            version: buf[0],
            key_info: KeyInformation(u16::from_be_bytes([buf[5], buf[6]])),
            key_len: u16::from_be_bytes([buf[7], buf[8]]),
            replay_counter: u64::from_be_bytes(replay),
            nonce,
            iv,
            rsc: u64::from_be_bytes(rsc),
            mic,
            key_data: Vec::from_slice(&buf[FIXED_LEN..FIXED_LEN + key_data_len])
                .map_err(|_| Error::NoMemory)?,
        })
    }

    pub fn len(&self) -> usize {
        FIXED_LEN + self.key_data.len()
    }

    /// Serialize the frame. With `zero_mic` the MIC field is written as
    /// zeros, which is the form the MIC itself is computed over.
    pub fn write<const N: usize>(&self, buf: &mut Vec<u8, N>, zero_mic: bool) -> Result<(), Error> {
        let body_len = (FIXED_LEN - 4 + self.key_data.len()) as u16;
        let mut push = |bytes: &[u8]| buf.extend_from_slice(bytes).map_err(|_| Error::NoMemory);
        push(&[self.version, PACKET_TYPE_KEY])?;
        push(&body_len.to_be_bytes())?;
        push(&[DESCRIPTOR_RSN])?;
        push(&self.key_info.0.to_be_bytes())?;
        push(&self.key_len.to_be_bytes())?;
        push(&self.replay_counter.to_be_bytes())?;
        push(&self.nonce)?;
        push(&self.iv)?;
        push(&self.rsc.to_be_bytes())?;
        push(&[0u8; 8])?;
        if zero_mic {
            push(&[0u8; MIC_LEN])?;
        } else {
            push(&self.mic)?;
        }
        push(&(self.key_data.len() as u16).to_be_bytes())?;
        push(&self.key_data)
    }
}

/// A group key delivered in message 3.
#[derive(Debug, Clone)]
pub struct Gtk {
    pub id: u8,
    pub cipher: CipherType,
    pub key: Vec<u8, 32>,
}

const KDE_TYPE_GTK: u8 = 1;

/// Walk decrypted key data and pull out the GTK KDE and the echoed RSN
/// element.
pub fn parse_key_data(data: &[u8]) -> Result<(Option<Gtk>, Option<&[u8]>), Error> {
    let mut gtk = None;
    let mut rsn = None;
    let mut rest = data;
    while rest.len() >= 2 {
        let id = rest[0];
        let len = rest[1] as usize;
        if id == 0xdd && len == 0 {
            // Key-data padding runs to the end of the buffer.
            break;
        }
        if rest.len() < 2 + len {
            return Err(Error::Malformed);
        }
        let body = &rest[2..2 + len];
        match id {
            0xdd if len >= 6 && body[..3] == crate::rsn::OUI && body[3] == KDE_TYPE_GTK => {
                let key = &body[6..];
                let cipher = match key.len() {
                    16 => CipherType::Ccmp,
                    32 => CipherType::Tkip,
                    _ => return Err(Error::Malformed),
                };
                gtk = Some(Gtk {
                    id: body[4] & 0x03,
                    cipher,
                    key: Vec::from_slice(key).map_err(|_| Error::NoMemory)?,
                });
            }
            crate::frame::IE_RSN => rsn = Some(body),
            _ => {}
        }
        rest = &rest[2 + len..];
    }
    Ok((gtk, rsn))
}

/// NIST AES key unwrap (RFC 3394) with a 128-bit KEK, as used for the
/// encrypted key data of message 3 under key descriptor version 2.
pub fn aes_unwrap(kek: &[u8], data: &[u8], out: &mut Vec<u8, MAX_KEY_DATA>) -> Result<(), Error> {
    if kek.len() != 16 || data.len() < 24 || data.len() % 8 != 0 {
        return Err(Error::Malformed);
    }
    let n = data.len() / 8 - 1;
    let cipher = Aes128::new(GenericArray::from_slice(kek));

    let mut a = [0u8; 8];
    a.copy_from_slice(&data[..8]);
    out.clear();
    out.extend_from_slice(&data[8..]).map_err(|_| Error::NoMemory)?;

    for j in (0..6u64).rev() {
        for i in (1..=n).rev() {
            let t = (n as u64) * j + i as u64;
            let mut block = [0u8; 16];
            block[..8].copy_from_slice(&a);
            for (b, tb) in block[..8].iter_mut().zip(t.to_be_bytes()) {
                *b ^= tb;
            }
            block[8..].copy_from_slice(&out[(i - 1) * 8..i * 8]);
            let ga = GenericArray::from_mut_slice(&mut block);
            cipher.decrypt_block(ga);
            a.copy_from_slice(&block[..8]);
            out[(i - 1) * 8..i * 8].copy_from_slice(&block[8..]);
        }
    }

    if a != [0xa6; 8] {
        return Err(Error::IntegrityFailed);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_frame() -> KeyFrame {
        KeyFrame {
            version: EAPOL_VERSION,
            key_info: KeyInformation(0x008a),
            key_len: 16,
            replay_counter: 1,
            nonce: [0xab; NONCE_LEN],
            iv: [0; 16],
            rsc: 0,
            mic: [0; MIC_LEN],
            key_data: Vec::new(),
        }
    }

    #[test]
    fn round_trip() {
        let mut frame = sample_frame();
        frame.key_data = Vec::from_slice(&[1, 2, 3, 4]).unwrap();
        frame.mic = [0x5a; MIC_LEN];
        let mut buf: Vec<u8, 256> = Vec::new();
        frame.write(&mut buf, false).unwrap();
        assert_eq!(buf.len(), frame.len());

        let parsed = KeyFrame::parse(&buf).unwrap();
        assert_eq!(parsed.key_info, frame.key_info);
        assert_eq!(parsed.replay_counter, 1);
        assert_eq!(parsed.nonce, frame.nonce);
        assert_eq!(parsed.mic, frame.mic);
        assert_eq!(parsed.key_data, frame.key_data);
    }

    #[test]
    fn zero_mic_form_differs_only_in_mic() {
        let mut frame = sample_frame();
        frame.mic = [0x77; MIC_LEN];
        let mut with_mic: Vec<u8, 256> = Vec::new();
        let mut without: Vec<u8, 256> = Vec::new();
        frame.write(&mut with_mic, false).unwrap();
        frame.write(&mut without, true).unwrap();
        assert_eq!(with_mic[..81], without[..81]);
        assert_eq!(without[81..97], [0u8; 16]);
        assert_eq!(with_mic[97..], without[97..]);
    }

    #[test]
    fn key_info_bits() {
        let m3 = KeyInformation(0x13ca);
        assert_eq!(m3.descriptor_version(), 2);
        assert!(m3.pairwise());
        assert!(m3.install());
        assert!(m3.ack());
        assert!(m3.mic());
        assert!(m3.secure());
        assert!(m3.encrypted_key_data());
        assert!(!m3.error());
        assert!(!m3.request());
    }

    #[test]
    fn parses_gtk_kde() {
        // GTK KDE: dd, len, 00-0f-ac, type 1, key-id 2 + tx, reserved, 16-byte key.
        let mut data: std::vec::Vec<u8> = std::vec![0xdd, 22, 0x00, 0x0f, 0xac, 0x01, 0x06, 0x00];
        data.extend_from_slice(&[0x42; 16]);
        // RSN element echoed alongside.
        data.extend_from_slice(&[48, 2, 0x01, 0x00]);
        // Padding.
        data.extend_from_slice(&[0xdd, 0]);

        let (gtk, rsn) = parse_key_data(&data).unwrap();
        let gtk = gtk.unwrap();
        assert_eq!(gtk.id, 2);
        assert_eq!(gtk.cipher, CipherType::Ccmp);
        assert_eq!(gtk.key.as_slice(), &[0x42; 16]);
        assert_eq!(rsn, Some(&[0x01, 0x00][..]));
    }

    #[test]
    fn aes_unwrap_rfc3394_vector() {
        let kek = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let wrapped =
            hex::decode("1fa68b0a8112b447aef34bd8fb5a7b829d3e862371d2cfe5").unwrap();
        let mut out: Vec<u8, MAX_KEY_DATA> = Vec::new();
        aes_unwrap(&kek, &wrapped, &mut out).unwrap();
        assert_eq!(
            out.as_slice(),
            hex::decode("00112233445566778899aabbccddeeff").unwrap().as_slice()
        );
    }

    #[test]
    fn aes_unwrap_detects_corruption() {
        let kek = [0u8; 16];
        let mut wrapped = [0u8; 24];
        wrapped[0] = 1;
        let mut out: Vec<u8, MAX_KEY_DATA> = Vec::new();
        assert_eq!(
            aes_unwrap(&kek, &wrapped, &mut out).unwrap_err(),
            Error::IntegrityFailed
        );
    }
}
