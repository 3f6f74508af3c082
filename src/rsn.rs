//! RSN information element (IEEE 802.11i) parsing and construction.

use heapless::Vec;

use crate::error::Error;
use crate::key::CipherType;

/// 00-0F-AC, the IEEE 802.11 OUI used by all standard suite selectors.
pub const OUI: [u8; 3] = [0x00, 0x0f, 0xac];

pub const CIPHER_WEP40: u8 = 1;
pub const CIPHER_TKIP: u8 = 2;
pub const CIPHER_CCMP: u8 = 4;
pub const CIPHER_WEP104: u8 = 5;

pub const AKM_PSK: u8 = 2;

pub const RSN_VERSION: u16 = 1;

/// Largest RSN element body this station stores or emits.
pub const MAX_RSN_LEN: usize = 64;

/// The subset of an RSN element this station acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RsnInfo {
    pub group: CipherType,
    /// Best pairwise cipher offered that this station implements.
    pub pairwise: CipherType,
    pub psk: bool,
}

fn cipher_from_selector(selector: &[u8]) -> CipherType {
    if selector[..3] != OUI {
        return CipherType::None;
    }
    match selector[3] {
        CIPHER_WEP40 => CipherType::Wep40,
        CIPHER_TKIP => CipherType::Tkip,
        CIPHER_CCMP => CipherType::Ccmp,
        CIPHER_WEP104 => CipherType::Wep104,
        _ => CipherType::None,
    }
}

/// Parse an RSN element body (the bytes after the id/length header).
///
/// Trailing fields (RSN capabilities, PMKID list, group management
/// cipher) are tolerated and ignored.
pub fn parse(body: &[u8]) -> Result<RsnInfo, Error> {
    if body.len() < 8 {
        return Err(Error::Malformed);
    }
    if u16::from_le_bytes([body[0], body[1]]) != RSN_VERSION {
        return Err(Error::Unsupported);
    }
    let group = cipher_from_selector(&body[2..6]);

    let pairwise_count = u16::from_le_bytes([body[6], body[7]]) as usize;
    let mut offset = 8;
    if body.len() < offset + pairwise_count * 4 + 2 {
        return Err(Error::Malformed);
    }
    let mut pairwise = CipherType::None;
    for _ in 0..pairwise_count {
        let cipher = cipher_from_selector(&body[offset..offset + 4]);
        // CCMP wins over anything else on offer.
        if cipher == CipherType::Ccmp || pairwise == CipherType::None {
            pairwise = cipher;
        }
        offset += 4;
    }

    let akm_count = u16::from_le_bytes([body[offset], body[offset + 1]]) as usize;
    offset += 2;
    if body.len() < offset + akm_count * 4 {
        return Err(Error::Malformed);
    }
    let mut psk = false;
    for _ in 0..akm_count {
        let sel = &body[offset..offset + 4];
        if sel[..3] == OUI && sel[3] == AKM_PSK {
            psk = true;
        }
        offset += 4;
    }

    Ok(RsnInfo {
        group,
        pairwise,
        psk,
    })
}

/// The RSN element body this station advertises back to a CCMP/PSK AP in
/// its association request and handshake message 2.
pub fn station_rsn(group: CipherType) -> Vec<u8, MAX_RSN_LEN> {
    let group_selector = match group {
        CipherType::Tkip => CIPHER_TKIP,
        _ => CIPHER_CCMP,
    };
    let mut body = Vec::new();
    // Infallible: 22 bytes < MAX_RSN_LEN.
    body.extend_from_slice(&RSN_VERSION.to_le_bytes()).ok();
    body.extend_from_slice(&OUI).ok();
    body.push(group_selector).ok();
    body.extend_from_slice(&1u16.to_le_bytes()).ok();
    body.extend_from_slice(&OUI).ok();
    body.push(CIPHER_CCMP).ok();
    body.extend_from_slice(&1u16.to_le_bytes()).ok();
    body.extend_from_slice(&OUI).ok();
    body.push(AKM_PSK).ok();
    body.extend_from_slice(&0u16.to_le_bytes()).ok();
    body
}

#[cfg(test)]
mod test {
    use super::*;

    // Version 1, group CCMP, pairwise [TKIP, CCMP], AKM [PSK], caps 0.
    const WPA2_MIXED: &[u8] = &[
        0x01, 0x00, 0x00, 0x0f, 0xac, 0x04, 0x02, 0x00, 0x00, 0x0f, 0xac, 0x02, 0x00, 0x0f, 0xac,
        0x04, 0x01, 0x00, 0x00, 0x0f, 0xac, 0x02, 0x00, 0x00,
    ];

    #[test]
    fn parses_mixed_mode_preferring_ccmp() {
        let info = parse(WPA2_MIXED).unwrap();
        assert_eq!(info.group, CipherType::Ccmp);
        assert_eq!(info.pairwise, CipherType::Ccmp);
        assert!(info.psk);
    }

    #[test]
    fn station_rsn_parses_back() {
        let body = station_rsn(CipherType::Ccmp);
        let info = parse(&body).unwrap();
        assert_eq!(info.group, CipherType::Ccmp);
        assert_eq!(info.pairwise, CipherType::Ccmp);
        assert!(info.psk);
    }

    #[test]
    fn rejects_bad_version() {
        let mut body: std::vec::Vec<u8> = WPA2_MIXED.into();
        body[0] = 2;
        assert_eq!(parse(&body).unwrap_err(), Error::Unsupported);
    }

    #[test]
    fn rejects_truncated_suite_list() {
        // Claims two pairwise suites but carries one.
        let body = [
            0x01, 0x00, 0x00, 0x0f, 0xac, 0x04, 0x02, 0x00, 0x00, 0x0f, 0xac, 0x04,
        ];
        assert_eq!(parse(&body).unwrap_err(), Error::Malformed);
    }

    #[test]
    fn enterprise_only_akm_is_not_psk() {
        let body = [
            0x01, 0x00, 0x00, 0x0f, 0xac, 0x04, 0x01, 0x00, 0x00, 0x0f, 0xac, 0x04, 0x01, 0x00,
            0x00, 0x0f, 0xac, 0x01,
        ];
        let info = parse(&body).unwrap();
        assert!(!info.psk);
    }
}
