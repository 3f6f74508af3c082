#![cfg_attr(all(not(test), not(feature = "std")), no_std)]
#![allow(async_fn_in_trait)]

//! Station-mode IEEE 802.11 MAC sublayer.
//!
//! Sits between a raw radio driver (below) and a network stack (above):
//! scans for networks, walks the authenticate/associate/4-way-handshake
//! lifecycle, encrypts and decrypts data frames (CCMP, legacy WEP), and
//! buffers outbound traffic across reassociation.
//!
//! The embedding supplies a [`Driver`] for the radio, keeps one
//! [`State`] alive per interface, and polls the [`Runner`] in a
//! background task. The driver feeds inbound MPDUs to [`Rx::receive`];
//! the stack above sends through [`Control::send`] and manages the
//! connection through the rest of [`Control`].

mod fmt;

mod bss;
mod config;
mod control;
mod crypto;
mod device;
mod eapol;
mod error;
mod frame;
mod handshake;
mod key;
mod link;
mod rsn;
mod runner;

pub use bss::{BssDescription, BssHandle};
pub use config::{Config, Properties, MAX_PASSPHRASE_LEN, MAX_SSID_LEN};
pub use control::{Control, Rx, RxData, StationInfo};
pub use device::Driver;
pub use error::{Error, JoinError};
pub use key::CipherType;
pub use link::{LinkState, ScanRequest, State, Stats, MAX_MPDU};
pub use runner::Runner;

/// Bind a radio driver to link storage, yielding the three per-link
/// handles: the control surface, the receive entry point, and the
/// background runner that must be polled for the link to operate.
pub fn new<'a, D: Driver>(state: &'a State, driver: D) -> (Control<'a>, Rx<'a>, Runner<'a, D>) {
    (
        Control::new(state),
        Rx::new(state),
        Runner::new(state, driver),
    )
}
