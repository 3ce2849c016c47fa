//! Core library for `patchram`, a DFU (Device Firmware Upgrade) utility for
//! Broadcom PatchRAM USB Bluetooth controllers.
//!
//! The crate is split along the upgrade pipeline:
//!
//! - [`firmware`] turns a firmware file (Intel HEX text, optionally
//!   zlib-compressed) into the ordered sequence of vendor-specific
//!   LAUNCH_RAM commands the controller expects.
//! - [`hci`] builds the outgoing HCI command packets and classifies the
//!   HCI events the controller sends back.
//! - [`devices`] knows which controllers use the post-download handshake
//!   and how to name a controller from its `lmp_subver`.
//! - [`transport`] defines the [`Transport`] trait the upgrade loop drives;
//!   the `patchram` binary implements it over rusb, tests implement it
//!   in memory.
//! - [`upgrade`] is the state machine that sequences the whole exchange.

pub mod devices;
pub mod firmware;
pub mod hci;
pub mod transport;
pub mod upgrade;

pub use firmware::{FirmwareError, ParseError, decompress, parse_firmware};
pub use hci::ProtocolError;
pub use transport::{Transport, UsbError};
pub use upgrade::{UpgradeConfig, UpgradeOutcome, run_upgrade};

pub trait ProgressReporter {
    fn start(&mut self, total_bytes: usize);
    fn advance(&mut self, bytes: usize);
    fn finish(&mut self);
}

pub struct NoProgress;
impl ProgressReporter for NoProgress {
    fn start(&mut self, _total_bytes: usize) {}
    fn advance(&mut self, _bytes: usize) {}
    fn finish(&mut self) {}
}
