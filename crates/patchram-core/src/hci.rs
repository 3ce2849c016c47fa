//! HCI command framing and event classification.
//!
//! Outgoing commands are the literal on-wire bytes
//! `opcode_lo opcode_hi param_len params...`; the USB control transfer
//! carries the total length separately, so there is no extra framing.
//! Incoming events are `event_code param_len params...`.

use log::warn;
use thiserror::Error;

/// Command opcodes the upgrade sequence uses.
pub mod opcode {
    pub const RESET: u16 = 0x0c03;
    pub const READ_LOCAL_VERSION: u16 = 0x1001;

    // Broadcom vendor specific.
    pub const DOWNLOAD_MINIDRIVER: u16 = 0xfc2e;
    pub const LAUNCH_RAM: u16 = 0xfc4c;
    pub const END_OF_RECORD: u16 = 0xfc4e;
    pub const READ_USB_PRODUCT: u16 = 0xfc5a;
    pub const READ_VERBOSE_CONFIG: u16 = 0xfc79;
}

mod event_code {
    pub const CONN_COMPLETE: u8 = 0x03;
    pub const DISCONN_COMPLETE: u8 = 0x05;
    pub const COMMAND_COMPLETE: u8 = 0x0e;
    pub const HARDWARE_ERROR: u8 = 0x10;
    pub const NUM_COMPLETED_PACKETS: u8 = 0x13;
    pub const MODE_CHANGE: u8 = 0x14;
    pub const LE_META: u8 = 0x3e;
    pub const VENDOR: u8 = 0xff;
}

const fn command(opcode: u16) -> [u8; 3] {
    [(opcode & 0xff) as u8, (opcode >> 8) as u8, 0x00]
}

// Standard HCI commands.
pub const RESET: [u8; 3] = command(opcode::RESET);
pub const READ_LOCAL_VERSION: [u8; 3] = command(opcode::READ_LOCAL_VERSION);

// Broadcom vendor specific commands.

/// Read chip id and other Broadcom configuration variables.
pub const READ_VERBOSE_CONFIG: [u8; 3] = command(opcode::READ_VERBOSE_CONFIG);

pub const READ_USB_PRODUCT: [u8; 3] = command(opcode::READ_USB_PRODUCT);

/// Start the boot mini-driver that accepts LAUNCH_RAM records.
pub const DOWNLOAD_MINIDRIVER: [u8; 3] = command(opcode::DOWNLOAD_MINIDRIVER);

/// Terminate the firmware record stream.
pub const END_OF_RECORD: [u8; 7] = [0x4e, 0xfc, 0x04, 0xff, 0xff, 0xff, 0xff];

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("short HCI event ({have} bytes, need {need})")]
    ShortEvent { have: usize, need: usize },
    #[error("unknown event code {0:#04x}")]
    UnexpectedEvent(u8),
}

/// A classified HCI event.
///
/// `CommandComplete::tail` is the payload past the status byte; the typed
/// readers below pull the interrogation responses out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event<'a> {
    CommandComplete {
        opcode: u16,
        status: u8,
        tail: &'a [u8],
    },
    ConnComplete,
    DisconnComplete,
    HardwareError,
    NumCompletedPackets,
    ModeChange,
    LeMeta,
    Vendor,
}

pub fn parse_event(bytes: &[u8]) -> Result<Event<'_>, ProtocolError> {
    if bytes.len() < 2 {
        return Err(ProtocolError::ShortEvent {
            have: bytes.len(),
            need: 2,
        });
    }

    let param_len = bytes[1] as usize;
    if bytes.len() < 2 + param_len {
        return Err(ProtocolError::ShortEvent {
            have: bytes.len(),
            need: 2 + param_len,
        });
    }
    let params = &bytes[2..2 + param_len];

    match bytes[0] {
        event_code::COMMAND_COMPLETE => {
            // num_hci_pkts, opcode (LE), status.
            if params.len() < 4 {
                return Err(ProtocolError::ShortEvent {
                    have: bytes.len(),
                    need: 6,
                });
            }

            let opcode = u16::from_le_bytes([params[1], params[2]]);
            let status = params[3];
            if status != 0 {
                // Several vendor commands report a non-zero but benign
                // status during DFU; surface it without failing.
                warn!("command {opcode:#06x} completed with status {status:#04x}");
            }

            Ok(Event::CommandComplete {
                opcode,
                status,
                tail: &params[4..],
            })
        }
        event_code::CONN_COMPLETE => Ok(Event::ConnComplete),
        event_code::DISCONN_COMPLETE => Ok(Event::DisconnComplete),
        event_code::HARDWARE_ERROR => Ok(Event::HardwareError),
        event_code::NUM_COMPLETED_PACKETS => Ok(Event::NumCompletedPackets),
        event_code::MODE_CHANGE => Ok(Event::ModeChange),
        event_code::LE_META => Ok(Event::LeMeta),
        event_code::VENDOR => Ok(Event::Vendor),
        other => Err(ProtocolError::UnexpectedEvent(other)),
    }
}

/// READ_LOCAL_VERSION response fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalVersion {
    pub hci_ver: u8,
    pub hci_rev: u16,
    pub lmp_ver: u8,
    pub manufacturer: u16,
    pub lmp_subver: u16,
}

impl LocalVersion {
    pub fn parse(tail: &[u8]) -> Option<Self> {
        match *tail {
            [hci_ver, rev_lo, rev_hi, lmp_ver, man_lo, man_hi, sub_lo, sub_hi, ..] => Some(Self {
                hci_ver,
                hci_rev: u16::from_le_bytes([rev_lo, rev_hi]),
                lmp_ver,
                manufacturer: u16::from_le_bytes([man_lo, man_hi]),
                lmp_subver: u16::from_le_bytes([sub_lo, sub_hi]),
            }),
            _ => None,
        }
    }
}

/// `(vendor_id, product_id)` from the READ_USB_PRODUCT response.
pub fn parse_usb_product(tail: &[u8]) -> Option<(u16, u16)> {
    match *tail {
        [vid_lo, vid_hi, pid_lo, pid_hi, ..] => Some((
            u16::from_le_bytes([vid_lo, vid_hi]),
            u16::from_le_bytes([pid_lo, pid_hi]),
        )),
        _ => None,
    }
}

/// READ_VERBOSE_CONFIG response fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerboseConfig {
    pub chipset_id: u8,
    /// Build number of the firmware currently running; zero for an
    /// unpatched ROM.
    pub build: u16,
}

impl VerboseConfig {
    pub fn parse(tail: &[u8]) -> Option<Self> {
        match *tail {
            [chipset_id, _, _, _, build_lo, build_hi, ..] => Some(Self {
                chipset_id,
                build: u16::from_le_bytes([build_lo, build_hi]),
            }),
            _ => None,
        }
    }

    pub fn firmware_version(&self) -> u16 {
        self.build + 0x1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_bytes_match_wire_format() {
        assert_eq!(RESET, [0x03, 0x0c, 0x00]);
        assert_eq!(READ_LOCAL_VERSION, [0x01, 0x10, 0x00]);
        assert_eq!(READ_VERBOSE_CONFIG, [0x79, 0xfc, 0x00]);
        assert_eq!(READ_USB_PRODUCT, [0x5a, 0xfc, 0x00]);
        assert_eq!(DOWNLOAD_MINIDRIVER, [0x2e, 0xfc, 0x00]);
        assert_eq!(&END_OF_RECORD[..3], [0x4e, 0xfc, 0x04]);
    }

    #[test]
    fn command_complete_parsed() {
        let bytes = [0x0e, 0x04, 0x01, 0x03, 0x0c, 0x00];
        let event = parse_event(&bytes).unwrap();

        assert_eq!(
            event,
            Event::CommandComplete {
                opcode: opcode::RESET,
                status: 0,
                tail: &[],
            }
        );
    }

    #[test]
    fn command_complete_tail_readers() {
        // READ_LOCAL_VERSION response for a BCM20702A0 (lmp_subver 0x2118).
        let bytes = [
            0x0e, 0x0c, 0x01, 0x01, 0x10, 0x00, // complete header + status
            0x06, 0x0c, 0x10, 0x06, 0x0f, 0x00, 0x18, 0x21,
        ];
        let Event::CommandComplete { opcode, tail, .. } = parse_event(&bytes).unwrap() else {
            panic!("expected command complete");
        };
        assert_eq!(opcode, opcode::READ_LOCAL_VERSION);

        let version = LocalVersion::parse(tail).unwrap();
        assert_eq!(version.hci_ver, 0x06);
        assert_eq!(version.hci_rev, 0x100c);
        assert_eq!(version.manufacturer, 0x000f);
        assert_eq!(version.lmp_subver, 0x2118);
    }

    #[test]
    fn usb_product_and_verbose_config_readers() {
        assert_eq!(
            parse_usb_product(&[0x5c, 0x0a, 0x6f, 0x21]),
            Some((0x0a5c, 0x216f))
        );
        assert_eq!(parse_usb_product(&[0x5c, 0x0a]), None);

        let config = VerboseConfig::parse(&[0x49, 0x00, 0x00, 0x00, 0x22, 0x01]).unwrap();
        assert_eq!(config.chipset_id, 0x49);
        assert_eq!(config.build, 0x0122);
        assert_eq!(config.firmware_version(), 0x1122);
    }

    #[test]
    fn short_events_rejected() {
        assert_eq!(
            parse_event(&[0x0e]),
            Err(ProtocolError::ShortEvent { have: 1, need: 2 })
        );
        // param_len claims more bytes than the packet carries.
        assert_eq!(
            parse_event(&[0x0e, 0x0a, 0x01]),
            Err(ProtocolError::ShortEvent { have: 3, need: 12 })
        );
        // Command complete needs at least the opcode and status.
        assert!(parse_event(&[0x0e, 0x02, 0x01, 0x03]).is_err());
    }

    #[test]
    fn unknown_event_code_rejected() {
        assert_eq!(
            parse_event(&[0x42, 0x00]),
            Err(ProtocolError::UnexpectedEvent(0x42))
        );
    }

    #[test]
    fn vendor_event_carries_no_payload() {
        assert_eq!(parse_event(&[0xff, 0x01, 0x00]), Ok(Event::Vendor));
    }
}
