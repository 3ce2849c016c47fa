//! Firmware loading: zlib detection/inflation and Intel HEX parsing.
//!
//! A PatchRAM firmware image is Intel HEX text (`.hex`/`.dfu`), sometimes
//! shipped zlib-compressed. Parsing emits one fully framed LAUNCH_RAM HCI
//! command per DATA record, in file order; the upgrade machine later
//! transmits them in that exact order.

use std::io::Read;

use flate2::read::ZlibDecoder;
use log::error;
use thiserror::Error;

use crate::hci;

const HEX_LINE_PREFIX: u8 = b':';
const HEX_HEADER_SIZE: usize = 4;

const REC_TYPE_DATA: u8 = 0;
const REC_TYPE_EOF: u8 = 1;
const REC_TYPE_ESA: u8 = 2;
const REC_TYPE_SSA: u8 = 3;
const REC_TYPE_ELA: u8 = 4;
const REC_TYPE_SLA: u8 = 5;

/// Inflated images are on the order of tens of KiB; reserve for the
/// largest ones up front.
const DECOMPRESS_CAPACITY: usize = 1024 * 100;

#[derive(Error, Debug)]
pub enum FirmwareError {
    #[error("firmware decompression failed")]
    Corrupt,
    #[error("failed to parse firmware")]
    Parse(#[from] ParseError),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("firmware does not start with a ':' record prefix")]
    BadPrefix,
    #[error("record checksum mismatch (stated {stated:#04x}, computed {computed:#04x})")]
    Checksum { stated: u8, computed: u8 },
    #[error("unsupported start address record type {0:#04x}")]
    UnsupportedRecord(u8),
    #[error("unknown record type {0:#04x}")]
    UnknownRecord(u8),
    #[error("firmware ended before a complete end-of-file record")]
    Truncated,
}

/// Inflate a zlib-wrapped firmware image.
///
/// Returns `(data, true)` when the input carried the zlib magic and was
/// inflated, `(input, false)` when it is used as-is. A wrapper that fails
/// to inflate is fatal.
pub fn decompress(input: &[u8]) -> Result<(Vec<u8>, bool), FirmwareError> {
    if !is_zlib_compressed(input) {
        return Ok((input.to_vec(), false));
    }

    let mut output = Vec::with_capacity(DECOMPRESS_CAPACITY);
    let mut decoder = ZlibDecoder::new(input);
    decoder.read_to_end(&mut output).map_err(|err| {
        error!("zlib inflate failed: {err}");
        FirmwareError::Corrupt
    })?;

    Ok((output, true))
}

// Zlib magic: 0x78 followed by the no/default/maximum compression flag byte.
fn is_zlib_compressed(data: &[u8]) -> bool {
    matches!(data, [0x78, 0x01 | 0x9c | 0xda, ..])
}

/// Parse Intel HEX firmware text into the ordered LAUNCH_RAM instruction
/// sequence for device `vendor_id:product_id`.
///
/// Each DATA record becomes one vendor-specific HCI command:
/// `4c fc <len+4> <addr32 LE> <payload>`. The 32-bit address is threaded
/// across records: ESA and ELA records update it, DATA records replace its
/// low 16 bits. Only the I32HEX record set is supported; start address
/// records (SSA/SLA) are rejected.
pub fn parse_firmware(
    data: &[u8],
    vendor_id: u16,
    product_id: u16,
) -> Result<Vec<Vec<u8>>, ParseError> {
    let mut instructions = Vec::new();
    let mut address: u32 = 0;
    let mut pos = 0;

    while pos < data.len() && data[pos].is_ascii_whitespace() {
        pos += 1;
    }

    if pos >= data.len() || data[pos] != HEX_LINE_PREFIX {
        error!("[{vendor_id:04x}:{product_id:04x}]: invalid firmware data");
        return Err(ParseError::BadPrefix);
    }

    let mut binary = Vec::with_capacity(0x110);

    while pos < data.len() && data[pos] == HEX_LINE_PREFIX {
        pos += 1;
        binary.clear();

        // Accumulate the record's hex digits pairwise into bytes.
        while pos + 1 < data.len()
            && data[pos].is_ascii_hexdigit()
            && data[pos + 1].is_ascii_hexdigit()
        {
            binary.push(hex_pair(data[pos], data[pos + 1]));
            pos += 2;
        }

        if binary.len() < HEX_HEADER_SIZE + 1 {
            return Err(ParseError::Truncated);
        }

        let length = binary[0] as usize;
        if binary.len() < HEX_HEADER_SIZE + length + 1 {
            return Err(ParseError::Truncated);
        }

        let addr = u16::from_be_bytes([binary[1], binary[2]]);
        let record_type = binary[3];
        let payload = &binary[HEX_HEADER_SIZE..HEX_HEADER_SIZE + length];

        let stated = binary[HEX_HEADER_SIZE + length];
        let computed = checksum(&binary[..HEX_HEADER_SIZE + length]);
        if stated != computed {
            error!("[{vendor_id:04x}:{product_id:04x}]: invalid firmware, checksum mismatch");
            return Err(ParseError::Checksum { stated, computed });
        }

        match record_type {
            REC_TYPE_DATA => {
                address = (address & 0xffff_0000) | u32::from(addr);

                let mut instruction = Vec::with_capacity(3 + HEX_HEADER_SIZE + length);
                instruction.extend_from_slice(&hci::opcode::LAUNCH_RAM.to_le_bytes());
                instruction.push((length + HEX_HEADER_SIZE) as u8);
                instruction.extend_from_slice(&address.to_le_bytes());
                instruction.extend_from_slice(payload);
                instructions.push(instruction);
            }
            REC_TYPE_EOF => {
                // A well-formed image carries at least one DATA record.
                if instructions.is_empty() {
                    return Err(ParseError::Truncated);
                }
                return Ok(instructions);
            }
            REC_TYPE_ESA => {
                // Segment address, multiplied by 16.
                let [hi, lo] = extended_address(payload)?;
                address = u32::from(u16::from_be_bytes([hi, lo])) << 4;
            }
            REC_TYPE_ELA => {
                // New upper 16 bits of the running address; the low 16 bits
                // are cleared until the next DATA record supplies them.
                let [hi, lo] = extended_address(payload)?;
                address = u32::from(hi) << 24 | u32::from(lo) << 16;
            }
            REC_TYPE_SSA | REC_TYPE_SLA => {
                error!(
                    "[{vendor_id:04x}:{product_id:04x}]: invalid firmware, unsupported start address record"
                );
                return Err(ParseError::UnsupportedRecord(record_type));
            }
            other => {
                error!(
                    "[{vendor_id:04x}:{product_id:04x}]: invalid firmware, unknown record type {other:#04x}"
                );
                return Err(ParseError::UnknownRecord(other));
            }
        }

        // Skip trailing newlines / whitespace between records.
        while pos < data.len() && !data[pos].is_ascii_hexdigit() && data[pos] != HEX_LINE_PREFIX {
            pos += 1;
        }
    }

    Err(ParseError::Truncated)
}

fn extended_address(payload: &[u8]) -> Result<[u8; 2], ParseError> {
    match payload {
        [hi, lo, ..] => Ok([*hi, *lo]),
        _ => Err(ParseError::Truncated),
    }
}

// Two's complement of the byte sum, as stated in the record's last byte.
fn checksum(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0u32, |sum, b| sum.wrapping_add(u32::from(*b)));
    (!sum).wrapping_add(1) as u8
}

fn hex_pair(hi: u8, lo: u8) -> u8 {
    hex_val(hi) << 4 | hex_val(lo)
}

fn hex_val(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        _ => digit - b'A' + 10,
    }
}
