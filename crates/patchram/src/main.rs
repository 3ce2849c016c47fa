use std::{
    fs::File,
    io::{Read, Stdout, Write},
    path::Path,
    time::Duration,
};

use anyhow::{Context, bail};
use clap::Parser;
use env_logger::Env;
use log::Level;
use patchram_core::{ProgressReporter, UpgradeConfig, UpgradeOutcome, devices, firmware};
use pbr::{ProgressBar, Units};

pub mod usb;

#[derive(Parser, Debug)]
#[clap(version, about = "Broadcom PatchRAM DFU (Device Firmware Upgrade) utility", long_about = None)]
struct Opts {
    /// Verbose
    #[clap(short, long)]
    verbose: bool,

    /// Delay before the first firmware instruction, in milliseconds
    #[clap(long, default_value_t = 100)]
    initial_delay: u64,

    /// Delay before the proactive post-download reset, in milliseconds
    #[clap(long, default_value_t = 250)]
    pre_reset_delay: u64,

    /// Delay after each controller reset, in milliseconds
    #[clap(long, default_value_t = 100)]
    post_reset_delay: u64,

    /// Device vendor id, hex (e.g. 0a5c)
    #[clap(value_parser = hex_parser)]
    vendor_id: u16,

    /// Device product id, hex (e.g. 216f)
    #[clap(value_parser = hex_parser)]
    product_id: u16,

    /// Firmware file (.hex or .dfu, optionally zlib-compressed)
    firmware: String,
}

// Device ids are conventionally given as bare hex (lsusb style); accept an
// optional 0x prefix too.
fn hex_parser(s: &str) -> Result<u16, &'static str> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u16::from_str_radix(digits, 16).map_err(|_| "invalid hex number")
}

struct ProgressBarReporter {
    pb: ProgressBar<Stdout>,
}

impl ProgressReporter for ProgressBarReporter {
    fn start(&mut self, total_bytes: usize) {
        self.pb.total = total_bytes as u64;
        self.pb.set_units(Units::Bytes);
    }

    fn advance(&mut self, bytes: usize) {
        self.pb.add(bytes as u64);
    }

    fn finish(&mut self) {
        self.pb.finish();
    }
}

impl ProgressBarReporter {
    pub fn new() -> Self {
        Self {
            pb: ProgressBar::new(0),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let options = Opts::parse();

    if options.verbose {
        env_logger::Builder::from_env(Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .format(|buf, record| {
                let level = record.level();
                if level == Level::Info {
                    writeln!(buf, "{}", record.args())
                } else {
                    writeln!(buf, "{}: {}", record.level(), record.args())
                }
            })
            .init();
    }

    println!("patchram, Broadcom PatchRAM DFU (Device Firmware Upgrade) utility.");
    println!("Based on the original dfu-util for Linux and BrcmPatchRAM for macOS.");
    println!();

    let use_handshake = devices::supports_handshake(options.vendor_id, options.product_id);
    let config = UpgradeConfig {
        initial_delay: Duration::from_millis(options.initial_delay),
        pre_reset_delay: Duration::from_millis(options.pre_reset_delay),
        post_reset_delay: Duration::from_millis(options.post_reset_delay),
        use_handshake,
        ..UpgradeConfig::default()
    };

    log::debug!(
        "[{:04x}:{:04x}]: initialDelay: {:?} preResetDelay: {:?} postResetDelay: {:?} useHandshake: {}",
        options.vendor_id,
        options.product_id,
        config.initial_delay,
        config.pre_reset_delay,
        config.post_reset_delay,
        config.use_handshake,
    );

    log::info!("Reading firmware from {:?}", options.firmware);

    let mut file = File::open(&options.firmware)
        .with_context(|| format!("error reading file '{}'", options.firmware))?;
    let mut raw = Vec::new();
    file.read_to_end(&mut raw)
        .with_context(|| format!("error reading file '{}'", options.firmware))?;

    // .hex and .dfu files are Intel HEX text as-is; anything else must
    // carry the zlib wrapper.
    let extension = Path::new(&options.firmware)
        .extension()
        .and_then(|ext| ext.to_str());
    let data = match extension {
        Some("hex") | Some("dfu") => raw,
        _ => {
            let (data, was_compressed) = firmware::decompress(&raw)?;
            if !was_compressed {
                bail!(
                    "'{}' is neither Intel HEX nor zlib-compressed firmware",
                    options.firmware
                );
            }
            log::debug!("inflated firmware ({} -> {} bytes)", raw.len(), data.len());
            data
        }
    };

    let instructions = firmware::parse_firmware(&data, options.vendor_id, options.product_id)
        .context("invalid firmware")?;
    log::info!("Firmware parsed ({} instructions)", instructions.len());

    let outcome = usb::upload_firmware(
        options.vendor_id,
        options.product_id,
        &instructions,
        &config,
        ProgressBarReporter::new(),
    )?;

    // New line after progress bar
    println!();

    match outcome {
        UpgradeOutcome::Complete => {}
        UpgradeOutcome::NotNeeded => println!("Update not needed."),
        UpgradeOutcome::Aborted => bail!("firmware upgrade aborted"),
    }

    println!("Done.");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_parser_accepts_bare_and_prefixed() {
        assert_eq!(hex_parser("0a5c"), Ok(0x0a5c));
        assert_eq!(hex_parser("0x216f"), Ok(0x216f));
        assert_eq!(hex_parser("E07A"), Ok(0xe07a));
        assert!(hex_parser("patch").is_err());
        assert!(hex_parser("10000").is_err());
    }
}
