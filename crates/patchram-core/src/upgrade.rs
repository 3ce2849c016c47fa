//! The firmware upgrade state machine.
//!
//! One upgrade run is a single-threaded, blocking loop: reset the
//! controller, interrogate it (local version, USB product, verbose
//! config), start the boot mini-driver, stream the LAUNCH_RAM records
//! over the bulk pipe, terminate with END_OF_RECORD, and reset into the
//! patched personality. Each outbound command is followed by one
//! interrupt-in read whose event drives the next transition; a read
//! timeout leaves the state untouched so the action is simply re-issued.
//!
//! Handshake-variant controllers (see [`crate::devices`]) emit an
//! unsolicited vendor event after END_OF_RECORD; for those the machine
//! must wait for it instead of resetting on its own.

use std::fmt;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::ProgressReporter;
use crate::devices;
use crate::hci::{self, Event, LocalVersion, VerboseConfig};
use crate::transport::{Transport, UsbError};

/// Scratch buffer for one interrupt-in event read.
pub const EVENT_BUFFER_SIZE: usize = 512;

/// Timing and behaviour knobs for one upgrade run.
///
/// The delays are load-bearing: without `initial_delay` after the
/// mini-driver download the controller is not ready for the firmware
/// records and stops responding.
#[derive(Debug, Clone)]
pub struct UpgradeConfig {
    /// Sleep before the first firmware instruction.
    pub initial_delay: Duration,
    /// Sleep before the proactive post-download reset.
    pub pre_reset_delay: Duration,
    /// Sleep after every controller reset.
    pub post_reset_delay: Duration,
    /// Timeout for each USB transfer.
    pub hci_timeout: Duration,
    /// Wait for the controller's vendor event before the final reset.
    pub use_handshake: bool,
    /// Stream the firmware even when the controller already reports a
    /// patched build.
    pub force_update: bool,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            pre_reset_delay: Duration::from_millis(250),
            post_reset_delay: Duration::from_millis(100),
            hci_timeout: Duration::from_millis(5000),
            use_handshake: false,
            force_update: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeOutcome {
    Complete,
    NotNeeded,
    Aborted,
}

impl UpgradeOutcome {
    pub fn is_success(self) -> bool {
        !matches!(self, UpgradeOutcome::Aborted)
    }
}

/// Machine state. The index of the next firmware instruction lives only
/// in the states that stream instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    PreInit,
    LocalVersion,
    UsbProduct,
    FirmwareVersion,
    DownloadMinidriver,
    MinidriverComplete,
    InstructionWrite { next: usize },
    InstructionWritten { next: usize },
    FirmwareWritten,
    ResetWrite,
    ResetComplete,
    Done(UpgradeOutcome),
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::PreInit => "Pre-initialize",
            State::LocalVersion => "Local version",
            State::UsbProduct => "USB product",
            State::FirmwareVersion => "Firmware version",
            State::DownloadMinidriver => "Download mini-driver",
            State::MinidriverComplete => "Mini-driver complete",
            State::InstructionWrite { .. } => "Instruction write",
            State::InstructionWritten { .. } => "Instruction written",
            State::FirmwareWritten => "Firmware written",
            State::ResetWrite => "Reset write",
            State::ResetComplete => "Reset complete",
            State::Done(UpgradeOutcome::Complete) => "Update complete",
            State::Done(UpgradeOutcome::NotNeeded) => "Update not needed",
            State::Done(UpgradeOutcome::Aborted) => "Update aborted",
        })
    }
}

/// Drive one complete upgrade over `transport`.
///
/// `instructions` is the parsed LAUNCH_RAM sequence, transmitted in
/// order. Returns the terminal outcome; the interrupt-in and bulk-out
/// pipes are aborted on every exit path.
pub fn run_upgrade<T: Transport>(
    transport: &mut T,
    instructions: &[Vec<u8>],
    config: &UpgradeConfig,
    mut progress: impl ProgressReporter,
) -> UpgradeOutcome {
    let mut state = State::PreInit;
    let mut previous: Option<State> = None;
    let mut buffer = [0u8; EVENT_BUFFER_SIZE];

    progress.start(instructions.iter().map(Vec::len).sum());

    let outcome = loop {
        if previous != Some(state)
            && !matches!(
                state,
                State::InstructionWrite { .. } | State::InstructionWritten { .. }
            )
        {
            match previous {
                Some(prev) => debug!("state '{prev}' -> '{state}'"),
                None => debug!("state '{state}'"),
            }
        }
        previous = Some(state);

        if let State::Done(outcome) = state {
            break outcome;
        }

        // Actions that transition without a device response `continue` to
        // the loop head; everything else falls through to one
        // interrupt-in read.
        match state {
            State::PreInit => {
                // Reset the device to put it in a defined state.
                if !send(transport, "HCI_RESET", &hci::RESET, config) {
                    state = State::Done(UpgradeOutcome::Aborted);
                    continue;
                }
            }

            State::LocalVersion => {
                // Wait for the device to become ready after reset.
                thread::sleep(config.post_reset_delay);

                if !send(
                    transport,
                    "HCI_READ_LOCAL_VERSION",
                    &hci::READ_LOCAL_VERSION,
                    config,
                ) {
                    state = State::Done(UpgradeOutcome::Aborted);
                    continue;
                }
            }

            State::UsbProduct => {
                if !send(
                    transport,
                    "HCI_VSC_READ_USB_PRODUCT",
                    &hci::READ_USB_PRODUCT,
                    config,
                ) {
                    state = State::Done(UpgradeOutcome::Aborted);
                    continue;
                }
            }

            State::FirmwareVersion => {
                if !send(
                    transport,
                    "HCI_VSC_READ_VERBOSE_CONFIG",
                    &hci::READ_VERBOSE_CONFIG,
                    config,
                ) {
                    state = State::Done(UpgradeOutcome::Aborted);
                    continue;
                }
            }

            State::DownloadMinidriver => {
                if !send(
                    transport,
                    "HCI_VSC_DOWNLOAD_MINIDRIVER",
                    &hci::DOWNLOAD_MINIDRIVER,
                    config,
                ) {
                    state = State::Done(UpgradeOutcome::Aborted);
                    continue;
                }
            }

            State::MinidriverComplete => {
                // Without this delay the controller is not yet ready to
                // receive the firmware instructions and stops responding.
                thread::sleep(config.initial_delay);

                // Write the first instruction to trigger a response.
                if let Some(first) = instructions.first() {
                    if let Err(err) = transport.bulk_out(first, config.hci_timeout) {
                        error!("firmware instruction write failed, aborting: {err}");
                        state = State::Done(UpgradeOutcome::Aborted);
                        continue;
                    }
                    progress.advance(first.len());
                }
            }

            State::InstructionWrite { next } => {
                if let Some(instruction) = instructions.get(next) {
                    if let Err(err) = transport.bulk_out(instruction, config.hci_timeout) {
                        error!("firmware instruction write failed, aborting: {err}");
                        state = State::Done(UpgradeOutcome::Aborted);
                        continue;
                    }
                    progress.advance(instruction.len());
                } else {
                    // Firmware data fully written.
                    if !send(
                        transport,
                        "HCI_VSC_END_OF_RECORD",
                        &hci::END_OF_RECORD,
                        config,
                    ) {
                        state = State::Done(UpgradeOutcome::Aborted);
                        continue;
                    }
                }
            }

            State::InstructionWritten { next } => {
                state = State::InstructionWrite { next };
                continue;
            }

            State::FirmwareWritten => {
                // Handshake controllers announce readiness for reset with
                // an unsolicited vendor event; fall through to the read
                // and wait for it. Everything else is reset proactively.
                if !config.use_handshake {
                    thread::sleep(config.pre_reset_delay);

                    if !send(transport, "HCI_RESET", &hci::RESET, config) {
                        state = State::Done(UpgradeOutcome::Aborted);
                        continue;
                    }
                }
            }

            State::ResetWrite => {
                if !send(transport, "HCI_RESET", &hci::RESET, config) {
                    state = State::Done(UpgradeOutcome::Aborted);
                    continue;
                }
            }

            State::ResetComplete => {
                thread::sleep(config.post_reset_delay);

                match transport.get_status(config.hci_timeout) {
                    Ok(status) => debug!("reset complete ({status:#06x})"),
                    Err(err) => debug!("GET_STATUS after reset failed: {err}"),
                }

                info!("firmware upgrade complete");
                state = State::Done(UpgradeOutcome::Complete);
                continue;
            }

            State::Done(_) => unreachable!("terminal states exit at the loop head"),
        }

        buffer.fill(0);
        match transport.interrupt_in(&mut buffer, config.hci_timeout) {
            Ok(len) => state = handle_event(state, &buffer[..len], config),
            Err(UsbError::TimedOut) => {
                // Vendor events can be slow; keep waiting.
                warn!("transaction timeout");
            }
            Err(err @ (UsbError::Stalled | UsbError::NotResponding)) => {
                error!("interrupt read failed: {err}");
                transport.clear_stall();
                state = State::Done(UpgradeOutcome::Aborted);
            }
            Err(err) => {
                error!("interrupt read failed: {err}");
                state = State::Done(UpgradeOutcome::Aborted);
            }
        }
    };

    transport.abort_pipes();
    progress.finish();

    outcome
}

fn send<T: Transport>(
    transport: &mut T,
    name: &str,
    command: &[u8],
    config: &UpgradeConfig,
) -> bool {
    match transport.control_out(command, config.hci_timeout) {
        Ok(()) => true,
        Err(err) => {
            error!("{name} failed, aborting: {err}");
            false
        }
    }
}

fn handle_event(state: State, bytes: &[u8], config: &UpgradeConfig) -> State {
    let event = match hci::parse_event(bytes) {
        Ok(event) => event,
        Err(err) => {
            error!("{err}");
            return state;
        }
    };

    match event {
        Event::CommandComplete { opcode, tail, .. } => match opcode {
            hci::opcode::READ_LOCAL_VERSION => {
                if let Some(version) = LocalVersion::parse(tail) {
                    info!(
                        "Local version: {}",
                        devices::firmware_display(version.lmp_subver, version.hci_rev)
                    );
                }
                State::UsbProduct
            }

            hci::opcode::READ_USB_PRODUCT => {
                if let Some((vid, pid)) = hci::parse_usb_product(tail) {
                    info!("USB product vendorId: {vid:#06x} productId: {pid:#06x}");
                }
                State::FirmwareVersion
            }

            hci::opcode::READ_VERBOSE_CONFIG => {
                let verbose = VerboseConfig::parse(tail);
                if let Some(verbose) = verbose {
                    info!(
                        "ChipsetId: {} build: {:04} firmware: v{}",
                        verbose.chipset_id,
                        verbose.build,
                        verbose.firmware_version()
                    );
                }

                // A non-zero build means the controller is already running
                // patched firmware.
                if !config.force_update && verbose.is_some_and(|v| v.build > 0) {
                    info!("update not needed");
                    State::Done(UpgradeOutcome::NotNeeded)
                } else {
                    State::DownloadMinidriver
                }
            }

            hci::opcode::DOWNLOAD_MINIDRIVER => State::MinidriverComplete,

            hci::opcode::LAUNCH_RAM => match state {
                State::MinidriverComplete => State::InstructionWritten { next: 1 },
                State::InstructionWrite { next } => State::InstructionWritten { next: next + 1 },
                _ => {
                    warn!("unexpected LAUNCH_RAM completion in state '{state}'");
                    state
                }
            },

            hci::opcode::END_OF_RECORD => State::FirmwareWritten,

            hci::opcode::RESET => {
                // The first reset response arms the interrogation; the
                // final one confirms the patched personality.
                if state == State::PreInit {
                    State::LocalVersion
                } else {
                    State::ResetComplete
                }
            }

            other => {
                debug!("command complete for {other:#06x}");
                state
            }
        },

        Event::Vendor => {
            if config.use_handshake {
                debug!("vendor event, controller ready for reset");
                State::ResetWrite
            } else {
                state
            }
        }

        Event::HardwareError => {
            error!("hardware error");
            state
        }

        other => {
            debug!("ignoring event {other:?}");
            state
        }
    }
}
