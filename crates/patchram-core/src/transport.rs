//! The USB capabilities the upgrade state machine drives.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbError {
    #[error("failed to open usb device")]
    OpenFailed,
    #[error("control transfer failed")]
    ControlFailed,
    #[error("bulk transfer failed")]
    BulkFailed,
    #[error("pipe stalled")]
    Stalled,
    #[error("transaction timed out")]
    TimedOut,
    #[error("transfer aborted")]
    Aborted,
    #[error("no such device")]
    Disconnected,
    #[error("device not responding")]
    NotResponding,
}

/// One opened PatchRAM controller, reduced to the pipes the upgrade uses.
///
/// The state machine holds no USB resources of its own; it only issues
/// transfers through this trait, which keeps cleanup in the facade and
/// makes the machine testable against an in-memory stub.
pub trait Transport {
    /// Send an HCI command over the default control pipe.
    fn control_out(&mut self, command: &[u8], timeout: Duration) -> Result<(), UsbError>;

    /// Write a firmware record to the bulk-out pipe.
    fn bulk_out(&mut self, data: &[u8], timeout: Duration) -> Result<(), UsbError>;

    /// Read one HCI event from the interrupt-in pipe into `buf`, returning
    /// the number of bytes received.
    fn interrupt_in(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, UsbError>;

    /// Clear a halt condition on the interrupt-in pipe.
    fn clear_stall(&mut self);

    /// Abort any outstanding transfer on the interrupt-in and bulk-out
    /// pipes; called once when the upgrade loop exits.
    fn abort_pipes(&mut self);

    /// Standard GET_STATUS device request, used to probe the controller
    /// after the final reset.
    fn get_status(&mut self, timeout: Duration) -> Result<u16, UsbError>;
}
