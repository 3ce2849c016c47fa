//! rusb-backed [`Transport`] and the device facade.
//!
//! HCI commands travel over the default control pipe as class requests
//! addressed to the device; firmware records go out over the first
//! bulk-OUT endpoint and events come back on the first interrupt-IN
//! endpoint of the controller's first interface.

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use patchram_core::{ProgressReporter, Transport, UpgradeConfig, UpgradeOutcome, UsbError};
use rusb::{Device, DeviceHandle, Direction, GlobalContext, Recipient, RequestType, TransferType};

/// The slice of a USB device handle the transport drives.
///
/// Carved out of [`rusb::DeviceHandle`] so the interface claim/release
/// lifecycle can be exercised against a mock handle.
pub trait UsbHandle {
    fn claim_interface(&mut self, interface: u8) -> rusb::Result<()>;
    fn release_interface(&mut self, interface: u8) -> rusb::Result<()>;
    fn write_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;
    fn read_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;
    fn write_bulk(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize>;
    fn read_interrupt(
        &mut self,
        endpoint: u8,
        data: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;
    fn clear_halt(&mut self, endpoint: u8) -> rusb::Result<()>;
}

impl UsbHandle for DeviceHandle<GlobalContext> {
    fn claim_interface(&mut self, interface: u8) -> rusb::Result<()> {
        DeviceHandle::claim_interface(self, interface)
    }

    fn release_interface(&mut self, interface: u8) -> rusb::Result<()> {
        DeviceHandle::release_interface(self, interface)
    }

    fn write_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        DeviceHandle::write_control(self, request_type, request, value, index, data, timeout)
    }

    fn read_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        DeviceHandle::read_control(self, request_type, request, value, index, data, timeout)
    }

    fn write_bulk(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize> {
        DeviceHandle::write_bulk(self, endpoint, data, timeout)
    }

    fn read_interrupt(
        &mut self,
        endpoint: u8,
        data: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        DeviceHandle::read_interrupt(self, endpoint, data, timeout)
    }

    fn clear_halt(&mut self, endpoint: u8) -> rusb::Result<()> {
        DeviceHandle::clear_halt(self, endpoint)
    }
}

pub struct UsbTransport<H: UsbHandle = DeviceHandle<GlobalContext>> {
    handle: H,
    interface_number: u8,
    interrupt_in: u8,
    bulk_out: u8,
}

/// Upload parsed firmware to the device identified by `vendor_id` /
/// `product_id`.
///
/// Opens the device, selects its first configuration, claims the first
/// interface and discovers the upgrade pipes, then hands control to the
/// upgrade state machine. All USB resources are released when the
/// transport drops, on every exit path.
pub fn upload_firmware(
    vendor_id: u16,
    product_id: u16,
    instructions: &[Vec<u8>],
    config: &UpgradeConfig,
    progress: impl ProgressReporter,
) -> Result<UpgradeOutcome> {
    let mut transport = open_device(vendor_id, product_id)?;

    log::debug!("[{vendor_id:04x}:{product_id:04x}]: initiating DFU for USB device");

    Ok(patchram_core::run_upgrade(
        &mut transport,
        instructions,
        config,
        progress,
    ))
}

fn open_device(vendor_id: u16, product_id: u16) -> Result<UsbTransport> {
    let device = find_device(vendor_id, product_id)?
        .ok_or_else(|| anyhow!("[{vendor_id:04x}:{product_id:04x}]: failed to retrieve USB device"))?;

    let handle = device.open().map_err(|err| {
        if err == rusb::Error::Access {
            log::error!("insufficient permissions to open usb device");
        }
        anyhow!("[{vendor_id:04x}:{product_id:04x}]: failed to open USB device: {err}")
    })?;

    handle.set_auto_detach_kernel_driver(true).ok();

    let config = device
        .config_descriptor(0)
        .context("failed to read configuration descriptor")?;
    handle.set_active_configuration(config.number()).ok();

    let descriptor = config
        .interfaces()
        .next()
        .and_then(|interface| interface.descriptors().next())
        .ok_or_else(|| anyhow!("[{vendor_id:04x}:{product_id:04x}]: failed to locate interface"))?;
    let interface_number = descriptor.interface_number();

    let mut interrupt_in = None;
    let mut bulk_out = None;
    for endpoint in descriptor.endpoint_descriptors() {
        match (endpoint.transfer_type(), endpoint.direction()) {
            (TransferType::Interrupt, Direction::In) if interrupt_in.is_none() => {
                interrupt_in = Some(endpoint.address());
            }
            (TransferType::Bulk, Direction::Out) if bulk_out.is_none() => {
                bulk_out = Some(endpoint.address());
            }
            _ => {}
        }
    }

    let (Some(interrupt_in), Some(bulk_out)) = (interrupt_in, bulk_out) else {
        bail!("[{vendor_id:04x}:{product_id:04x}]: couldn't find pipes");
    };

    log::debug!(
        "interface {interface_number}: interrupt-in {interrupt_in:#04x}, bulk-out {bulk_out:#04x}"
    );

    UsbTransport::claim(handle, interface_number, interrupt_in, bulk_out)
}

fn find_device(vendor_id: u16, product_id: u16) -> Result<Option<Device<GlobalContext>>> {
    let devices = rusb::devices().context("failed to enumerate usb devices")?;

    Ok(devices.iter().find(|device| {
        device
            .device_descriptor()
            .is_ok_and(|desc| desc.vendor_id() == vendor_id && desc.product_id() == product_id)
    }))
}

impl<H: UsbHandle> UsbTransport<H> {
    /// Claim `interface_number` on `handle` and wrap it for one upgrade
    /// run. The handle is owned from here on, so the interface is
    /// released on drop even when the claim itself fails.
    fn claim(handle: H, interface_number: u8, interrupt_in: u8, bulk_out: u8) -> Result<Self> {
        let mut transport = Self {
            handle,
            interface_number,
            interrupt_in,
            bulk_out,
        };

        match transport.handle.claim_interface(interface_number) {
            Ok(()) => Ok(transport),
            Err(rusb::Error::NotSupported) => {
                log::error!(
                    "Interface not supported on device. If using windows, installing a usb driver, like Zadig (https://zadig.akeo.ie/), will likely solve the issue."
                );
                bail!("failed to claim interface: {}", rusb::Error::NotSupported);
            }
            Err(err) => bail!("failed to claim interface: {err}"),
        }
    }
}

fn usb_error(err: rusb::Error, fallback: UsbError) -> UsbError {
    match err {
        rusb::Error::Timeout => UsbError::TimedOut,
        rusb::Error::Pipe => UsbError::Stalled,
        rusb::Error::NoDevice | rusb::Error::NotFound => UsbError::Disconnected,
        rusb::Error::Interrupted => UsbError::Aborted,
        rusb::Error::Busy | rusb::Error::Io => UsbError::NotResponding,
        _ => fallback,
    }
}

impl<H: UsbHandle> Transport for UsbTransport<H> {
    fn control_out(&mut self, command: &[u8], timeout: Duration) -> Result<(), UsbError> {
        let request_type =
            rusb::request_type(Direction::Out, RequestType::Class, Recipient::Device);

        match self
            .handle
            .write_control(request_type, 0, 0, 0, command, timeout)
        {
            Ok(written) => {
                log::trace!("hci command sent ({written} bytes)");
                Ok(())
            }
            Err(err) => {
                log::error!("hci command failed: {err}");
                Err(usb_error(err, UsbError::ControlFailed))
            }
        }
    }

    fn bulk_out(&mut self, data: &[u8], timeout: Duration) -> Result<(), UsbError> {
        match self.handle.write_bulk(self.bulk_out, data, timeout) {
            Ok(written) => {
                log::trace!("bulk write ({written} bytes)");
                Ok(())
            }
            Err(err) => {
                log::error!("bulk write failed: {err}");
                Err(usb_error(err, UsbError::BulkFailed))
            }
        }
    }

    fn interrupt_in(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, UsbError> {
        self.handle
            .read_interrupt(self.interrupt_in, buf, timeout)
            .map_err(|err| usb_error(err, UsbError::NotResponding))
    }

    fn clear_stall(&mut self) {
        self.handle.clear_halt(self.interrupt_in).ok();
    }

    fn abort_pipes(&mut self) {
        // rusb's synchronous API cannot cancel an in-flight transfer;
        // clearing the halt state on both pipes is the closest equivalent.
        self.handle.clear_halt(self.interrupt_in).ok();
        self.handle.clear_halt(self.bulk_out).ok();
    }

    fn get_status(&mut self, timeout: Duration) -> Result<u16, UsbError> {
        let request_type =
            rusb::request_type(Direction::In, RequestType::Standard, Recipient::Device);
        let mut status = [0u8; 2];

        self.handle
            .read_control(
                request_type,
                rusb::constants::LIBUSB_REQUEST_GET_STATUS,
                0,
                0,
                &mut status,
                timeout,
            )
            .map_err(|err| usb_error(err, UsbError::ControlFailed))?;

        Ok(u16::from_le_bytes(status))
    }
}

impl<H: UsbHandle> Drop for UsbTransport<H> {
    fn drop(&mut self) {
        let _ = self.handle.release_interface(self.interface_number);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    use patchram_core::{NoProgress, hci, run_upgrade};

    use super::*;

    #[derive(Default)]
    struct Counters {
        claimed: usize,
        released: usize,
    }

    /// Handle double that answers interrupt reads from a script and
    /// counts interface acquire/release.
    struct MockHandle {
        counters: Rc<RefCell<Counters>>,
        fail_claim: bool,
        events: VecDeque<Vec<u8>>,
    }

    impl MockHandle {
        fn new(counters: &Rc<RefCell<Counters>>, events: Vec<Vec<u8>>) -> Self {
            Self {
                counters: counters.clone(),
                fail_claim: false,
                events: events.into(),
            }
        }
    }

    impl UsbHandle for MockHandle {
        fn claim_interface(&mut self, _interface: u8) -> rusb::Result<()> {
            self.counters.borrow_mut().claimed += 1;
            if self.fail_claim {
                Err(rusb::Error::Busy)
            } else {
                Ok(())
            }
        }

        fn release_interface(&mut self, _interface: u8) -> rusb::Result<()> {
            self.counters.borrow_mut().released += 1;
            Ok(())
        }

        fn write_control(
            &mut self,
            _request_type: u8,
            _request: u8,
            _value: u16,
            _index: u16,
            data: &[u8],
            _timeout: Duration,
        ) -> rusb::Result<usize> {
            Ok(data.len())
        }

        fn read_control(
            &mut self,
            _request_type: u8,
            _request: u8,
            _value: u16,
            _index: u16,
            data: &mut [u8],
            _timeout: Duration,
        ) -> rusb::Result<usize> {
            data.fill(0);
            Ok(data.len())
        }

        fn write_bulk(&mut self, _endpoint: u8, data: &[u8], _timeout: Duration) -> rusb::Result<usize> {
            Ok(data.len())
        }

        fn read_interrupt(
            &mut self,
            _endpoint: u8,
            data: &mut [u8],
            _timeout: Duration,
        ) -> rusb::Result<usize> {
            match self.events.pop_front() {
                Some(event) => {
                    data[..event.len()].copy_from_slice(&event);
                    Ok(event.len())
                }
                None => Err(rusb::Error::NoDevice),
            }
        }

        fn clear_halt(&mut self, _endpoint: u8) -> rusb::Result<()> {
            Ok(())
        }
    }

    fn command_complete(opcode: u16) -> Vec<u8> {
        vec![
            0x0e,
            0x04,
            0x01,
            (opcode & 0xff) as u8,
            (opcode >> 8) as u8,
            0x00,
        ]
    }

    fn full_run_events() -> Vec<Vec<u8>> {
        vec![
            command_complete(hci::opcode::RESET),
            command_complete(hci::opcode::READ_LOCAL_VERSION),
            command_complete(hci::opcode::READ_USB_PRODUCT),
            command_complete(hci::opcode::READ_VERBOSE_CONFIG),
            command_complete(hci::opcode::DOWNLOAD_MINIDRIVER),
            command_complete(hci::opcode::LAUNCH_RAM),
            command_complete(hci::opcode::END_OF_RECORD),
            command_complete(hci::opcode::RESET),
        ]
    }

    fn instructions() -> Vec<Vec<u8>> {
        vec![vec![
            0x4c, 0xfc, 0x08, 0x00, 0x00, 0x00, 0x00, 0xde, 0xad, 0xbe, 0xef,
        ]]
    }

    fn fast_config() -> UpgradeConfig {
        UpgradeConfig {
            initial_delay: Duration::ZERO,
            pre_reset_delay: Duration::ZERO,
            post_reset_delay: Duration::ZERO,
            hci_timeout: Duration::from_millis(10),
            ..UpgradeConfig::default()
        }
    }

    #[test]
    fn interface_released_after_successful_run() {
        let counters = Rc::new(RefCell::new(Counters::default()));
        let handle = MockHandle::new(&counters, full_run_events());

        {
            let mut transport = UsbTransport::claim(handle, 0, 0x81, 0x02).unwrap();
            let outcome = run_upgrade(&mut transport, &instructions(), &fast_config(), NoProgress);
            assert_eq!(outcome, UpgradeOutcome::Complete);
        }

        let counters = counters.borrow();
        assert_eq!(counters.claimed, 1);
        assert_eq!(counters.released, 1);
    }

    #[test]
    fn interface_released_after_aborted_run() {
        let counters = Rc::new(RefCell::new(Counters::default()));
        // The script dries up after the first reset completion, so the
        // next read reports the device gone and the machine aborts.
        let handle = MockHandle::new(&counters, vec![command_complete(hci::opcode::RESET)]);

        {
            let mut transport = UsbTransport::claim(handle, 0, 0x81, 0x02).unwrap();
            let outcome = run_upgrade(&mut transport, &instructions(), &fast_config(), NoProgress);
            assert_eq!(outcome, UpgradeOutcome::Aborted);
        }

        let counters = counters.borrow();
        assert_eq!(counters.claimed, 1);
        assert_eq!(counters.released, 1);
    }

    #[test]
    fn interface_released_when_claim_fails() {
        let counters = Rc::new(RefCell::new(Counters::default()));
        let mut handle = MockHandle::new(&counters, vec![]);
        handle.fail_claim = true;

        let result = UsbTransport::claim(handle, 0, 0x81, 0x02);
        assert!(result.is_err());

        let counters = counters.borrow();
        assert_eq!(counters.claimed, 1);
        assert_eq!(counters.released, 1);
    }
}
