//! nusb-based DFU transport implementation.

use std::num::NonZeroU8;
use std::time::Duration;

use nusb::transfer::{ControlIn, ControlOut, ControlType, Recipient, TransferError};
use nusb::{Device, DeviceInfo, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument, trace};

use super::traits::{DeviceEnumerator, DfuTransport, MatchCriteria, TransportError};
use crate::protocol::constants::*;
use crate::protocol::{DfuDescriptor, DfuStatus};

/// One DFU interface / alternate setting exposed by a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuTarget {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_id: String,
    pub device_address: u8,
    pub interface_number: u8,
    pub alt_setting: u8,
    pub alt_name: Option<String>,
    /// Number of alternate settings on this interface.
    pub alt_count: usize,
    pub transfer_size: u16,
}

/// nusb-based DFU transport.
pub struct NusbTransport {
    device: Option<Device>,
    interface: Option<Interface>,
    target: DfuTarget,
    timeout: Duration,
}

impl NusbTransport {
    fn new(device: Device, target: DfuTarget) -> Self {
        Self {
            device: Some(device),
            interface: None,
            target,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn target(&self) -> &DfuTarget {
        &self.target
    }

    fn claimed(&self) -> Result<&Interface, TransportError> {
        if self.device.is_none() {
            return Err(TransportError::NoDevice);
        }
        self.interface
            .as_ref()
            .ok_or(TransportError::InvalidParameter)
    }

    fn class_out(&self, request: u8, value: u16, data: &[u8]) -> Result<(), TransportError> {
        let interface = self.claimed()?;
        interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index: self.target.interface_number as u16,
                    data,
                },
                self.timeout,
            )
            .wait()
            .map_err(map_transfer_error)
    }

    fn class_in(&self, request: u8, value: u16, length: u16) -> Result<Vec<u8>, TransportError> {
        let interface = self.claimed()?;
        interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index: self.target.interface_number as u16,
                    length,
                },
                self.timeout,
            )
            .wait()
            .map_err(map_transfer_error)
    }
}

impl DfuTransport for NusbTransport {
    fn vendor_id(&self) -> u16 {
        self.target.vendor_id
    }

    fn product_id(&self) -> u16 {
        self.target.product_id
    }

    fn interface_number(&self) -> u8 {
        self.target.interface_number
    }

    fn has_alt_settings(&self) -> bool {
        self.target.alt_count > 1 || self.target.alt_setting != 0
    }

    fn transfer_size(&self) -> u16 {
        self.target.transfer_size
    }

    fn is_open(&self) -> bool {
        self.device.is_some()
    }

    #[instrument(skip(self), fields(interface = self.target.interface_number))]
    fn claim_interface(&mut self) -> Result<(), TransportError> {
        let device = self.device.as_ref().ok_or(TransportError::NoDevice)?;
        let interface = device
            .claim_interface(self.target.interface_number)
            .wait()
            .map_err(map_usb_error)?;
        self.interface = Some(interface);
        debug!("Interface claimed");
        Ok(())
    }

    fn set_alt_setting(&mut self) -> Result<(), TransportError> {
        let interface = self.claimed()?;
        interface
            .set_alt_setting(self.target.alt_setting)
            .wait()
            .map_err(map_usb_error)?;
        debug!(alt = self.target.alt_setting, "Alternate setting selected");
        Ok(())
    }

    fn release_interface(&mut self) {
        // Dropping the nusb handle releases the interface
        if self.interface.take().is_some() {
            debug!(interface = self.target.interface_number, "Interface released");
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn download(&mut self, block: u16, data: &[u8]) -> Result<(), TransportError> {
        trace!(block, len = data.len(), "DFU_DNLOAD");
        self.class_out(DFU_DNLOAD, block, data)
    }

    fn get_status(&mut self) -> Result<DfuStatus, TransportError> {
        let data = self.class_in(DFU_GETSTATUS, 0, DFU_STATUS_LEN)?;
        DfuStatus::from_bytes(&data).map_err(|_| TransportError::Io)
    }

    fn clear_status(&mut self) -> Result<(), TransportError> {
        self.class_out(DFU_CLRSTATUS, 0, &[])
    }

    fn abort(&mut self) -> Result<(), TransportError> {
        self.class_out(DFU_ABORT, 0, &[])
    }

    fn detach(&mut self, timeout_ms: u16) -> Result<(), TransportError> {
        self.class_out(DFU_DETACH, timeout_ms, &[])
    }

    fn reset_device(&mut self) -> Result<(), TransportError> {
        let device = self.device.as_ref().ok_or(TransportError::NoDevice)?;
        device.reset().wait().map_err(map_usb_error)
    }

    fn close(&mut self) {
        self.interface = None;
        if self.device.take().is_some() {
            debug!(
                vid = %format!("{:04X}", self.target.vendor_id),
                pid = %format!("{:04X}", self.target.product_id),
                "Device closed"
            );
        }
    }
}

/// Enumerates real USB devices through nusb.
#[derive(Debug, Default, Clone, Copy)]
pub struct NusbBackend;

impl DeviceEnumerator for NusbBackend {
    type Transport = NusbTransport;

    #[instrument(skip(self), fields(criteria = %criteria))]
    fn probe(&mut self, criteria: &MatchCriteria) -> Result<Option<NusbTransport>, TransportError> {
        let devices = list_devices().wait().map_err(map_usb_error)?;

        for device_info in devices {
            if !criteria.matches_ids(device_info.vendor_id(), device_info.product_id()) {
                continue;
            }
            let device = match device_info.open().wait() {
                Ok(device) => device,
                Err(e) => {
                    debug!(error = %e, "Cannot open candidate device");
                    continue;
                }
            };
            let found = dfu_targets(&device, &device_info)
                .into_iter()
                .find(|t| criteria.matches_alt(t.alt_name.as_deref()));
            if let Some(target) = found {
                info!(
                    vendor_id = %format!("{:04X}", target.vendor_id),
                    product_id = %format!("{:04X}", target.product_id),
                    interface = target.interface_number,
                    alt = target.alt_setting,
                    transfer_size = target.transfer_size,
                    "Found DFU target"
                );
                return Ok(Some(NusbTransport::new(device, target)));
            }
        }

        Ok(None)
    }
}

/// List every DFU alternate setting on the bus, optionally filtered by IDs.
pub fn list_dfu_targets(
    vid: Option<u16>,
    pid: Option<u16>,
) -> Result<Vec<DfuTarget>, TransportError> {
    let mut targets = Vec::new();
    for device_info in list_devices().wait().map_err(map_usb_error)? {
        if !vid.is_none_or(|id| device_info.vendor_id() == id)
            || !pid.is_none_or(|id| device_info.product_id() == id)
        {
            continue;
        }
        let is_dfu = device_info
            .interfaces()
            .any(|i| i.class() == DFU_CLASS && i.subclass() == DFU_SUBCLASS);
        if !is_dfu {
            continue;
        }
        match device_info.open().wait() {
            Ok(device) => targets.extend(dfu_targets(&device, &device_info)),
            Err(e) => debug!(error = %e, "Cannot open DFU device"),
        }
    }
    Ok(targets)
}

fn dfu_targets(device: &Device, device_info: &DeviceInfo) -> Vec<DfuTarget> {
    let device_desc = device.configurations().find_map(|config| {
        config
            .interface_alt_settings()
            .find_map(|alt| alt.descriptors().find_map(|d| DfuDescriptor::parse(&d)))
    });

    let mut targets: Vec<DfuTarget> = Vec::new();
    for config in device.configurations() {
        for alt in config.interface_alt_settings() {
            if alt.class() != DFU_CLASS || alt.subclass() != DFU_SUBCLASS {
                continue;
            }
            let alt_name = alt
                .string_index()
                .and_then(|idx| get_string_descriptor(device, idx, DEFAULT_TIMEOUT));
            let transfer_size = alt
                .descriptors()
                .find_map(|d| DfuDescriptor::parse(&d))
                .or(device_desc)
                .map(|d| d.transfer_size())
                .unwrap_or(0);
            targets.push(DfuTarget {
                vendor_id: device_info.vendor_id(),
                product_id: device_info.product_id(),
                bus_id: device_info.bus_id().to_string(),
                device_address: device_info.device_address(),
                interface_number: alt.interface_number(),
                alt_setting: alt.alternate_setting(),
                alt_name,
                alt_count: 0,
                transfer_size,
            });
        }
    }

    let counts: Vec<usize> = targets
        .iter()
        .map(|t| {
            targets
                .iter()
                .filter(|o| o.interface_number == t.interface_number)
                .count()
        })
        .collect();
    for (target, count) in targets.iter_mut().zip(counts) {
        target.alt_count = count;
    }
    targets
}

fn get_string_descriptor(
    device: &Device,
    desc_index: NonZeroU8,
    timeout: Duration,
) -> Option<String> {
    let language: u16 = device
        .get_string_descriptor_supported_languages(timeout)
        .wait()
        .ok()?
        .next()
        .unwrap_or(nusb::descriptors::language_id::US_ENGLISH);

    device
        .get_string_descriptor(desc_index, language, timeout)
        .wait()
        .ok()
}

fn map_usb_error(err: nusb::Error) -> TransportError {
    match err.kind() {
        nusb::ErrorKind::Disconnected => TransportError::NoDevice,
        nusb::ErrorKind::Busy => TransportError::Busy,
        nusb::ErrorKind::PermissionDenied => TransportError::AccessDenied,
        nusb::ErrorKind::NotFound => TransportError::NotFound,
        nusb::ErrorKind::Unsupported => TransportError::NotSupported,
        _ => TransportError::Other(err.to_string()),
    }
}

fn map_transfer_error(err: TransferError) -> TransportError {
    match err {
        TransferError::Cancelled => TransportError::Timeout,
        TransferError::Stall => TransportError::Pipe,
        TransferError::Disconnected => TransportError::NoDevice,
        TransferError::Fault => TransportError::Io,
        TransferError::InvalidArgument => TransportError::InvalidParameter,
        other => TransportError::Other(other.to_string()),
    }
}
