
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use rusb::{Context, DeviceHandle, UsbContext};
use serde::Serialize;

use crate::FrontEndError;

pub mod agc;
pub mod firmware;

/* Vendor request codes.  The top bit of a request code selects the transfer
direction (set means device-to-host).  These are configuration constants,
not negotiated with the device. */
pub const RW_INTERNAL:u8 = 0xA0;	// on-chip RAM write, implemented by the first-stage loader
pub const RW_MEMORY:u8   = 0xA3;	// external RAM write

pub const VRQ_XFER:u8       = 0x01;
pub const VRQ_AGC:u8        = 0x10;
pub const VRQ_GET_STATUS:u8 = 0x80;
pub const VRQ_FLAGS:u8      = 0x90;
pub const VRQ_GET_AGC:u8    = 0x91;

pub const GS_RX_OVERRUN:u16 = 1;

const VRT_VENDOR_OUT:u8 = 0x40;
const VRT_VENDOR_IN:u8  = 0xC0;

const USB_TIMEOUT:Duration = Duration::from_millis(1000);

const RX_ENDPOINT:u8 = 0x86;

// Supported VID/PID pairs; the last entry is a bare FX2LP with no EEPROM
const FX2_VID:[u16; 5] = [0x1781, 0x1781, 0x1781, 0x1781, 0x04B4];
const FX2_PID:[u16; 5] = [0x0B38, 0x0B39, 0x0B3A, 0x0B3F, 0x8613];

/// The two control operations the firmware loader needs.  Splitting them
/// into a trait lets the loader tests run against a scripted transport
/// instead of hardware.
pub trait VendorControl {

	fn control_write(&mut self, opcode:u8, addr:u32, data:&[u8]) -> Result<(), FrontEndError>;

	/// Poke the CPUCS register to halt (run=false) or resume (run=true) the
	/// 8051 core.  A stall on the resume write is tolerated because the
	/// device can reject or drop the transfer as it reboots into the image
	/// that was just uploaded.
	fn cpu_run(&mut self, cpucs_addr:u32, run:bool) -> Result<(), FrontEndError> {
		let data = [ if run { 0x00 } else { 0x01 } ];
		match self.control_write(RW_INTERNAL, cpucs_addr, &data) {
			Err(FrontEndError::TransferStall{..}) if run => Ok(()),
			other => other,
		}
	}

}

/// Status flags reported by the streaming FIFO firmware as a 5-byte block.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FifoFlags {
	pub agc_en:u8,
	pub op_mode:u8,
	pub ep4_reset:u8,
	pub fifo_idx:u16,
}

impl FifoFlags {
	pub fn decode(raw:&[u8; 5]) -> Self {
		FifoFlags{ agc_en: raw[0], op_mode: raw[1], ep4_reset: raw[2], fifo_idx: LittleEndian::read_u16(&raw[3..5]) }
	}
}

/// Handle to a Cypress EZ-USB front end.  Dropping the handle releases the
/// claimed interface and resets the device, so a failed bootstrap always
/// leaves the device closed.
pub struct Fx2Device {
	handle: DeviceHandle<Context>,
	claimed_interface: Option<u8>,
}

impl Fx2Device {

	/// Open the device at the given index of the supported VID/PID table.
	pub fn open(port:usize) -> Result<Self, FrontEndError> {
		let vid:u16 = *FX2_VID.get(port).ok_or(FrontEndError::DeviceNotFound)?;
		let pid:u16 = *FX2_PID.get(port).ok_or(FrontEndError::DeviceNotFound)?;

		let context = Context::new()?;
		for device in context.devices()?.iter() {
			let desc = device.device_descriptor()?;
			if desc.vendor_id() == vid && desc.product_id() == pid {
				let handle = device.open()?;
				tracing::debug!("opened front end {:04X}:{:04X}", vid, pid);
				return Ok(Fx2Device{ handle, claimed_interface: None });
			}
		}

		Err(FrontEndError::DeviceNotFound)
	}

	/// Claim the streaming interface and select its alternate setting.
	pub fn claim_streaming(&mut self, interface:u8, alt:u8) -> Result<(), FrontEndError> {
		#[cfg(target_os = "linux")]
		{
			if self.handle.kernel_driver_active(interface).unwrap_or(false) {
				self.handle.detach_kernel_driver(interface)?;
			}
		}

		self.handle.set_active_configuration(1)?;
		self.handle.claim_interface(interface)?;
		self.handle.set_alternate_setting(interface, alt)?;
		self.claimed_interface = Some(interface);
		Ok(())
	}

	/// Vendor control transfer with the direction chosen by the top bit of
	/// the request code.  A completed transfer of zero bytes on a nonempty
	/// buffer means the endpoint rejected the request (stall); anything the
	/// transport itself reports is an I/O failure.
	pub fn write_cmd(&self, request:u8, value:u16, index:u16, buf:&mut [u8]) -> Result<usize, FrontEndError> {
		let res = if request & 0x80 != 0 {
			self.handle.read_control(VRT_VENDOR_IN, request, value, index, buf, USB_TIMEOUT)
		} else {
			self.handle.write_control(VRT_VENDOR_OUT, request, value, index, buf, USB_TIMEOUT)
		};

		match res {
			Ok(n) if n == 0 && !buf.is_empty() => Err(FrontEndError::TransferStall{ request }),
			Ok(n) => Ok(n),
			Err(rusb::Error::Pipe) => Err(FrontEndError::TransferStall{ request }),
			Err(e) => Err(FrontEndError::TransferIo(e)),
		}
	}

	pub fn usrp_xfer(&self, request:u8, start:u8) -> Result<(), FrontEndError> {
		self.write_cmd(request, start as u16, 0, &mut [])?;
		Ok(())
	}

	pub fn usrp_xfer2(&self, request:u8, start:u8, buf:&mut [u8]) -> Result<usize, FrontEndError> {
		self.write_cmd(request, start as u16, 0, buf)
	}

	pub fn check_rx_overrun(&self) -> Result<bool, FrontEndError> {
		let mut status = [0u8; 1];
		let n = self.write_cmd(VRQ_GET_STATUS, 0, GS_RX_OVERRUN, &mut status)?;
		if n != 1 { return Err(FrontEndError::Overrun{ got:n, requested:1 }); }
		Ok(status[0] != 0)
	}

	pub fn fifo_flags(&self) -> Result<FifoFlags, FrontEndError> {
		let mut raw = [0u8; 5];
		self.usrp_xfer2(VRQ_FLAGS, 0, &mut raw)?;
		Ok(FifoFlags::decode(&raw))
	}

	/// Blocking bulk read from the RX endpoint.
	pub fn read_if(&self, buf:&mut [u8]) -> Result<usize, FrontEndError> {
		match self.handle.read_bulk(RX_ENDPOINT, buf, USB_TIMEOUT) {
			Ok(n) => Ok(n),
			Err(rusb::Error::Pipe) => Err(FrontEndError::TransferStall{ request: RX_ENDPOINT }),
			Err(e) => Err(FrontEndError::TransferIo(e)),
		}
	}

	pub fn close(self) { }	// release/reset happen on drop

}

impl VendorControl for Fx2Device {

	fn control_write(&mut self, opcode:u8, addr:u32, data:&[u8]) -> Result<(), FrontEndError> {
		let res = self.handle.write_control(VRT_VENDOR_OUT, opcode,
			(addr & 0xFFFF) as u16, (addr >> 16) as u16, data, USB_TIMEOUT);

		match res {
			Ok(n) if n == data.len() => Ok(()),
			Ok(0) => Err(FrontEndError::TransferStall{ request: opcode }),
			Ok(n) => Err(FrontEndError::Overrun{ got:n, requested:data.len() }),
			Err(rusb::Error::Pipe) => Err(FrontEndError::TransferStall{ request: opcode }),
			Err(e) => Err(FrontEndError::TransferIo(e)),
		}
	}

}

impl Drop for Fx2Device {

	fn drop(&mut self) {
		if let Some(interface) = self.claimed_interface.take() {
			if let Err(e) = self.handle.release_interface(interface) {
				tracing::debug!("failed to release interface {}: {}", interface, e);
			}
		}
		if let Err(e) = self.handle.reset() {
			tracing::debug!("failed to reset device: {}", e);
		}
	}

}

#[test]
fn test_fifo_flags_decode() {
	let flags = FifoFlags::decode(&[1, 2, 0, 0x34, 0x12]);
	assert_eq!(flags.agc_en, 1);
	assert_eq!(flags.op_mode, 2);
	assert_eq!(flags.ep4_reset, 0);
	assert_eq!(flags.fifo_idx, 0x1234);
}
