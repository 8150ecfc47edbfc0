
use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

use crate::FrontEndError;
use super::{Fx2Device, VRQ_AGC, VRQ_FLAGS, VRQ_GET_AGC};

pub const AGC_BLOCK_LEN:usize = 64;

#[derive(Debug, Clone, Serialize)]
pub struct AgcReading {
	pub values:Vec<u16>,
	pub flags:[u8; 5],
}

impl AgcReading {
	pub fn count(&self) -> usize { self.values.len() }
}

/// Decode a raw AGC sample block.  Each sample is two bytes little-endian
/// with the magnitude in the low 12 bits; the high nibble is a header and
/// is masked off.  A zero magnitude marks the start of padding and ends
/// the read.
pub fn parse_agc(block:&[u8]) -> Vec<u16> {
	let mut values:Vec<u16> = vec![];
	for pair in block.chunks_exact(2) {
		let magnitude = LittleEndian::read_u16(pair) & 0x0FFF;
		if magnitude == 0 { break; }
		values.push(magnitude);
	}
	values
}

/// Pull one round of AGC telemetry: the 5-byte flag block, then the 64-byte
/// sample block, then a restart of the accumulator for the next read.
pub fn read_agc(dev:&Fx2Device) -> Result<AgcReading, FrontEndError> {
	let mut flags = [0u8; 5];
	dev.usrp_xfer2(VRQ_FLAGS, 0, &mut flags)?;

	let mut block = [0u8; AGC_BLOCK_LEN];
	dev.usrp_xfer2(VRQ_GET_AGC, 0, &mut block)?;

	dev.usrp_xfer(VRQ_AGC, 2)?;

	if flags[2] & 0x80 != 0 {
		return Err(FrontEndError::Fault("AGC endpoint reported an error condition"));
	}

	Ok(AgcReading{ values: parse_agc(&block), flags })
}

#[test]
fn test_agc_parse_stops_at_padding() {
	let mut block = [0u8; AGC_BLOCK_LEN];
	let expected:[u16; 5] = [0x0123, 0x0FFF, 0x0001, 0x0800, 0x07FE];
	for (i, v) in expected.iter().enumerate() {
		// the high nibble is a header and must not affect the magnitude
		LittleEndian::write_u16(&mut block[i*2..i*2+2], *v | 0xA000);
	}

	assert_eq!(parse_agc(&block), expected.to_vec());
}

#[test]
fn test_agc_parse_all_padding() {
	assert_eq!(parse_agc(&[0u8; AGC_BLOCK_LEN]), Vec::<u16>::new());
}

#[test]
fn test_agc_parse_ignores_trailing_data_after_padding() {
	let mut block = [0u8; AGC_BLOCK_LEN];
	LittleEndian::write_u16(&mut block[0..2], 0x0042);
	// a nonzero value after the first zero is still padding
	LittleEndian::write_u16(&mut block[4..6], 0x0099);

	assert_eq!(parse_agc(&block), vec![0x0042]);
}
