
use std::io::BufRead;

use serde::Serialize;

use crate::FrontEndError;
use super::{VendorControl, RW_INTERNAL, RW_MEMORY};

#[cfg(test)]
mod tests;

pub const RETRY_LIMIT:usize = 5;

/* Records are merged into larger segments before upload; most hex files
keep memory regions together, which makes the merge all but free.  Segments
max out at 1023 bytes even though the upload protocol itself could take
64KB, because that's the most a loader stored in EEPROM can handle. */
pub const MAX_SEGMENT_LEN:usize = 1023;

/// A contiguous run of firmware bytes, already classified against the
/// target chip's internal RAM map.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FirmwareSegment {
	pub addr:u32,
	pub data:Vec<u8>,
	pub external:bool,
}

/// EZ-USB controller variants.  They share the 8051 core but differ in the
/// CPU control register address and in how much RAM the first-stage loader
/// can write.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum FxType {
	Fx2lp,
	Fx2,
	Fx,
}

impl FxType {

	pub fn cpucs_addr(&self) -> u32 {
		match self {
			FxType::Fx2lp | FxType::Fx2 => 0xE600,
			FxType::Fx                  => 0x7F92,
		}
	}

	/// True if [addr, addr+len) reaches outside the on-chip RAM writable by
	/// the first-stage loader.  A segment straddling a boundary counts as
	/// external.
	pub fn is_external(&self, addr:u32, len:usize) -> bool {
		let len = len as u32;
		match self {
			// 16KB of code/data at the bottom, plus 512 bytes at 0xE000
			FxType::Fx2lp => {
				if addr < 0x4000                       { addr + len > 0x4000 }
				else if addr >= 0xE000 && addr < 0xE200 { addr + len > 0xE200 }
				else                                   { true }
			},
			// same layout with an 8KB boundary
			FxType::Fx2 => {
				if addr < 0x2000                       { addr + len > 0x2000 }
				else if addr >= 0xE000 && addr < 0xE200 { addr + len > 0xE200 }
				else                                   { true }
			},
			// 8KB part; anything past 0x1B3F may not be writable, so call it external
			FxType::Fx => {
				if addr < 0x1B40 { addr + len > 0x1B40 }
				else             { true }
			},
		}
	}

}

/// Upload phases for one- and two-stage loading.  Only the single-stage
/// internal-only path is implemented; the two-stage modes are declared so
/// that asking for them is an explicit failure rather than a silent no-op.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RamMode {
	InternalOnly,	// hardware first-stage loader
	SkipInternal,	// first phase, second-stage loader
	SkipExternal,	// second phase, second-stage loader
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct LoadStats {
	pub total_bytes:usize,
	pub segment_count:usize,
}

fn hex_field(line:&str, lo:usize, hi:usize) -> Result<u32, FrontEndError> {
	let field = line.get(lo..hi)
		.ok_or_else(|| FrontEndError::MalformedFirmwareRecord(format!("record too short: {}", line)))?;
	u32::from_str_radix(field, 16)
		.map_err(|_| FrontEndError::MalformedFirmwareRecord(format!("bad hex field {:?} in record: {}", field, line)))
}

fn flush_segment(segments:&mut Vec<FirmwareSegment>, addr:u32, pending:&mut Vec<u8>, fx_type:FxType) {
	let data = std::mem::replace(pending, vec![]);
	let external = fx_type.is_external(addr, data.len());
	segments.push(FirmwareSegment{ addr, data, external });
}

/// Parse an Intel HEX image (`:LLAAAATTDD..DDCC` per line) into merged,
/// classified segments.  Record checksums are not verified.  Only data
/// (type 0) and end-of-file (type 1) records are meaningful; an EOF record
/// ends the image even if more lines follow it.
pub fn parse_ihex<R: BufRead>(image:R, fx_type:FxType) -> Result<Vec<FirmwareSegment>, FrontEndError> {
	let mut segments:Vec<FirmwareSegment> = vec![];
	let mut pending_addr:u32 = 0;
	let mut pending:Vec<u8> = vec![];
	let mut saw_eof = false;

	'lines: for line in image.lines() {
		let line = line?;
		let line:&str = line.trim_end();

		// "# comment till end of line", for copyrights etc
		if line.starts_with('#') { continue; }

		if !line.starts_with(':') {
			return Err(FrontEndError::MalformedFirmwareRecord(format!("not an ihex record: {}", line)));
		}

		let len = hex_field(line, 1, 3)? as usize;
		let off = hex_field(line, 3, 7)?;
		let rec_type = hex_field(line, 7, 9)?;

		match rec_type {
			0 => (),
			1 => { saw_eof = true; break 'lines; },
			t => return Err(FrontEndError::MalformedFirmwareRecord(format!("unsupported record type: {}", t))),
		}

		if line.len() < 11 + len*2 {
			return Err(FrontEndError::MalformedFirmwareRecord(format!("record too short: {}", line)));
		}

		// flush the pending segment when the address breaks or the merge buffer is full
		if !pending.is_empty() && (off != pending_addr + pending.len() as u32 || pending.len() + len > MAX_SEGMENT_LEN) {
			flush_segment(&mut segments, pending_addr, &mut pending, fx_type);
		}
		if pending.is_empty() { pending_addr = off; }

		for idx in 0..len {
			pending.push(hex_field(line, 9 + idx*2, 11 + idx*2)? as u8);
		}
	}

	if !saw_eof {
		tracing::warn!("firmware image ended without an EOF record");
	}

	if !pending.is_empty() {
		flush_segment(&mut segments, pending_addr, &mut pending, fx_type);
	}

	Ok(segments)
}

/// Write segments back out as Intel HEX, 16 bytes per record, with valid
/// checksums (the parser tolerates bad ones but other tools do not).
pub fn segments_to_image(segments:&[FirmwareSegment]) -> String {
	let mut out = String::new();
	for seg in segments {
		for (i, rec) in seg.data.chunks(16).enumerate() {
			let addr = (seg.addr + (i*16) as u32) & 0xFFFF;
			let mut sum:u8 = (rec.len() as u8)
				.wrapping_add((addr >> 8) as u8)
				.wrapping_add(addr as u8);
			out.push_str(&format!(":{:02X}{:04X}00", rec.len(), addr));
			for &b in rec {
				sum = sum.wrapping_add(b);
				out.push_str(&format!("{:02X}", b));
			}
			out.push_str(&format!("{:02X}\n", sum.wrapping_neg()));
		}
	}
	out.push_str(":00000001FF\n");
	out
}

fn write_segment<T: VendorControl>(dev:&mut T, mode:RamMode, seg:&FirmwareSegment) -> Result<(), FrontEndError> {
	match mode {
		RamMode::InternalOnly if seg.external =>
			return Err(FrontEndError::PolicyViolation{ addr: seg.addr, len: seg.data.len() }),
		RamMode::InternalOnly => (),
		RamMode::SkipInternal | RamMode::SkipExternal =>
			return Err(FrontEndError::Unimplemented("two-stage load modes")),
	}

	let opcode = if seg.external { RW_MEMORY } else { RW_INTERNAL };

	// Control messages are not NAKed, just dropped, so a failed transfer is
	// worth a few more attempts before it counts as a real error.
	let mut attempts = 0;
	loop {
		match dev.control_write(opcode, seg.addr, &seg.data) {
			Ok(()) => return Ok(()),
			Err(e) => {
				attempts += 1;
				if attempts >= RETRY_LIMIT { return Err(e); }
				tracing::debug!("segment write at 0x{:08X} failed ({}), retrying", seg.addr, e);
			},
		}
	}
}

/// Upload a firmware image into target RAM: halt the CPU, write every
/// segment, run the pre-reset hook if one was supplied, then resume the CPU
/// so the chip boots into the new code.  Halt and resume failures are
/// fatal, as is any segment that exhausts its transfer retries; the caller
/// owns the device handle and is expected to drop it on failure.
pub fn load_firmware<T: VendorControl, R: BufRead>(dev:&mut T, image:R, fx_type:FxType, mode:RamMode,
	pre_reset:Option<&dyn Fn(&mut T) -> Result<(), FrontEndError>>) -> Result<LoadStats, FrontEndError> {

	let segments = parse_ihex(image, fx_type)?;

	dev.cpu_run(fx_type.cpucs_addr(), false)?;

	let mut stats = LoadStats::default();
	for seg in &segments {
		write_segment(dev, mode, seg)?;
		stats.total_bytes += seg.data.len();
		stats.segment_count += 1;
	}

	if stats.segment_count > 0 {
		tracing::info!("wrote {} bytes in {} segments", stats.total_bytes, stats.segment_count);
	}

	// used to patch configuration bytes that must land before the CPU resumes
	if let Some(hook) = pre_reset {
		hook(dev)?;
	}

	dev.cpu_run(fx_type.cpucs_addr(), true)?;

	Ok(stats)
}
