
use std::collections::BTreeMap;
use std::io::Cursor;

use crate::FrontEndError;
use crate::fx2::{VendorControl, RW_INTERNAL};

use super::*;

#[derive(Debug, Clone, PartialEq)]
struct WriteRecord {
	opcode:u8,
	addr:u32,
	len:usize,
}

/// Scripted stand-in for the USB control path.  Transfers are numbered in
/// the order they arrive; the halt-CPU write is always transfer 0.
struct MockDevice {
	writes:Vec<WriteRecord>,
	seen:usize,
	fail_from:usize,
	fail_count:usize,
	stall_at:Option<usize>,
}

impl MockDevice {

	fn new() -> Self {
		MockDevice{ writes: vec![], seen: 0, fail_from: 0, fail_count: 0, stall_at: None }
	}

	fn failing(fail_from:usize, fail_count:usize) -> Self {
		MockDevice{ fail_from, fail_count, ..Self::new() }
	}

}

impl VendorControl for MockDevice {

	fn control_write(&mut self, opcode:u8, addr:u32, data:&[u8]) -> Result<(), FrontEndError> {
		let idx = self.seen;
		self.seen += 1;

		if self.stall_at == Some(idx) {
			return Err(FrontEndError::TransferStall{ request: opcode });
		}
		if idx >= self.fail_from && idx < self.fail_from + self.fail_count {
			return Err(FrontEndError::TransferIo(rusb::Error::Timeout));
		}

		self.writes.push(WriteRecord{ opcode, addr, len: data.len() });
		Ok(())
	}

}

fn image_from_segments(segments:&[FirmwareSegment]) -> Cursor<Vec<u8>> {
	Cursor::new(segments_to_image(segments).into_bytes())
}

fn segment(addr:u32, data:Vec<u8>) -> FirmwareSegment {
	// classification gets recomputed on parse, so it doesn't matter here
	FirmwareSegment{ addr, data, external: false }
}

fn address_map(segments:&[FirmwareSegment]) -> BTreeMap<u32, u8> {
	let mut map = BTreeMap::new();
	for seg in segments {
		for (i, &b) in seg.data.iter().enumerate() {
			map.insert(seg.addr + i as u32, b);
		}
	}
	map
}

#[test]
fn test_ihex_round_trip() {
	let original = vec![
		segment(0x0000, (0..100).map(|_| rand::random::<u8>()).collect()),
		segment(0x1000, (0..40).map(|_| rand::random::<u8>()).collect()),
		segment(0x3E80, (0..300).map(|_| rand::random::<u8>()).collect()),
	];

	let parsed = parse_ihex(image_from_segments(&original), FxType::Fx2lp).unwrap();
	assert_eq!(address_map(&parsed), address_map(&original));

	// and the reconstruction survives a second pass
	let reparsed = parse_ihex(image_from_segments(&parsed), FxType::Fx2lp).unwrap();
	assert_eq!(reparsed, parsed);
}

#[test]
fn test_contiguous_records_merge_up_to_the_segment_cap() {
	let original = vec![segment(0x0100, (0..1200).map(|i| i as u8).collect())];

	let parsed = parse_ihex(image_from_segments(&original), FxType::Fx2lp).unwrap();
	assert!(parsed.iter().all(|seg| seg.data.len() <= MAX_SEGMENT_LEN));

	// 16-byte records merge until one more would exceed 1023 bytes
	assert_eq!(parsed.len(), 2);
	assert_eq!(parsed[0].addr, 0x0100);
	assert_eq!(parsed[0].data.len(), 1008);
	assert_eq!(parsed[1].addr, 0x0100 + 1008);
	assert_eq!(parsed[1].data.len(), 192);

	assert_eq!(address_map(&parsed), address_map(&original));
}

#[test]
fn test_noncontiguous_address_forces_a_flush() {
	let original = vec![
		segment(0x0000, vec![1; 32]),
		segment(0x0040, vec![2; 32]),
	];

	let parsed = parse_ihex(image_from_segments(&original), FxType::Fx2lp).unwrap();
	assert_eq!(parsed.len(), 2);
	assert_eq!((parsed[0].addr, parsed[0].data.len()), (0x0000, 32));
	assert_eq!((parsed[1].addr, parsed[1].data.len()), (0x0040, 32));
}

#[test]
fn test_classification_boundaries_are_exact() {
	assert!(!FxType::Fx2lp.is_external(0x3FFF, 1));
	assert!( FxType::Fx2lp.is_external(0x4000, 1));
	assert!( FxType::Fx2lp.is_external(0x3FF0, 0x20));	// straddles the boundary
	assert!(!FxType::Fx2lp.is_external(0xE000, 0x200));
	assert!(!FxType::Fx2lp.is_external(0xE1FF, 1));
	assert!( FxType::Fx2lp.is_external(0xE200, 1));

	assert!(!FxType::Fx2.is_external(0x1FFF, 1));
	assert!( FxType::Fx2.is_external(0x2000, 1));

	assert!(!FxType::Fx.is_external(0x1B3F, 1));
	assert!( FxType::Fx.is_external(0x1B40, 1));
}

#[test]
fn test_comments_and_eof_record() {
	let image = "# copyright notice\n:020000001234B8\n:00000001FF\n:garbage after eof is ignored\n";
	let parsed = parse_ihex(Cursor::new(image.as_bytes()), FxType::Fx2lp).unwrap();
	assert_eq!(parsed.len(), 1);
	assert_eq!(parsed[0].data, vec![0x12, 0x34]);
}

#[test]
fn test_bad_records_are_fatal() {
	let not_a_record = "not an ihex line\n";
	assert!(matches!(parse_ihex(Cursor::new(not_a_record.as_bytes()), FxType::Fx2lp),
		Err(FrontEndError::MalformedFirmwareRecord(_))));

	// type 4 (extended linear address) is not supported
	let bad_type = ":020000040000FA\n";
	assert!(matches!(parse_ihex(Cursor::new(bad_type.as_bytes()), FxType::Fx2lp),
		Err(FrontEndError::MalformedFirmwareRecord(_))));

	let truncated = ":10000000AABB\n";
	assert!(matches!(parse_ihex(Cursor::new(truncated.as_bytes()), FxType::Fx2lp),
		Err(FrontEndError::MalformedFirmwareRecord(_))));
}

#[test]
fn test_missing_eof_record_still_flushes() {
	let image = ":020000001234B8\n";
	let parsed = parse_ihex(Cursor::new(image.as_bytes()), FxType::Fx2lp).unwrap();
	assert_eq!(parsed[0].data, vec![0x12, 0x34]);
}

#[test]
fn test_load_halts_writes_and_resumes() {
	let original = vec![segment(0x0000, vec![0x55; 64])];
	let mut dev = MockDevice::new();

	let stats = load_firmware(&mut dev, image_from_segments(&original), FxType::Fx2lp,
		RamMode::InternalOnly, None).unwrap();
	assert_eq!(stats.total_bytes, 64);
	assert_eq!(stats.segment_count, 1);

	assert_eq!(dev.writes, vec![
		WriteRecord{ opcode: RW_INTERNAL, addr: 0xE600, len: 1 },	// halt
		WriteRecord{ opcode: RW_INTERNAL, addr: 0x0000, len: 64 },
		WriteRecord{ opcode: RW_INTERNAL, addr: 0xE600, len: 1 },	// resume
	]);
}

#[test]
fn test_transfer_retries_succeed_below_the_limit() {
	let original = vec![segment(0x0000, vec![0x55; 64])];

	for k in 1..RETRY_LIMIT {
		// transfer 0 is the halt; fail the next k segment writes
		let mut dev = MockDevice::failing(1, k);
		let stats = load_firmware(&mut dev, image_from_segments(&original), FxType::Fx2lp,
			RamMode::InternalOnly, None).unwrap();
		assert_eq!(stats.segment_count, 1);
	}
}

#[test]
fn test_transfer_retries_exhaust_after_exactly_five_attempts() {
	let original = vec![segment(0x0000, vec![0x55; 64])];
	let mut dev = MockDevice::failing(1, RETRY_LIMIT);

	let res = load_firmware(&mut dev, image_from_segments(&original), FxType::Fx2lp,
		RamMode::InternalOnly, None);
	assert!(matches!(res, Err(FrontEndError::TransferIo(_))));

	// one halt plus exactly RETRY_LIMIT attempts on the segment, no resume
	assert_eq!(dev.seen, 1 + RETRY_LIMIT);
}

#[test]
fn test_external_segment_is_a_policy_violation_in_internal_only_mode() {
	let original = vec![segment(0x8000, vec![0xAB; 16])];
	let mut dev = MockDevice::new();

	let res = load_firmware(&mut dev, image_from_segments(&original), FxType::Fx2lp,
		RamMode::InternalOnly, None);
	assert!(matches!(res, Err(FrontEndError::PolicyViolation{ addr: 0x8000, len: 16 })));

	// nothing was written after the halt, not even a partial segment
	assert_eq!(dev.writes.len(), 1);
}

#[test]
fn test_two_stage_modes_are_not_implemented() {
	let original = vec![segment(0x0000, vec![0x55; 16])];

	for mode in &[RamMode::SkipInternal, RamMode::SkipExternal] {
		let mut dev = MockDevice::new();
		let res = load_firmware(&mut dev, image_from_segments(&original), FxType::Fx2lp, *mode, None);
		assert!(matches!(res, Err(FrontEndError::Unimplemented(_))));
	}
}

#[test]
fn test_pre_reset_hook_runs_after_segments_and_before_resume() {
	let original = vec![segment(0x0000, vec![0x55; 64])];
	let mut dev = MockDevice::new();

	let hook = |d:&mut MockDevice| d.control_write(RW_INTERNAL, 0x1003, &[18, 67, 224, 12, 16, 0]);
	load_firmware(&mut dev, image_from_segments(&original), FxType::Fx2lp,
		RamMode::InternalOnly, Some(&hook)).unwrap();

	let n = dev.writes.len();
	assert_eq!(dev.writes[n-2], WriteRecord{ opcode: RW_INTERNAL, addr: 0x1003, len: 6 });
	assert_eq!(dev.writes[n-1], WriteRecord{ opcode: RW_INTERNAL, addr: 0xE600, len: 1 });
}

#[test]
fn test_stall_is_tolerated_on_resume_but_not_on_halt() {
	let original = vec![segment(0x0000, vec![0x55; 64])];

	// transfers: 0 = halt, 1 = segment, 2 = resume
	let mut dev = MockDevice::new();
	dev.stall_at = Some(2);
	assert!(load_firmware(&mut dev, image_from_segments(&original), FxType::Fx2lp,
		RamMode::InternalOnly, None).is_ok());

	let mut dev = MockDevice::new();
	dev.stall_at = Some(0);
	let res = load_firmware(&mut dev, image_from_segments(&original), FxType::Fx2lp,
		RamMode::InternalOnly, None);
	assert!(matches!(res, Err(FrontEndError::TransferStall{..})));
}
