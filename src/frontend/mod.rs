
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Serialize, Deserialize};

use crate::FrontEndError;
use crate::buffer::SampleRing;
use crate::resync::DesyncEvent;

pub mod file;
pub mod simple_rf;

/// Ring depth in chunks, shared by every adapter.
pub const MEMBUFFLEN:usize = 5_000;

/// Expanded bytes per chunk for the simple 8-bit front end; one raw USB
/// byte carries four packed 2-bit ADC samples.
pub const SIMPLE_RF_BUFFSIZE:usize = 40_000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SampleKind {
	Real,
	ComplexIq,
}

impl SampleKind {
	pub fn bytes_per_sample(&self) -> usize {
		match self {
			SampleKind::Real      => 1,
			SampleKind::ComplexIq => 2,
		}
	}
}

/// Outcome of one pump cycle.  Streaming anomalies show up here rather than
/// as errors because the resynchronizer and the ring self-correct over the
/// following cycles; the usual policy is to log them and keep pumping.
#[derive(Debug, Clone, PartialEq)]
pub enum PumpResult {
	Nominal,
	Corrected{ slipped_bytes:u32 },
	Desync{ events:Vec<DesyncEvent> },
	EndOfStream,
}

/// Uniform contract every front end presents to the receiver dispatch
/// layer: bootstrap once, pump one chunk at a time from a dedicated
/// ingestion thread, serve byte windows to any number of consumer threads.
pub trait FrontEnd {

	fn init(&mut self) -> Result<(), FrontEndError>;

	fn pump(&mut self) -> Result<PumpResult, FrontEndError>;

	fn ring(&self) -> Arc<SampleRing>;

	/// Bytes appended to the ring per pump cycle.
	fn chunk_size(&self) -> usize;

	/// Copy `count` samples starting at an absolute sample offset.  Offsets
	/// and counts are in samples; the kind sets the byte width.
	fn get_buffer(&self, offset:u64, count:usize, kind:SampleKind) -> Vec<u8> {
		let width = kind.bytes_per_sample();
		self.ring().read(offset * width as u64, count * width)
	}

	fn teardown(&mut self) -> Result<(), FrontEndError>;

}

/* Expansion table for packed 2-bit samples, keyed (sign, magnitude). */
const LUT_2BIT:[i8; 4] = [1, 3, -1, -3];

/// Expand packed 2-bit IF samples to one signed sample per output byte.
/// Each source byte holds four samples; sample k takes its sign from bit
/// 7-k and its magnitude from bit 3-k.
pub fn expand_packed_2bit(src:&[u8], dst:&mut [u8]) {
	assert!(dst.len() >= src.len() * 4);

	let mut out = 0;
	for &b in src {
		let mut src_byte = b;
		for _ in 0..4 {
			let mut idx = 0usize;
			if src_byte & 0x08 != 0 { idx |= 1; }	// magnitude
			if src_byte & 0x80 != 0 { idx |= 2; }	// sign
			dst[out] = LUT_2BIT[idx] as u8;
			src_byte <<= 1;
			out += 1;
		}
	}
}

/// Counters accumulated by an ingestion loop, reported when it stops.
#[derive(Debug, Default, Clone, Serialize)]
pub struct IngestStats {
	pub chunks:u64,
	pub corrections:u64,
	pub corrected_bytes:u64,
	pub desync_events:u64,
	pub overruns:u64,
}

/// Drive a front end from its own ingestion thread until the stop flag is
/// raised or the stream ends.  The flag is polled once per iteration;
/// teardown always runs before the thread returns.  Overruns are logged
/// and counted, not fatal; everything else tears the front end down and
/// propagates.
pub fn run_ingestion<F: FrontEnd + Send + 'static>(mut fe:F, stop:Arc<AtomicBool>)
	-> std::thread::JoinHandle<Result<IngestStats, FrontEndError>> {

	std::thread::spawn(move || {
		let mut stats = IngestStats::default();

		while !stop.load(Ordering::Relaxed) {
			match fe.pump() {
				Ok(PumpResult::Nominal) => stats.chunks += 1,
				Ok(PumpResult::Corrected{ slipped_bytes }) => {
					stats.chunks += 1;
					stats.corrections += 1;
					stats.corrected_bytes += slipped_bytes as u64;
					tracing::debug!("re-aligned stream by {} bytes", slipped_bytes);
				},
				Ok(PumpResult::Desync{ events }) => {
					stats.chunks += 1;
					stats.desync_events += events.len() as u64;
				},
				Ok(PumpResult::EndOfStream) => break,
				Err(FrontEndError::Overrun{ got, requested }) => {
					stats.overruns += 1;
					tracing::warn!("overrun: read {} of {} requested bytes", got, requested);
				},
				Err(e) => {
					fe.teardown()?;
					return Err(e);
				},
			}
		}

		fe.teardown()?;
		Ok(stats)
	})
}

#[test]
fn test_expand_packed_2bit_lut() {
	let mut dst = [0u8; 16];

	expand_packed_2bit(&[0x00, 0xFF, 0x88, 0x08], &mut dst);

	let as_i8:Vec<i8> = dst.iter().map(|&b| b as i8).collect();
	assert_eq!(&as_i8[0..4],   &[ 1,  1,  1,  1]);	// no sign, no magnitude
	assert_eq!(&as_i8[4..8],   &[-3, -3, -3, -3]);	// all bits set
	assert_eq!(&as_i8[8..12],  &[-3,  1,  1,  1]);	// only the first sample flagged
	assert_eq!(&as_i8[12..16], &[ 3,  1,  1,  1]);	// magnitude without sign
}

#[test]
fn test_sample_kind_widths() {
	assert_eq!(SampleKind::Real.bytes_per_sample(), 1);
	assert_eq!(SampleKind::ComplexIq.bytes_per_sample(), 2);
}
