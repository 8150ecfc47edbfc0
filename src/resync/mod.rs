
use serde::Serialize;

/// Marker sequence embedded in the IF stream every NOMINAL_PERIOD bytes,
/// followed by a one-byte packet id that increments per packet.
pub const MARKER:[u8; 4] = [0xAA, 0xBB, 0xCC, 0xDD];

pub const NOMINAL_PERIOD:u64 = 10_000;

/* Gaps outside this band don't look like clock drift at all; correcting for
them would compound a spurious measurement, so they are only reported. */
pub const MIN_PLAUSIBLE:u64 = 6_000;
pub const MAX_PLAUSIBLE:u64 = 13_000;

/// A marker gap that could not be attributed to recoverable drift.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DesyncEvent {
	pub elapsed:u64,
	pub prev_packet_id:u8,
	pub packet_id:u8,
}

/// What one scan of a receive buffer turned up.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SyncReport {
	pub correction:u32,
	pub desyncs:Vec<DesyncEvent>,
}

/// Tracks marker cadence across reads.  One instance per ingestion stream,
/// owned by the adapter; the matcher state persists between `observe` calls
/// because a marker can straddle a read boundary.
pub struct MarkerSync {
	state_cnt: usize,
	expected_byte: u8,
	total_rx: u64,
	prev_marker: u64,
	prev_packet_id: u8,
	pending: u32,
}

impl MarkerSync {

	pub fn new() -> Self {
		MarkerSync{ state_cnt: 0, expected_byte: MARKER[0], total_rx: 0, prev_marker: 0, prev_packet_id: 0, pending: 0 }
	}

	pub fn total_bytes(&self) -> u64 { self.total_rx }

	/// Take the accumulated byte correction; the caller subtracts it from
	/// the length of the next read.
	pub fn take_correction(&mut self) -> u32 { std::mem::replace(&mut self.pending, 0) }

	/// Scan a receive buffer for marker sequences and measure the gap since
	/// the previous marker.  A short gap with a consecutive packet id is
	/// recoverable drift and accumulates a correction; anything else
	/// off-nominal is reported as a desync event and left uncorrected.
	pub fn observe(&mut self, data:&[u8]) -> SyncReport {
		let mut report = SyncReport::default();

		for i in 0..data.len() {
			let curr = data[i];
			self.total_rx += 1;

			if curr == self.expected_byte {
				self.state_cnt += 1;
				if self.state_cnt >= MARKER.len() {
					self.state_cnt = 0;
					self.expected_byte = MARKER[0];

					// The packet id sits right after the marker.  If the marker ends on
					// the last byte of the buffer the id isn't available yet; assume the
					// consecutive id so a short gap there is still correctable.
					let packet_id = match data.get(i+1) {
						Some(&id) => id,
						None      => self.prev_packet_id.wrapping_add(1),
					};

					let elapsed = self.total_rx - self.prev_marker;
					self.prev_marker = self.total_rx;

					if elapsed != NOMINAL_PERIOD {
						let id_diff = packet_id.wrapping_sub(self.prev_packet_id);
						if elapsed < MIN_PLAUSIBLE || elapsed > MAX_PLAUSIBLE || id_diff != 1 {
							tracing::warn!("marker desync: elapsed {} between packets {} and {}",
								elapsed, self.prev_packet_id, packet_id);
							report.desyncs.push(DesyncEvent{ elapsed, prev_packet_id: self.prev_packet_id, packet_id });
						} else if elapsed < NOMINAL_PERIOD {
							let slip = (NOMINAL_PERIOD - elapsed) as u32;
							self.pending += slip;
							report.correction += slip;
						}
						// a long gap with consecutive ids has no missing bytes to make up
					}

					self.prev_packet_id = packet_id;
				} else {
					self.expected_byte = MARKER[self.state_cnt];
				}
			} else if curr == MARKER[0] {
				// one-byte lookahead: a marker-start byte restarts the match
				// instead of being dropped
				self.state_cnt = 1;
				self.expected_byte = MARKER[1];
			} else {
				self.state_cnt = 0;
				self.expected_byte = MARKER[0];
			}
		}

		report
	}

}

#[cfg(test)]
fn marker_with_id(id:u8) -> Vec<u8> {
	let mut v = MARKER.to_vec();
	v.push(id);
	v
}

#[test]
fn test_aligned_stream_needs_no_correction() {
	let mut sync = MarkerSync::new();

	// first marker ends exactly at byte 10000
	let mut stream = vec![0u8; 9996];
	stream.extend(marker_with_id(1));

	let report = sync.observe(&stream);
	assert_eq!(report, SyncReport::default());
	assert_eq!(sync.take_correction(), 0);
}

#[test]
fn test_one_byte_slip_is_corrected_and_cadence_recovers() {
	let mut sync = MarkerSync::new();

	// one byte missing before the first marker, consecutive ids
	let mut stream = vec![0u8; 9995];
	stream.extend(marker_with_id(1));
	stream.extend(vec![0u8; 9995]);
	stream.extend(marker_with_id(2));

	let report = sync.observe(&stream);
	assert_eq!(report.correction, 1);
	assert!(report.desyncs.is_empty());

	// the second gap measured exactly the nominal period, so nothing further accumulated
	assert_eq!(sync.take_correction(), 1);
	assert_eq!(sync.take_correction(), 0);
}

#[test]
fn test_out_of_band_gap_is_a_desync_not_a_correction() {
	let mut sync = MarkerSync::new();

	let mut stream = vec![0u8; 496];
	stream.extend(marker_with_id(1));

	let report = sync.observe(&stream);
	assert_eq!(report.correction, 0);
	assert_eq!(report.desyncs, vec![DesyncEvent{ elapsed: 500, prev_packet_id: 0, packet_id: 1 }]);
	assert_eq!(sync.take_correction(), 0);
}

#[test]
fn test_nonconsecutive_packet_id_is_a_desync() {
	let mut sync = MarkerSync::new();

	// gap of 9999 would be correctable, but the packet id skips ahead
	let mut stream = vec![0u8; 9995];
	stream.extend(marker_with_id(3));

	let report = sync.observe(&stream);
	assert_eq!(report.correction, 0);
	assert_eq!(report.desyncs.len(), 1);
	assert_eq!(report.desyncs[0].packet_id, 3);
}

#[test]
fn test_marker_straddling_a_read_boundary() {
	let mut sync = MarkerSync::new();

	let mut stream = vec![0u8; 9995];
	stream.extend(marker_with_id(1));

	// split mid-marker: the matcher state carries across the two calls
	let (a, b) = stream.split_at(9997);
	let report_a = sync.observe(a);
	let report_b = sync.observe(b);

	assert_eq!(report_a.correction, 0);
	assert_eq!(report_b.correction, 1);
	assert_eq!(sync.take_correction(), 1);
}

#[test]
fn test_marker_start_byte_restarts_the_match() {
	let mut sync = MarkerSync::new();

	// the second 0xAA breaks the first match but must start a new one
	let stream = [0xAA, 0xAA, 0xBB, 0xCC, 0xDD, 7];
	let report = sync.observe(&stream);

	// the marker completed (elapsed 5, far out of band, so it's a desync)
	assert_eq!(report.desyncs.len(), 1);
	assert_eq!(report.desyncs[0].elapsed, 5);
}
