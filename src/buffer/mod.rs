
use std::sync::Mutex;

/* Fixed-capacity circular store shared between one ingestion thread and any
number of consumers.  The buffer and the chunk counter sit behind separate
locks so counter reads never block on an in-flight copy; the accepted trade
is that a reader can compute an offset whose slot write hasn't committed
yet.  Each slot write is a single contiguous copy under the buffer lock, so
a stale read is possible but a torn one is not.

Nothing stops a consumer from reading a slot more than `n_slots` chunks
stale; consumers are expected to keep up with the producer. */
pub struct SampleRing {
	buff: Mutex<Vec<u8>>,
	count: Mutex<u64>,
	slot_size: usize,
	n_slots: usize,
}

impl SampleRing {

	pub fn new(slot_size:usize, n_slots:usize) -> Self {
		SampleRing{
			buff: Mutex::new(vec![0u8; slot_size * n_slots]),
			count: Mutex::new(0),
			slot_size,
			n_slots,
		}
	}

	pub fn slot_size(&self) -> usize { self.slot_size }

	pub fn n_slots(&self) -> usize { self.n_slots }

	pub fn capacity(&self) -> usize { self.slot_size * self.n_slots }

	/// Number of chunks appended so far; strictly monotonic.
	pub fn count(&self) -> u64 { *self.count.lock().unwrap() }

	/// Append one chunk at slot `count % n_slots`, then publish it by
	/// bumping the counter.  Single producer only.
	pub fn append(&self, chunk:&[u8]) {
		assert_eq!(chunk.len(), self.slot_size);

		let slot = (self.count() % self.n_slots as u64) as usize;
		{
			let mut buff = self.buff.lock().unwrap();
			let start = slot * self.slot_size;
			buff[start..start + chunk.len()].copy_from_slice(chunk);
		}

		let mut count = self.count.lock().unwrap();
		*count += 1;
	}

	/// Copy `len` bytes starting at an absolute stream offset, wrapping at
	/// the capacity boundary.  Any thread may call this.
	pub fn read(&self, offset:u64, len:usize) -> Vec<u8> {
		let cap = self.capacity();
		assert!(len <= cap);

		let start = (offset % cap as u64) as usize;
		let mut out = vec![0u8; len];

		let buff = self.buff.lock().unwrap();
		if start + len > cap {
			let first = cap - start;
			out[..first].copy_from_slice(&buff[start..]);
			out[first..].copy_from_slice(&buff[..len - first]);
		} else {
			out.copy_from_slice(&buff[start..start + len]);
		}

		out
	}

}

#[cfg(test)]
mod tests {

	use std::sync::Arc;
	use std::sync::atomic::{AtomicBool, Ordering};

	use super::SampleRing;

	#[test]
	fn test_reads_match_the_absolute_stream_including_wraparound() {
		let ring = SampleRing::new(8, 4);
		let mut shadow:Vec<u8> = vec![];

		for _ in 0..6 {
			let chunk:Vec<u8> = (0..8).map(|_| rand::random::<u8>()).collect();
			ring.append(&chunk);
			shadow.extend_from_slice(&chunk);
		}
		assert_eq!(ring.count(), 6);

		// any offset within the live window must read back exactly, including
		// offsets whose in-ring range straddles the wraparound boundary
		let window_start = shadow.len() - ring.capacity();
		for offset in window_start..shadow.len() {
			for &len in &[1usize, 3, 8] {
				if offset + len > shadow.len() { continue; }
				assert_eq!(ring.read(offset as u64, len), &shadow[offset..offset + len],
					"offset {} len {}", offset, len);
			}
		}
	}

	#[test]
	fn test_read_of_the_full_capacity() {
		let ring = SampleRing::new(4, 3);
		for v in 0..3u8 {
			ring.append(&[v; 4]);
		}

		assert_eq!(ring.read(0, 12), vec![0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2]);
		// wrap around from the middle of slot 1
		assert_eq!(ring.read(6, 8), vec![1, 1, 2, 2, 2, 2, 0, 0]);
	}

	#[test]
	fn test_concurrent_readers_never_see_torn_slots() {
		// every chunk is a single repeated value, so any slot-aligned read
		// that mixes values was torn
		let ring = Arc::new(SampleRing::new(256, 8));
		let done = Arc::new(AtomicBool::new(false));

		let readers:Vec<_> = (0..4).map(|_| {
			let ring = Arc::clone(&ring);
			let done = Arc::clone(&done);
			std::thread::spawn(move || {
				while !done.load(Ordering::Relaxed) {
					let count = ring.count();
					if count == 0 { continue; }
					let slot_offset = (count - 1) * ring.slot_size() as u64;
					let bytes = ring.read(slot_offset, ring.slot_size());
					assert!(bytes.iter().all(|&b| b == bytes[0]), "torn slot read");
				}
			})
		}).collect();

		for v in 0..=255u8 {
			ring.append(&[v; 256]);
		}
		done.store(true, Ordering::Relaxed);

		for r in readers {
			r.join().unwrap();
		}
	}

}
