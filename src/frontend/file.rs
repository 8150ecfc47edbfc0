
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use crate::FrontEndError;
use crate::buffer::SampleRing;

use super::{FrontEnd, PumpResult, MEMBUFFLEN};

/// Plays a recorded IF capture back through the same contract as the live
/// hardware adapters.  No firmware, no resynchronization; a short tail at
/// the end of the file is dropped rather than padded so every chunk in the
/// ring is whole.
pub struct FileFrontEnd {
	path: PathBuf,
	fp: Option<File>,
	ring: Arc<SampleRing>,
	chunk_size: usize,
}

impl FileFrontEnd {

	pub fn new(path:PathBuf, chunk_size:usize) -> Self {
		FileFrontEnd{
			path,
			fp: None,
			ring: Arc::new(SampleRing::new(chunk_size, MEMBUFFLEN)),
			chunk_size,
		}
	}

}

impl FrontEnd for FileFrontEnd {

	fn init(&mut self) -> Result<(), FrontEndError> {
		self.fp = Some(File::open(&self.path)?);
		Ok(())
	}

	fn pump(&mut self) -> Result<PumpResult, FrontEndError> {
		let fp = self.fp.as_mut().ok_or(FrontEndError::Fault("pump before init"))?;

		let mut chunk = vec![0u8; self.chunk_size];
		let mut filled = 0;
		while filled < chunk.len() {
			match fp.read(&mut chunk[filled..])? {
				0 => return Ok(PumpResult::EndOfStream),
				n => filled += n,
			}
		}

		self.ring.append(&chunk);
		Ok(PumpResult::Nominal)
	}

	fn ring(&self) -> Arc<SampleRing> { Arc::clone(&self.ring) }

	fn chunk_size(&self) -> usize { self.chunk_size }

	fn teardown(&mut self) -> Result<(), FrontEndError> {
		self.fp = None;
		Ok(())
	}

}

#[cfg(test)]
mod tests {

	use std::io::Write;
	use std::path::PathBuf;

	use super::{FileFrontEnd, FrontEnd, PumpResult};

	fn temp_capture(name:&str, contents:&[u8]) -> PathBuf {
		let mut path = std::env::temp_dir();
		path.push(format!("{}_{}", name, std::process::id()));
		let mut f = std::fs::File::create(&path).unwrap();
		f.write_all(contents).unwrap();
		path
	}

	#[test]
	fn test_playback_drops_the_partial_tail() {
		// three whole chunks of 8 bytes plus a 3-byte tail
		let mut contents = vec![];
		for c in 0..3u8 {
			contents.extend(vec![c + 1; 8]);
		}
		contents.extend(vec![0xEE; 3]);

		let path = temp_capture("if_playback_tail", &contents);
		let mut fe = FileFrontEnd::new(path.clone(), 8);

		fe.init().unwrap();
		for c in 0..3u8 {
			assert_eq!(fe.pump().unwrap(), PumpResult::Nominal);
			assert_eq!(fe.ring().read(c as u64 * 8, 8), vec![c + 1; 8]);
		}
		assert_eq!(fe.pump().unwrap(), PumpResult::EndOfStream);
		assert_eq!(fe.ring().count(), 3);
		fe.teardown().unwrap();

		std::fs::remove_file(path).unwrap();
	}

	#[test]
	fn test_pump_before_init_is_a_fault() {
		let mut fe = FileFrontEnd::new(PathBuf::from("/nonexistent/capture.bin"), 8);
		assert!(fe.pump().is_err());
	}

}
