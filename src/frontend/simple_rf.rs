
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;

use crate::FrontEndError;
use crate::buffer::SampleRing;
use crate::fx2::{Fx2Device, VendorControl, RW_INTERNAL};
use crate::fx2::agc::{self, AgcReading};
use crate::fx2::firmware::{self, FxType, RamMode};
use crate::resync::MarkerSync;

use super::{FrontEnd, PumpResult, expand_packed_2bit, MEMBUFFLEN, SIMPLE_RF_BUFFSIZE};

/// Raw USB bytes per bulk read; expands 4x into the ring.
pub const USB_CHUNK:usize = SIMPLE_RF_BUFFSIZE / 4;

// Bare FX2LP (04B4:8613), last entry of the VID/PID table
const SIMPLE_RF_PORT:usize = 4;

const STREAM_INTERFACE:u8 = 0;
const STREAM_ALT_SETTING:u8 = 1;

/* Configuration block the streaming firmware reads at boot; it has to land
before the CPU comes out of reset, hence the pre-reset hook. */
const FIRMWARE_CONFIG_ADDR:u32 = 0x1003;
const FIRMWARE_CONFIG:[u8; 6] = [18, 67, 224, 12, 16, 0];

/// Front end built from a bare FX2LP streaming packed 2-bit IF samples.
/// `init` uploads the streaming firmware through the first-stage loader,
/// lets the device re-enumerate, and claims the bulk endpoint.
pub struct SimpleRfFrontEnd {
	firmware_path: PathBuf,
	dev: Option<Fx2Device>,
	sync: MarkerSync,
	ring: Arc<SampleRing>,
	usb_buf: Vec<u8>,
}

impl SimpleRfFrontEnd {

	pub fn new(firmware_path:PathBuf) -> Self {
		SimpleRfFrontEnd{
			firmware_path,
			dev: None,
			sync: MarkerSync::new(),
			ring: Arc::new(SampleRing::new(SIMPLE_RF_BUFFSIZE, MEMBUFFLEN)),
			usb_buf: vec![0u8; USB_CHUNK],
		}
	}

	pub fn read_agc(&self) -> Result<AgcReading, FrontEndError> {
		let dev = self.dev.as_ref().ok_or(FrontEndError::DeviceNotFound)?;
		agc::read_agc(dev)
	}

	pub fn check_rx_overrun(&self) -> Result<bool, FrontEndError> {
		let dev = self.dev.as_ref().ok_or(FrontEndError::DeviceNotFound)?;
		dev.check_rx_overrun()
	}

}

impl FrontEnd for SimpleRfFrontEnd {

	fn init(&mut self) -> Result<(), FrontEndError> {
		// Bootstrap stage.  The handle is released and reset when it goes
		// out of scope, so a failed load still leaves the device closed.
		{
			let mut dev = Fx2Device::open(SIMPLE_RF_PORT)?;
			let image = BufReader::new(File::open(&self.firmware_path)?);

			let hook:&dyn Fn(&mut Fx2Device) -> Result<(), FrontEndError> =
				&|d| d.control_write(RW_INTERNAL, FIRMWARE_CONFIG_ADDR, &FIRMWARE_CONFIG);
			let stats = firmware::load_firmware(&mut dev, image, FxType::Fx2lp, RamMode::InternalOnly, Some(hook))?;
			tracing::info!("loaded {} firmware bytes from {}", stats.total_bytes, self.firmware_path.display());
		}

		// Streaming stage: the device is now running the uploaded firmware.
		let mut dev = Fx2Device::open(SIMPLE_RF_PORT)?;
		dev.claim_streaming(STREAM_INTERFACE, STREAM_ALT_SETTING)?;
		self.dev = Some(dev);
		Ok(())
	}

	fn pump(&mut self) -> Result<PumpResult, FrontEndError> {
		let dev = self.dev.as_ref().ok_or(FrontEndError::DeviceNotFound)?;
		ingest_chunk(&mut self.sync, &self.ring, &mut self.usb_buf, |buf| dev.read_if(buf))
	}

	fn ring(&self) -> Arc<SampleRing> { Arc::clone(&self.ring) }

	fn chunk_size(&self) -> usize { SIMPLE_RF_BUFFSIZE }

	fn teardown(&mut self) -> Result<(), FrontEndError> {
		if let Some(dev) = self.dev.take() {
			dev.close();
		}
		Ok(())
	}

}

/// One ingestion cycle: shrink the read by the pending marker correction
/// and aim it past the previously unconsumed prefix, scan for markers,
/// expand the packed samples, and append the chunk to the ring.
///
/// The stale prefix bytes are scanned and appended again on purpose: the
/// shrunk read shifts every later byte earlier in the stream count, which
/// is what pulls the next marker back to its expected cadence.
pub(crate) fn ingest_chunk<F: FnMut(&mut [u8]) -> Result<usize, FrontEndError>>(
	sync:&mut MarkerSync, ring:&SampleRing, usb_buf:&mut [u8], mut read_if:F) -> Result<PumpResult, FrontEndError> {

	let correction = (sync.take_correction() as usize).min(usb_buf.len() - 1);
	let want = usb_buf.len() - correction;
	let got = read_if(&mut usb_buf[correction..])?;

	let report = sync.observe(usb_buf);

	if got != want {
		return Err(FrontEndError::Overrun{ got, requested: want });
	}

	let mut expanded = vec![0u8; usb_buf.len() * 4];
	expand_packed_2bit(usb_buf, &mut expanded);
	ring.append(&expanded);

	if !report.desyncs.is_empty() {
		return Ok(PumpResult::Desync{ events: report.desyncs });
	}
	if report.correction > 0 {
		return Ok(PumpResult::Corrected{ slipped_bytes: report.correction });
	}
	Ok(PumpResult::Nominal)
}

#[cfg(test)]
mod tests {

	use crate::buffer::SampleRing;
	use crate::resync::{MarkerSync, MARKER, NOMINAL_PERIOD};

	use super::{ingest_chunk, PumpResult, USB_CHUNK};

	/* Synthetic IF stream: the first marker ends exactly at byte 10000 and
	markers repeat every 10000 bytes with incrementing packet ids. */
	fn synthetic_stream(periods:usize) -> Vec<u8> {
		let mut stream = vec![0x11u8; (NOMINAL_PERIOD as usize) - 4];
		for id in 1..=periods {
			stream.extend_from_slice(&MARKER);
			stream.push(id as u8);
			stream.extend(vec![0x11u8; (NOMINAL_PERIOD as usize) - 5]);
		}
		stream
	}

	fn pump_all(stream:Vec<u8>, pumps:usize) -> Vec<PumpResult> {
		let mut sync = MarkerSync::new();
		let ring = SampleRing::new(USB_CHUNK * 4, 16);
		let mut usb_buf = vec![0u8; USB_CHUNK];
		let mut pos = 0usize;

		let mut results = vec![];
		for _ in 0..pumps {
			let res = ingest_chunk(&mut sync, &ring, &mut usb_buf, |buf| {
				let n = buf.len().min(stream.len() - pos);
				buf[..n].copy_from_slice(&stream[pos..pos + n]);
				pos += n;
				Ok(n)
			}).unwrap();
			results.push(res);
		}
		results
	}

	#[test]
	fn test_clean_stream_pumps_nominal() {
		let results = pump_all(synthetic_stream(8), 6);
		assert!(results.iter().all(|r| *r == PumpResult::Nominal));
	}

	#[test]
	fn test_dropped_byte_is_corrected_and_cadence_recovers() {
		let mut stream = synthetic_stream(8);
		// drop one filler byte in the third period
		stream.remove(25_000);

		let results = pump_all(stream, 6);

		let corrected:Vec<&PumpResult> = results.iter()
			.filter(|r| matches!(r, PumpResult::Corrected{..}))
			.collect();
		assert_eq!(corrected, vec![&PumpResult::Corrected{ slipped_bytes: 1 }]);

		// every later cycle measured the nominal period again
		let after = results.iter()
			.skip_while(|r| !matches!(r, PumpResult::Corrected{..}))
			.skip(1);
		assert!(after.clone().count() > 0);
		assert!(after.into_iter().all(|r| *r == PumpResult::Nominal));
	}

	#[test]
	fn test_short_read_is_an_overrun() {
		let mut sync = MarkerSync::new();
		let ring = SampleRing::new(USB_CHUNK * 4, 16);
		let mut usb_buf = vec![0u8; USB_CHUNK];

		let res = ingest_chunk(&mut sync, &ring, &mut usb_buf, |buf| Ok(buf.len() / 2));
		assert!(matches!(res, Err(crate::FrontEndError::Overrun{..})));
		assert_eq!(ring.count(), 0);
	}

}
