
use thiserror::Error;

pub mod buffer;
pub mod frontend;
pub mod fx2;
pub mod resync;

/* Every fatal condition in the front-end layer maps onto one of these
variants.  Streaming anomalies that the pipeline recovers from on its own
(marker drift, desync events) are not errors; they come back through
frontend::PumpResult instead. */
#[derive(Debug, Error)]
pub enum FrontEndError {
	#[error("no front end device found")]
	DeviceNotFound,
	#[error("control transfer stalled, request 0x{request:02X}")]
	TransferStall{ request:u8 },
	#[error("USB transfer failed: {0}")]
	TransferIo(#[from] rusb::Error),
	#[error("malformed firmware record: {0}")]
	MalformedFirmwareRecord(String),
	#[error("refusing to write {len} bytes of external memory at 0x{addr:08X} in internal-only mode")]
	PolicyViolation{ addr:u32, len:usize },
	#[error("read returned {got} of {requested} requested bytes")]
	Overrun{ got:usize, requested:usize },
	#[error("device fault: {0}")]
	Fault(&'static str),
	#[error("not implemented: {0}")]
	Unimplemented(&'static str),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}
