
extern crate clap;
extern crate colored;
extern crate sdr_frontend;
extern crate serde;

use std::fs::File;
use std::io::{BufReader, Cursor};

use clap::{Arg, App};
use colored::*;
use serde::Serialize;

use sdr_frontend::fx2::firmware::{parse_ihex, segments_to_image, FirmwareSegment, FxType};

#[derive(Debug, Serialize)]
struct SegmentRecord {
	pub addr:u32,
	pub len:usize,
	pub external:bool,
}

fn address_map(segments:&[FirmwareSegment]) -> std::collections::BTreeMap<u32, u8> {
	let mut map = std::collections::BTreeMap::new();
	for seg in segments {
		for (k, &b) in seg.data.iter().enumerate() {
			map.insert(seg.addr + k as u32, b);
		}
	}
	map
}

fn main() {

	tracing_subscriber::fmt::init();

	let matches = App::new("FX2 Firmware Inspector")
		.version("0.1.0")
		.author("John Stanford (johnwstanford@gmail.com)")
		.about("Parses an Intel HEX firmware image and lists its upload segments")
		.arg(Arg::with_name("filename")
			.short("f").long("filename")
			.help("Intel HEX firmware image")
			.required(true).takes_value(true))
		.arg(Arg::with_name("chip")
			.short("c").long("chip")
			.help("Chip profile used to classify segments")
			.takes_value(true)
			.possible_value("fx2lp").possible_value("fx2").possible_value("fx")
			.default_value("fx2lp"))
		.arg(Arg::with_name("verify")
			.short("v").long("verify")
			.help("Re-emit the parsed segments as HEX and re-parse them"))
		.get_matches();

	let fname:&str = matches.value_of("filename").unwrap();

	let fx_type = match matches.value_of("chip").unwrap() {
		"fx2" => FxType::Fx2,
		"fx"  => FxType::Fx,
		_     => FxType::Fx2lp,
	};

	let image = BufReader::new(File::open(fname).unwrap());
	let segments = parse_ihex(image, fx_type).unwrap();

	let records:Vec<SegmentRecord> = segments.iter().map(|seg| SegmentRecord{
		addr: seg.addr,
		len: seg.data.len(),
		external: seg.external,
	}).collect();

	let total:usize = records.iter().map(|r| r.len).sum();
	eprintln!("{}: {} segments, {} bytes", fname, records.len(), total);
	println!("{}", serde_json::to_string_pretty(&records).unwrap());

	// Segment boundaries can legitimately move through a re-emit, so the
	// round trip compares the flattened address map instead.
	if matches.is_present("verify") {
		let reparsed = parse_ihex(Cursor::new(segments_to_image(&segments)), fx_type).unwrap();
		if address_map(&reparsed) == address_map(&segments) {
			eprintln!("{}", "verify: OK".green());
		} else {
			eprintln!("{}", "verify: FAIL".red());
			std::process::exit(1);
		}
	}

}
