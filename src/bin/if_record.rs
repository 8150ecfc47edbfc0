
extern crate clap;
extern crate colored;
extern crate dirs;
extern crate sdr_frontend;
extern crate serde;

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use clap::{Arg, App};
use colored::*;

use sdr_frontend::FrontEndError;
use sdr_frontend::buffer::SampleRing;
use sdr_frontend::frontend::{FrontEnd, IngestStats, run_ingestion, SIMPLE_RF_BUFFSIZE};
use sdr_frontend::frontend::file::FileFrontEnd;
use sdr_frontend::frontend::simple_rf::SimpleRfFrontEnd;

fn default_firmware_path() -> PathBuf {
	let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
	path.push(".sdr_frontend");
	path.push("fx2pipe.ihx");
	path
}

fn main() {

	tracing_subscriber::fmt::init();

	let matches = App::new("IF Recorder")
		.version("0.1.0")
		.author("John Stanford (johnwstanford@gmail.com)")
		.about("Streams IF samples from a front end into a file")
		.arg(Arg::with_name("frontend")
			.short("e").long("frontend")
			.help("Front end type")
			.takes_value(true)
			.possible_value("simple_rf").possible_value("file")
			.default_value("simple_rf"))
		.arg(Arg::with_name("input")
			.short("i").long("input")
			.help("Input capture for file playback")
			.takes_value(true))
		.arg(Arg::with_name("firmware")
			.short("w").long("firmware")
			.help("Intel HEX firmware image, defaults to ~/.sdr_frontend/fx2pipe.ihx")
			.takes_value(true))
		.arg(Arg::with_name("output")
			.short("o").long("output")
			.help("Output filename")
			.required(true).takes_value(true))
		.arg(Arg::with_name("chunks")
			.short("n").long("chunks")
			.help("Number of chunks to record")
			.takes_value(true))
		.get_matches();

	let out_name:&str = matches.value_of("output").unwrap();
	let opt_max_chunks:Option<u64> = matches.value_of("chunks").map(|s| s.parse().unwrap());

	let stop = Arc::new(AtomicBool::new(false));

	let (ring, chunk_size, handle):(Arc<SampleRing>, usize, JoinHandle<Result<IngestStats, FrontEndError>>) =
		match matches.value_of("frontend").unwrap() {
		"file" => {
			let in_name = matches.value_of("input").expect("file playback needs --input");
			let mut fe = FileFrontEnd::new(PathBuf::from(in_name), SIMPLE_RF_BUFFSIZE);
			fe.init().unwrap();
			(fe.ring(), fe.chunk_size(), run_ingestion(fe, stop.clone()))
		},
		_ => {
			let fw = matches.value_of("firmware").map(PathBuf::from).unwrap_or_else(default_firmware_path);
			let mut fe = SimpleRfFrontEnd::new(fw);
			fe.init().unwrap();
			(fe.ring(), fe.chunk_size(), run_ingestion(fe, stop.clone()))
		},
	};

	let mut out_file = File::create(out_name).unwrap();
	let mut next_chunk:u64 = 0;

	// One consumer draining the ring by absolute chunk offset.  The drain
	// stays behind the ingestion thread, so the window it copies from the
	// ring is never overwritten mid-read.
	loop {
		if let Some(max) = opt_max_chunks {
			if next_chunk >= max {
				stop.store(true, Ordering::Relaxed);
				break;
			}
		}
		if handle.is_finished() { break }

		if ring.count() > next_chunk {
			let chunk = ring.read(next_chunk * chunk_size as u64, chunk_size);
			out_file.write_all(&chunk).unwrap();
			next_chunk += 1;
		} else {
			std::thread::sleep(std::time::Duration::from_millis(1));
		}
	}

	// drain whatever landed after the stop was requested
	while ring.count() > next_chunk {
		let chunk = ring.read(next_chunk * chunk_size as u64, chunk_size);
		out_file.write_all(&chunk).unwrap();
		next_chunk += 1;
	}

	match handle.join().unwrap() {
		Ok(stats) => {
			eprintln!("{}", format!("Recorded {} chunks ({} bytes) to {}",
				next_chunk, next_chunk * chunk_size as u64, out_name).green());
			println!("{}", serde_json::to_string_pretty(&stats).unwrap());
		},
		Err(e) => eprintln!("{}", format!("Ingestion failed: {:?}", e).red()),
	}

}
