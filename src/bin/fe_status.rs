
extern crate clap;
extern crate colored;
extern crate sdr_frontend;
extern crate serde;

use clap::{Arg, App};
use colored::*;
use serde::Serialize;

use sdr_frontend::fx2::Fx2Device;
use sdr_frontend::fx2::agc;

#[derive(Debug, Serialize)]
struct StatusReport {
	pub rx_overrun:bool,
	pub fifo_idx:u16,
	pub agc_values:Vec<u16>,
	pub agc_flags:Vec<u8>,
}

fn main() {

	tracing_subscriber::fmt::init();

	let matches = App::new("Front End Status")
		.version("0.1.0")
		.author("John Stanford (johnwstanford@gmail.com)")
		.about("Queries a running front end for FIFO, overrun, and AGC state")
		.arg(Arg::with_name("port")
			.short("p").long("port")
			.help("Index into the supported VID/PID table")
			.takes_value(true).default_value("4"))
		.get_matches();

	let port:usize = matches.value_of("port").unwrap().parse().unwrap();

	let dev = match Fx2Device::open(port) {
		Ok(dev) => dev,
		Err(e) => {
			eprintln!("{}", format!("No device on port {}: {:?}", port, e).red());
			std::process::exit(1);
		},
	};

	let flags = dev.fifo_flags().unwrap();
	let rx_overrun = dev.check_rx_overrun().unwrap();
	let agc = agc::read_agc(&dev).unwrap();

	let report = StatusReport{
		rx_overrun,
		fifo_idx: flags.fifo_idx,
		agc_values: agc.values.clone(),
		agc_flags: agc.flags.to_vec(),
	};

	if rx_overrun {
		eprintln!("{}", "RX overrun flagged".yellow());
	} else {
		eprintln!("{}", format!("Nominal, {} AGC readings", agc.count()).green());
	}
	println!("{}", serde_json::to_string_pretty(&report).unwrap());

	dev.close();

}
