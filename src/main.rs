use clap::{App, Arg};

use treesync::engine::{self, Options};
use treesync::logging;

fn parse_options() -> Options {
	let matches = App::new("sync")
		.version("0.1")
		.about("Continuous directory tree mirroring over ssh")
		.arg(
			Arg::with_name("server")
				.long("server")
				.help("Internal parameter used on the remote side"),
		)
		.arg(Arg::with_name("debug").long("debug").help("Turn on debugging information"))
		.arg(
			Arg::with_name("hostname")
				.long("hostname")
				.takes_value(true)
				.help("Internal parameter used on the remote side"),
		)
		.arg(
			Arg::with_name("no-watcher")
				.long("no-watcher")
				.help("Do not watch the local tree; only apply incoming changes"),
		)
		.arg(
			Arg::with_name("no-remote")
				.long("no-remote")
				.help("Do not connect to any peer; record local changes only"),
		)
		.arg(Arg::with_name("dir").index(1).help("Directory to mirror (default: current)"))
		.get_matches_safe()
		.unwrap_or_else(|e| {
			use clap::ErrorKind;
			if e.kind == ErrorKind::HelpDisplayed || e.kind == ErrorKind::VersionDisplayed {
				eprintln!("{}", e.message);
				std::process::exit(0);
			}
			eprintln!("{}", e.message);
			std::process::exit(2);
		});

	Options {
		server: matches.is_present("server"),
		debug: matches.is_present("debug"),
		hostname: matches.value_of("hostname").unwrap_or("").to_string(),
		no_watcher: matches.is_present("no-watcher"),
		no_remote: matches.is_present("no-remote"),
		dir: matches.value_of("dir").map(String::from),
	}
}

#[tokio::main]
async fn main() {
	let opts = parse_options();
	logging::init_tracing(opts.debug);

	if let Err(e) = engine::run(opts).await {
		tracing::error!("{}", e);
		std::process::exit(1);
	}
}

// vim: ts=4
