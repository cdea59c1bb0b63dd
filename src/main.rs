extern crate backtrace;
#[macro_use(crate_version, crate_authors)]
extern crate clap;

#[macro_use]
extern crate logger;

use std::panic;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use backtrace::Backtrace;
use clap::{App, Arg};

use logger::{Metric, LOGGER, METRICS};
use qemud_core::{ConnectMode, Driver, DriverConfig};

const DEFAULT_CONNECT_URI: &str = "qemu:///session";
const POLL_TIMEOUT_MS: i32 = 1000;

fn main() {
    // We install this before anything else so a panic anywhere below gets a
    // logged backtrace instead of a bare SIGABRT.
    panic::set_hook(Box::new(move |info| {
        error!("Panic occurred: {:?}", info);
        METRICS.lifecycle.panic_count.inc();

        let bt = Backtrace::new();
        error!("{:?}", bt);

        if let Err(e) = LOGGER.log_metrics() {
            error!("Failed to log metrics on abort: {}", e);
        }
    }));

    let cmd_arguments = App::new("qemud")
        .version(crate_version!())
        .author(crate_authors!())
        .about("Host-side hypervisor control driver.")
        .arg(
            Arg::with_name("connect")
                .long("connect")
                .help("Connection URI: qemu:///system or qemu:///session")
                .default_value(DEFAULT_CONNECT_URI)
                .takes_value(true),
        )
        .arg(
            Arg::with_name("config_dir")
                .long("config-dir")
                .help("Overrides the persistent domain config directory")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("state_dir")
                .long("state-dir")
                .help("Overrides the runtime state directory")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("log_file")
                .long("log-file")
                .help("Path to the log file; defaults to stdout")
                .takes_value(true),
        )
        .get_matches();

    let connect_uri = cmd_arguments.value_of("connect").unwrap();
    let mut config = match DriverConfig::from_uri(connect_uri) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("qemud: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(dir) = cmd_arguments.value_of("config_dir") {
        config.config_dir = PathBuf::from(dir);
    }
    if let Some(dir) = cmd_arguments.value_of("state_dir") {
        config.state_dir = PathBuf::from(dir);
    }

    let append = config.mode == ConnectMode::System;
    let log_file = cmd_arguments.value_of("log_file").map(|s| s.to_string());
    LOGGER
        .init(connect_uri, log_file, append)
        .expect("Failed to initialize logger");

    if !qemud_core::probe_host() {
        error!("No supported emulator binary found on this host");
    }

    let driver = Driver::new(&config, domain::testing::JsonFormat)
        .expect("Failed to initialize driver");

    info!("qemud listening under {}", connect_uri);

    loop {
        if let Err(e) = driver.poll_once(POLL_TIMEOUT_MS) {
            error!("poll loop error: {}", e);
            thread::sleep(Duration::from_millis(100));
        }
    }
}
