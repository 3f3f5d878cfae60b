// src/main.rs
//
// Entry point: parses the extcap command line, sets up logging and the
// termination signal handler, then dispatches into the interface registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use once_cell::sync::Lazy;

use capturino_lib::extcap::{self, ExtcapArgs};
use capturino_lib::logging::{self, Severity};
use capturino_lib::tlog;

/// Shared cancel flag: raised by the signal handler, polled by the capture
/// loop.
static CANCEL: Lazy<Arc<AtomicBool>> = Lazy::new(|| Arc::new(AtomicBool::new(false)));

#[cfg(unix)]
extern "C" fn handle_termination(_signal: libc::c_int) {
    CANCEL.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
fn register_signal_handlers() {
    // Touch the flag so the Lazy init never runs inside the handler.
    CANCEL.load(Ordering::SeqCst);
    let handler = handle_termination as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

// Wireshark terminates the extcap process directly on Windows; the pipe
// breaking ends the capture loop there.
#[cfg(not(unix))]
fn register_signal_handlers() {}

fn main() {
    // Launched by hand without arguments: print a short identification.
    if std::env::args().len() <= 1 {
        println!(
            "CAPTURino interface for Wireshark\nVersion {}",
            env!("CARGO_PKG_VERSION")
        );
        return;
    }

    let args = ExtcapArgs::parse();

    if let Some(path) = &args.logfile {
        if let Err(e) = logging::init_file_logging(path) {
            eprintln!("{}", e);
        }
    }
    logging::set_min_severity(Severity::from_level(args.loglevel));

    tlog!(
        Severity::Info,
        "main",
        "new call of the extcap interface: {:?}",
        std::env::args().collect::<Vec<_>>()
    );

    register_signal_handlers();

    let code = match extcap::run(&args, CANCEL.clone()) {
        Ok(()) => 0,
        Err(e) => {
            tlog!(Severity::Failure, "main", "{}", e);
            1
        }
    };

    logging::stop_file_logging();
    std::process::exit(code);
}
