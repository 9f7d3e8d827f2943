//! pixloader.
//!
//! Loads images through a memory cache, a disk cache and the network, deduplicating concurrent
//! loads of the same image. The command line application exercises the whole pipeline for a
//! single image, and maintains the disk cache.

#![warn(missing_debug_implementations, clippy::all)]

mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
