//! A minimal standalone "host" pumping the loop from its own main thread.
//!
//! Run with: `RUST_LOG=debug cargo run -p hostloop-rt --example standalone`
//!
//! Demonstrates:
//! - Worker threads posting closures onto the loop thread
//! - A socket registered for readability, closed by its writer after a few lines
//! - Ctrl+C captured as a flag and turned into an orderly quit

use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Duration;

use hostloop_rt::{EventLoop, Interest, LoopConfig};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = LoopConfig::new()
        .install_interrupt_handler(true)
        .idle_timeout(Duration::from_millis(500))
        .on_quit(|| println!("quit requested, finishing up"));
    let event_loop = EventLoop::create(config)?;

    // ── Posting from worker threads ─────────────────────────────────

    for worker in 0..2 {
        let handle = event_loop.handle();
        thread::spawn(move || {
            for tick in 0.. {
                thread::sleep(Duration::from_millis(700 + worker * 300));
                let posted = handle.post(move || {
                    println!("worker {worker}: tick {tick} (on loop thread)");
                });
                if !posted {
                    break;
                }
            }
        });
    }

    // ── A registered descriptor ─────────────────────────────────────

    let (mut tx, mut rx) = UnixStream::pair().into_diagnostic()?;
    let rx_fd = rx.as_raw_fd();
    let handle = event_loop.handle();
    event_loop.register_fd_callback(rx_fd, Interest::READABLE, move |fd| {
        let mut buf = [0u8; 256];
        match rx.read(&mut buf) {
            Ok(0) | Err(_) => {
                println!("fd {fd}: writer closed, unregistering");
                let _ = handle.unregister_fd_callback(fd);
            }
            Ok(n) => print!("fd {fd}: {}", String::from_utf8_lossy(&buf[..n])),
        }
    });

    thread::spawn(move || {
        for line in 1..=3 {
            thread::sleep(Duration::from_secs(1));
            let _ = writeln!(tx, "line {line}");
        }
    });

    println!("pumping; press Ctrl+C to quit");
    while !event_loop.is_quit_requested() {
        event_loop.dispatch_next(false)?;
    }

    // Flush anything that arrived while quitting.
    while event_loop.dispatch_next(true)? {}
    event_loop.shutdown();
    Ok(())
}
