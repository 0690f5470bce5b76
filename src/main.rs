//! The worker binary: services the control channel handed over by the
//! controller process.
//!
//! Media sockets (ICE/DTLS/SRTP) are driven by the embedding stack, not by
//! this loop; what runs here is the request/response/notification traffic
//! and the periodic RTCP tick.

#[macro_use]
extern crate tracing;

use std::env;
use std::io::{self, BufReader, Write};
use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing_subscriber::EnvFilter;

use sfu_worker::channel::{self, Notifier, Request};
use sfu_worker::Worker;

#[cfg(unix)]
use std::os::unix::net::UnixStream;

static RUNNING: AtomicBool = AtomicBool::new(true);

#[cfg(unix)]
extern "C" fn on_signal(_signum: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

#[cfg(unix)]
fn install_signal_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(unix)]
fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let Some(fd) = env::var("MEDIASOUP_CHANNEL_FD")
        .ok()
        .and_then(|v| v.parse::<i32>().ok())
    else {
        error!("missing or invalid MEDIASOUP_CHANNEL_FD");
        exit(1);
    };

    install_signal_handlers();

    // The fd was opened for us by the parent.
    let stream = unsafe {
        use std::os::unix::io::FromRawFd;
        UnixStream::from_raw_fd(fd)
    };

    // Wake up regularly for signals and the RTCP tick.
    if let Err(e) = stream.set_read_timeout(Some(Duration::from_millis(500))) {
        error!("cannot set channel read timeout: {}", e);
        exit(1);
    }

    let mut writer = match stream.try_clone() {
        Ok(w) => w,
        Err(e) => {
            error!("cannot clone channel stream: {}", e);
            exit(1);
        }
    };
    let mut reader = BufReader::new(stream);

    let mut worker = Worker::new();
    let mut notifier = Notifier::new();

    info!("worker running");

    loop {
        if !RUNNING.load(Ordering::SeqCst) {
            info!("signal received, exiting");
            worker.close(&mut notifier);
            flush_notifications(&mut writer, &mut notifier);
            exit(0);
        }

        match channel::read_frame(&mut reader) {
            Ok(Some(frame)) => {
                handle_frame(&frame, &mut worker, &mut notifier, &mut writer);
            }
            Ok(None) => {
                // The parent died without signalling us first.
                error!("channel remotely closed, exiting");
                exit(1);
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                worker.send_rtcp(now_ms());
            }
            Err(e) => {
                error!("channel read failed: {}, exiting", e);
                exit(1);
            }
        }
    }
}

#[cfg(unix)]
fn handle_frame(
    frame: &[u8],
    worker: &mut Worker,
    notifier: &mut Notifier,
    writer: &mut impl Write,
) {
    let response = match Request::parse(frame) {
        Ok(request) => worker.handle_request(&request, notifier),
        Err(e) => {
            // Without a request id there is nothing to respond to.
            warn!("discarding unparseable request: {}", e);
            return;
        }
    };

    let payload = serde_json::to_vec(&response.to_json()).expect("response serializes");
    if let Err(e) = channel::write_frame(writer, &payload) {
        error!("channel write failed: {}, exiting", e);
        exit(1);
    }

    flush_notifications(writer, notifier);
}

#[cfg(unix)]
fn flush_notifications(writer: &mut impl Write, notifier: &mut Notifier) {
    while let Some(notification) = notifier.poll_notification() {
        let payload = serde_json::to_vec(&notification.to_json()).expect("notification serializes");
        if let Err(e) = channel::write_frame(writer, &payload) {
            error!("channel write failed: {}, exiting", e);
            exit(1);
        }
    }
}

#[cfg(not(unix))]
fn main() {
    eprintln!("the worker only runs on unix platforms");
    exit(1);
}
