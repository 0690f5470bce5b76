//! Worker-side engine of a selective forwarding unit (SFU).
//!
//! A controller process spawns the worker and drives it over a duplex
//! control channel of length-prefixed JSON messages. The worker maintains
//! the media routing graph (Room → Peer → Transport → Producer/Consumer),
//! rewrites RTP on the way from each Producer to its Consumers, and selects
//! VP8 temporal layers per subscriber.
//!
//! The crate is sans-IO: nothing in here touches a socket. Incoming RTP is
//! handed to [`Room::receive_rtp`], outgoing packets are queued on each
//! [`Transport`] and notifications on the [`channel::Notifier`], both
//! drained by the embedder (see `main.rs` for the reference event loop).
//!
//! ```no_run
//! use sfu_worker::channel::{Notifier, Request};
//! use sfu_worker::Worker;
//!
//! let mut worker = Worker::new();
//! let mut notifier = Notifier::new();
//! # let frame: &[u8] = &[];
//! let request = Request::parse(frame).unwrap();
//! let response = worker.handle_request(&request, &mut notifier);
//! ```

#![allow(clippy::new_without_default)]

#[macro_use]
extern crate tracing;

mod error;
pub use error::WorkerError;

pub mod rtp;

pub mod rtcp;

pub mod codecs;

pub mod streams;

mod parameters;
pub use parameters::{
    MediaKind, Profile, RtcpFeedback, RtcpParameters, RtpCapabilities, RtpCodecParameters,
    RtpEncodingParameters, RtpParameters, RtxParameters,
};

mod consumer;
pub use consumer::Consumer;

mod producer;
pub use producer::Producer;

mod transport;
pub use transport::{Transmit, Transport};

mod peer;
pub use peer::Peer;

mod room;
pub use room::Room;

pub mod channel;

mod worker;
pub use worker::Worker;

/// Largest datagram the worker deals in. Packets above this are dropped at
/// ingress; RTX encoding must fit the original plus the OSN field.
pub(crate) const MTU_SIZE: usize = 1500;
