use std::collections::VecDeque;

use serde_json::{json, Value};

use crate::rtp::RtpPacket;
use crate::WorkerError;

/// An outgoing datagram queued on a transport, drained by the embedder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transmit {
    Rtp(Vec<u8>),
    Rtcp(Vec<u8>),
}

/// A network endpoint of a peer.
///
/// ICE, DTLS and SRTP live outside the core; the transport only multiplexes
/// media in and queues media out. The remote DTLS parameters handed over
/// the channel are recorded for the external stack to pick up.
#[derive(Debug)]
pub struct Transport {
    id: u32,
    /// Remote DTLS role/fingerprints, inert state for the outer stack.
    remote_dtls_parameters: Option<Value>,
    queued: VecDeque<Transmit>,
}

impl Transport {
    pub fn new(id: u32, _options: &Value) -> Transport {
        Transport {
            id,
            remote_dtls_parameters: None,
            queued: VecDeque::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn set_remote_dtls_parameters(&mut self, data: &Value) -> Result<(), WorkerError> {
        if !data.is_object() {
            return Err(WorkerError::protocol(
                "Request has no object .dtlsParameters field",
            ));
        }

        self.remote_dtls_parameters = Some(data.clone());

        Ok(())
    }

    /// Queues a media packet in its current (rewritten) state.
    pub fn send_rtp_packet(&mut self, packet: &RtpPacket) {
        self.queued.push_back(Transmit::Rtp(packet.as_bytes().to_vec()));
    }

    pub fn send_rtcp(&mut self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        self.queued.push_back(Transmit::Rtcp(bytes));
    }

    /// Next datagram to put on the wire, when there is one.
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.queued.pop_front()
    }

    pub fn dump(&self) -> Value {
        json!({
            "transportId": self.id,
            "dtlsParametersSet": self.remote_dtls_parameters.is_some(),
            "queuedPackets": self.queued.len(),
        })
    }
}
