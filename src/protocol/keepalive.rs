//! Layer 4: keepalive.
//!
//! Echo requests carry `id(u64 LE) | timestamp(u64 LE)`. A request is sent once no
//! inbound traffic was seen for the echo interval; responses are matched against the
//! oldest pending id. A request left unanswered for the client idle timeout is fatal.
//!
//! [`Keepalive`] takes explicit instants so the timing logic is testable without a
//! runtime; the pipeline drives it from its timer stage.

use crate::error::{ProtocolError, Result};
use crate::protocol::csp::CspPayload;
use crate::protocol::session::{InboundMessage, OutboundL3Message, OutboundMessage};
use crate::protocol::wire::read_u64;
use crate::utils::metrics::Metrics;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

#[derive(Debug)]
pub struct Keepalive {
    interval: Duration,
    timeout: Duration,
    next_id: u64,
    pending: VecDeque<(u64, Instant)>,
    last_inbound: Instant,
}

impl Keepalive {
    pub fn new(interval: Duration, timeout: Duration, now: Instant) -> Self {
        Self {
            interval,
            timeout,
            next_id: 0,
            pending: VecDeque::new(),
            last_inbound: now,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn on_inbound_activity(&mut self, now: Instant) {
        self.last_inbound = now;
    }

    /// Echo request data if the connection has been idle for the interval
    ///
    /// Only one request is outstanding at a time.
    pub fn poll_echo(&mut self, now: Instant, unix_millis: u64) -> Option<Bytes> {
        if !self.pending.is_empty() || now.duration_since(self.last_inbound) < self.interval {
            return None;
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.pending.push_back((id, now));

        let mut data = BytesMut::with_capacity(16);
        data.put_u64_le(id);
        data.put_u64_le(unix_millis);
        trace!(id, "Sending echo request");
        Some(data.freeze())
    }

    /// Match an echo response and return the round trip time
    ///
    /// Responses to unknown ids are ignored.
    pub fn on_echo_response(&mut self, data: &[u8], now: Instant) -> Result<Option<Duration>> {
        let mut buf = data;
        let id = read_u64(&mut buf)?;
        match self.pending.front() {
            Some((expected, sent_at)) if *expected == id => {
                let rtt = now.duration_since(*sent_at);
                self.pending.pop_front();
                debug!(id, rtt_ms = rtt.as_millis() as u64, "Echo response");
                Ok(Some(rtt))
            }
            _ => {
                warn!(id, "Echo response without matching request");
                Ok(None)
            }
        }
    }

    pub fn check_timeout(&self, now: Instant) -> Result<()> {
        match self.pending.front() {
            Some((_, sent_at)) if now.duration_since(*sent_at) >= self.timeout => {
                Err(ProtocolError::EchoTimeout(self.timeout))
            }
            _ => Ok(()),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

pub type SharedKeepalive = Arc<Mutex<Keepalive>>;

/// Inbound side of layer 4
pub struct KeepaliveDecoder {
    keepalive: SharedKeepalive,
    metrics: Arc<Metrics>,
}

impl KeepaliveDecoder {
    pub fn new(keepalive: SharedKeepalive, metrics: Arc<Metrics>) -> Self {
        Self { keepalive, metrics }
    }

    /// Consume keepalive traffic; everything else passes through
    pub fn decode(
        &mut self,
        message: InboundMessage,
        replies: &mut Vec<OutboundL3Message>,
    ) -> Result<Option<InboundMessage>> {
        let now = Instant::now();
        let mut keepalive = self.keepalive.lock().unwrap_or_else(PoisonError::into_inner);
        keepalive.on_inbound_activity(now);
        match message {
            InboundMessage::Csp(CspPayload::EchoRequest(data)) => {
                trace!("Answering echo request");
                replies.push(OutboundL3Message::Message(OutboundMessage::Csp(
                    CspPayload::EchoResponse(data),
                )));
                Ok(None)
            }
            InboundMessage::Csp(CspPayload::EchoResponse(data)) => {
                if let Some(rtt) = keepalive.on_echo_response(&data, now)? {
                    self.metrics.echo_response(rtt);
                }
                Ok(None)
            }
            other => Ok(Some(other)),
        }
    }
}
