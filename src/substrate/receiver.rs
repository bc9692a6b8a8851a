//! Substrate ingress: datagram decode and link demultiplexing.

use super::{should_trace, SubstrateError, RECEIVER_GRACE_SECS};
use crate::config::NeighborInfo;
use crate::packet::{Packet, Protocol, WireError};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, info};

/// Socket receive timeout; expiry just re-checks the watermark.
const SOCKET_TIMEOUT: Duration = Duration::from_millis(100);

/// Receive buffer, sized with headroom over the 1400-byte packet cap so an
/// oversized datagram is read whole and rejected rather than truncated.
const RECV_BUF_LEN: usize = 2000;

/// The ingress half of the substrate.
///
/// Receives datagrams on the shared socket, decodes them, recovers the
/// link index from the source host address and queues the packet for the
/// forwarder. A full queue drops silently; a datagram from a host that is
/// not a configured neighbor is fatal.
pub(super) struct Receiver {
    sock: Arc<UdpSocket>,
    neighbors: Vec<NeighborInfo>,
    debug: u8,
    rcv: mpsc::Sender<(Packet, usize)>,
}

impl Receiver {
    pub(super) fn new(
        sock: Arc<UdpSocket>,
        neighbors: Vec<NeighborInfo>,
        debug: u8,
        rcv: mpsc::Sender<(Packet, usize)>,
    ) -> Self {
        Self {
            sock,
            neighbors,
            debug,
            rcv,
        }
    }

    pub(super) async fn run(self) -> Result<(), SubstrateError> {
        let t0 = Instant::now();
        let mut buf = [0u8; RECV_BUF_LEN];
        let mut last_data: Option<Instant> = None;

        debug!("substrate receiver started");

        loop {
            // quiet-network watermark: quit once data traffic has stopped
            if let Some(t) = last_data {
                if t.elapsed().as_secs_f64() >= RECEIVER_GRACE_SECS {
                    break;
                }
            }

            let (len, from) = match timeout(SOCKET_TIMEOUT, self.sock.recv_from(&mut buf)).await
            {
                Err(_) => continue, // timeout: re-check termination, retry
                Ok(Err(e)) => return Err(SubstrateError::Recv(e)),
                Ok(Ok(received)) => received,
            };

            let packet = match Packet::decode(&buf[..len]) {
                Ok(p) => p,
                Err(e @ (WireError::TooShort { .. } | WireError::TooLong { .. })) => {
                    return Err(SubstrateError::Decode(e));
                }
                Err(e) => {
                    debug!(from = %from, error = %e, "dropping undecodable datagram");
                    continue;
                }
            };

            let Some(link) = self
                .neighbors
                .iter()
                .position(|n| n.host_ip == from.ip())
            else {
                return Err(SubstrateError::UnknownSource(from.ip()));
            };

            if packet.protocol == Protocol::Data {
                last_data = Some(Instant::now());
            }
            if should_trace(self.debug, &packet) {
                info!(
                    link,
                    from = %from,
                    at = t0.elapsed().as_secs_f64(),
                    "received\n{}",
                    packet
                );
            }

            // a full receive queue drops the packet silently
            let _ = self.rcv.try_send((packet, link));
        }

        debug!("substrate receiver stopped");
        Ok(())
    }
}
