//! Substrate egress: delayed release of queued packets onto the wire.

use super::{should_trace, SubstrateError, SENDER_GRACE_SECS};
use crate::config::NeighborInfo;
use crate::packet::{Packet, Protocol};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

/// How much a link's delay drifts per adjustment, scaled by (link+1)^3.
const DELAY_DRIFT: f64 = 0.002;

/// Absolute delay beyond which the sign is flipped.
const DELAY_FLIP_THRESHOLD: f64 = 0.5;

/// Probability of a spontaneous sign flip at each adjustment.
const DELAY_FLIP_CHANCE: f64 = 0.02;

/// The egress half of the substrate.
///
/// One FIFO queue per link. A queued packet becomes releasable once the
/// link's emulated delay has elapsed from its enqueue time; it is then
/// serialized and sent on the shared socket to the neighbor's host.
pub(super) struct Sender {
    sock: Arc<UdpSocket>,
    neighbors: Vec<NeighborInfo>,
    port: u16,
    static_delay: bool,
    debug: u8,
    queues: Vec<mpsc::Receiver<(Packet, Instant)>>,
}

impl Sender {
    pub(super) fn new(
        sock: Arc<UdpSocket>,
        neighbors: Vec<NeighborInfo>,
        port: u16,
        static_delay: bool,
        debug: u8,
        queues: Vec<mpsc::Receiver<(Packet, Instant)>>,
    ) -> Self {
        Self {
            sock,
            neighbors,
            port,
            static_delay,
            debug,
            queues,
        }
    }

    pub(super) async fn run(mut self) -> Result<(), SubstrateError> {
        let t0 = Instant::now();
        let links = self.queues.len();

        // Head-of-queue slot per link; a popped packet waits here until
        // its release time.
        let mut heads: Vec<Option<(Packet, Instant)>> = (0..links).map(|_| None).collect();
        let mut delays: Vec<f64> = self.neighbors.iter().map(|n| n.delay).collect();
        let mut adjust_at = 0.1;
        let mut last_data: Option<Instant> = None;

        debug!(links, "substrate sender started");

        loop {
            // quiet-network watermark: quit once data traffic has stopped
            if let Some(t) = last_data {
                if t.elapsed().as_secs_f64() >= SENDER_GRACE_SECS {
                    break;
                }
            }

            let now = t0.elapsed().as_secs_f64();
            let mut idle = true;

            for link in 0..links {
                if heads[link].is_none() {
                    heads[link] = self.queues[link].try_recv().ok();
                }
                let releasable = matches!(
                    &heads[link],
                    Some((_, enqueued)) if enqueued.elapsed().as_secs_f64() >= delays[link].abs()
                );
                if !releasable {
                    continue;
                }
                let Some((packet, _)) = heads[link].take() else {
                    continue;
                };

                let buf = packet.encode().map_err(SubstrateError::Encode)?;
                if should_trace(self.debug, &packet) {
                    info!(
                        link,
                        to = %self.neighbors[link].host_ip,
                        at = now,
                        "sending\n{}",
                        packet
                    );
                }
                self.sock
                    .send_to(&buf, (self.neighbors[link].host_ip, self.port))
                    .await
                    .map_err(SubstrateError::Send)?;

                if packet.protocol == Protocol::Data {
                    last_data = Some(Instant::now());
                }
                idle = false;
            }

            // drift the link delays once per second
            if !self.static_delay && now > adjust_at {
                for (i, delay) in delays.iter_mut().enumerate() {
                    *delay += DELAY_DRIFT * ((i + 1) as f64).powi(3);
                    if delay.abs() > DELAY_FLIP_THRESHOLD
                        || rand::random::<f64>() < DELAY_FLIP_CHANCE
                    {
                        *delay = -*delay;
                    }
                }
                adjust_at += 1.0;
                idle = false;
            }

            if idle {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }

        debug!("substrate sender stopped");
        Ok(())
    }
}
