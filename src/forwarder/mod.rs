//! Packet forwarder.
//!
//! The forwarder multiplexes three packet sources over bounded queues: the
//! substrate ingress (wire), the router (control plane) and the local
//! application (data plane). Packets addressed to this router are handed
//! to the application sink or the router inbound queue; everything else is
//! forwarded by longest-prefix match on the shared forwarding table.
//!
//! The main loop polls its sources in strict priority order (wire, then
//! router, then application) and naps for a millisecond when idle.
//! A continuously busy higher-priority source deliberately starves the
//! lower ones; every source is bounded-rate, so this is acceptable.

mod table;

pub use table::{ForwardingTable, SharedTable};

use crate::addr::{AddrError, OverlayAddr, Prefix};
use crate::packet::{Packet, Protocol};
use crate::substrate::SubstrateHandle;
use crate::QUEUE_CAPACITY;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Errors surfaced to the application plane.
#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error("outbound queue is full")]
    QueueFull,

    #[error("forwarder has shut down")]
    Closed,

    #[error(transparent)]
    BadAddress(#[from] AddrError),
}

/// Application-plane handle: send and receive payloads.
pub struct AppHandle {
    my_ip: OverlayAddr,
    from_src: mpsc::Sender<Packet>,
    to_snk: mpsc::Receiver<Packet>,
}

impl AppHandle {
    #[cfg(test)]
    pub(crate) fn from_parts(
        my_ip: OverlayAddr,
        from_src: mpsc::Sender<Packet>,
        to_snk: mpsc::Receiver<Packet>,
    ) -> Self {
        Self {
            my_ip,
            from_src,
            to_snk,
        }
    }

    /// Queue a payload for delivery to another overlay host.
    ///
    /// Builds a data packet with the default TTL and this router as the
    /// source. Fails if the outbound queue is full; callers gate on
    /// [`AppHandle::ready`].
    pub fn send(&self, payload: &str, dest: &str) -> Result<(), ForwarderError> {
        let dest: OverlayAddr = dest.parse()?;
        let packet = Packet::data(self.my_ip, dest, payload.to_string());
        self.from_src.try_send(packet).map_err(|e| match e {
            TrySendError::Full(_) => ForwarderError::QueueFull,
            TrySendError::Closed(_) => ForwarderError::Closed,
        })
    }

    /// Wait for the next payload addressed to this router.
    ///
    /// Returns the payload and the sender's overlay address in dotted-quad
    /// form, or `None` once the forwarder has shut down.
    pub async fn receive(&mut self) -> Option<(String, String)> {
        let packet = self.to_snk.recv().await?;
        Some((packet.payload, packet.src.to_string()))
    }

    /// True if a payload can be queued without hitting back-pressure.
    pub fn ready(&self) -> bool {
        self.from_src.capacity() > 0
    }

    /// True if a payload is waiting to be received.
    pub fn incoming(&self) -> bool {
        !self.to_snk.is_empty()
    }
}

/// Control-plane handle used by the router.
pub struct RouterHandle {
    pub(crate) from_rtr: mpsc::Sender<(Packet, usize)>,
    pub(crate) to_rtr: mpsc::Receiver<(Packet, usize)>,
    pub(crate) table: SharedTable,
    pub(crate) debug: u8,
    pub(crate) t0: Instant,
}

impl RouterHandle {
    /// Queue a protocol packet for transmission on a specific link.
    ///
    /// Blocks on queue capacity, preserving the back-pressure the original
    /// busy-wait provided.
    pub async fn send_pkt(&self, packet: Packet, link: usize) {
        if self.debug > 2 {
            info!(link, "router sends\n{}", packet);
        }
        if self.from_rtr.send((packet, link)).await.is_err() {
            debug!(link, "forwarder gone, dropping outbound protocol packet");
        }
    }

    /// Wait for the next protocol packet, with the link it arrived on.
    pub async fn recv_pkt(&mut self) -> Option<(Packet, usize)> {
        self.to_rtr.recv().await
    }

    /// True if a protocol packet can be queued without blocking.
    pub fn ready4pkt(&self) -> bool {
        self.from_rtr.capacity() > 0
    }

    /// True if a protocol packet is waiting.
    pub fn incoming_pkt(&self) -> bool {
        !self.to_rtr.is_empty()
    }

    /// Install or update a forwarding-table route. Idempotent.
    pub fn add_route(&self, prefix: Prefix, link: usize) {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.add_route(prefix, link);
        if self.debug > 0 {
            info!("\n{}", table.format(self.t0.elapsed().as_secs_f64()));
        }
    }
}

/// The forwarder component. Created with [`Forwarder::new`], run with
/// [`Forwarder::start`], shut down with [`Forwarder::stop`].
pub struct Forwarder {
    core: Option<ForwarderCore>,
    task: Option<JoinHandle<()>>,
    quit: Arc<AtomicBool>,
    table: SharedTable,
    t0: Instant,
}

impl Forwarder {
    /// Create a forwarder bound to a substrate, returning the two plane
    /// handles its clients use.
    pub fn new(
        my_ip: OverlayAddr,
        sub: SubstrateHandle,
        debug: u8,
    ) -> (Self, AppHandle, RouterHandle) {
        let (from_src_tx, from_src_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (to_snk_tx, to_snk_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (from_rtr_tx, from_rtr_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (to_rtr_tx, to_rtr_rx) = mpsc::channel(QUEUE_CAPACITY);

        let table: SharedTable = Arc::new(Mutex::new(ForwardingTable::new()));
        let t0 = Instant::now();

        let core = ForwarderCore {
            my_ip,
            debug,
            sub,
            from_src: from_src_rx,
            from_rtr: from_rtr_rx,
            to_snk: to_snk_tx,
            to_rtr: to_rtr_tx,
            table: table.clone(),
        };

        let forwarder = Forwarder {
            core: Some(core),
            task: None,
            quit: Arc::new(AtomicBool::new(false)),
            table: table.clone(),
            t0,
        };

        let app = AppHandle {
            my_ip,
            from_src: from_src_tx,
            to_snk: to_snk_rx,
        };

        let router = RouterHandle {
            from_rtr: from_rtr_tx,
            to_rtr: to_rtr_rx,
            table,
            debug,
            t0,
        };

        (forwarder, app, router)
    }

    /// Spawn the forwarding loop.
    pub fn start(&mut self) {
        if let Some(core) = self.core.take() {
            let quit = self.quit.clone();
            self.task = Some(tokio::spawn(core.run(quit)));
        }
    }

    /// Signal the loop to quit and wait for it to finish.
    pub async fn stop(&mut self) {
        self.quit.store(true, Ordering::Relaxed);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Render the forwarding table for the final report.
    pub fn format_table(&self) -> String {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .format(self.t0.elapsed().as_secs_f64())
    }
}

/// State owned by the forwarding loop.
struct ForwarderCore {
    my_ip: OverlayAddr,
    debug: u8,
    sub: SubstrateHandle,
    from_src: mpsc::Receiver<Packet>,
    from_rtr: mpsc::Receiver<(Packet, usize)>,
    to_snk: mpsc::Sender<Packet>,
    to_rtr: mpsc::Sender<(Packet, usize)>,
    table: SharedTable,
}

impl ForwarderCore {
    async fn run(mut self, quit: Arc<AtomicBool>) {
        debug!(my_ip = %self.my_ip, "forwarder started");

        while !quit.load(Ordering::Relaxed) {
            // 1: a packet arrived from the wire
            if self.sub.incoming() {
                if let Some((packet, in_link)) = self.sub.receive().await {
                    self.dispatch(packet, in_link).await;
                }
            }
            // 2: the router has a packet to send
            else if let Ok((packet, link)) = self.from_rtr.try_recv() {
                self.sub.send(packet, link).await;
            }
            // 3: the application has a payload to send
            else if let Ok(packet) = self.from_src.try_recv() {
                match self.lookup(packet.dest) {
                    Some(link) => self.sub.send(packet, link).await,
                    // unreachable while the default route is installed
                    None => debug!(dest = %packet.dest, "no route, dropping"),
                }
            }
            // nothing to do, take a nap
            else {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }

        debug!(my_ip = %self.my_ip, "forwarder stopped");
    }

    /// Deliver or forward one packet from the wire.
    async fn dispatch(&mut self, mut packet: Packet, in_link: usize) {
        if packet.dest == self.my_ip {
            match packet.protocol {
                Protocol::Data => {
                    if self.to_snk.send(packet).await.is_err() {
                        debug!("application sink gone, dropping packet");
                    }
                }
                Protocol::Control => {
                    if self.to_rtr.send((packet, in_link)).await.is_err() {
                        debug!("router gone, dropping protocol packet");
                    }
                }
            }
            return;
        }

        // transit traffic
        packet.ttl = packet.ttl.saturating_sub(1);
        if packet.ttl == 0 {
            if self.debug > 3 {
                info!(src = %packet.src, dest = %packet.dest, "ttl expired, dropping");
            }
            return;
        }
        match self.lookup(packet.dest) {
            Some(link) => self.sub.send(packet, link).await,
            // unreachable while the default route is installed
            None => debug!(dest = %packet.dest, "no route for transit packet, dropping"),
        }
    }

    fn lookup(&self, ip: OverlayAddr) -> Option<usize> {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .lookup(ip)
    }
}
