//! Emulated link layer.
//!
//! The substrate carries overlay packets between neighboring routers over
//! UDP, delaying each outgoing packet by a per-link amount to emulate link
//! delays in a real network. A single datagram socket is shared by two
//! tasks: the [`sender`] releases queued packets once their link delay has
//! elapsed, the [`receiver`] decodes arriving datagrams and maps the
//! source host back to a link index.
//!
//! Both tasks watch a watermark, the last time an application data packet
//! passed through, and exit once the network has been quiet for a grace
//! window. That is how a test run winds down.

mod receiver;
mod sender;

use crate::config::NeighborInfo;
use crate::packet::{Packet, Protocol, WireError};
use crate::QUEUE_CAPACITY;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// UDP port the overlay runs on.
pub const OVERLAY_PORT: u16 = 31313;

/// Sender exits after this long without seeing a data packet.
const SENDER_GRACE_SECS: f64 = 3.0;

/// Receiver exits after this long without seeing a data packet.
const RECEIVER_GRACE_SECS: f64 = 5.0;

/// Errors that terminate a substrate task. All of them are fatal for the
/// process; there is no in-band error channel to peers.
#[derive(Debug, Error)]
pub enum SubstrateError {
    #[error("cannot create socket on {host}:{port}: {source}")]
    Bind {
        host: IpAddr,
        port: u16,
        source: std::io::Error,
    },

    #[error("socket receive failed: {0}")]
    Recv(#[source] std::io::Error),

    #[error("socket send failed: {0}")]
    Send(#[source] std::io::Error),

    #[error("datagram arrived from non-neighbor host {0}")]
    UnknownSource(IpAddr),

    #[error("cannot encode outgoing packet: {0}")]
    Encode(#[source] WireError),

    #[error("cannot decode incoming datagram: {0}")]
    Decode(#[source] WireError),

    #[error("substrate task failed: {0}")]
    Task(String),
}

/// The forwarder's view of the substrate: per-link egress queues and a
/// single ingress queue.
pub struct SubstrateHandle {
    pub(crate) egress: Vec<mpsc::Sender<(Packet, Instant)>>,
    pub(crate) ingress: mpsc::Receiver<(Packet, usize)>,
}

impl SubstrateHandle {
    /// Queue a packet for transmission on a link.
    ///
    /// The enqueue time is recorded here; the sender task releases the
    /// packet once the link's emulated delay has elapsed from it. Blocks
    /// on queue capacity. A packet for a nonexistent link is dropped.
    pub async fn send(&self, packet: Packet, link: usize) {
        let Some(queue) = self.egress.get(link) else {
            return;
        };
        let _ = queue.send((packet, Instant::now())).await;
    }

    /// True if the link can accept another packet without blocking.
    /// False for a nonexistent link.
    pub fn ready(&self, link: usize) -> bool {
        self.egress.get(link).is_some_and(|q| q.capacity() > 0)
    }

    /// Wait for the next incoming packet and the link it arrived on.
    /// Returns `None` once the receiver task has exited.
    pub async fn receive(&mut self) -> Option<(Packet, usize)> {
        self.ingress.recv().await
    }

    /// True if an incoming packet is waiting.
    pub fn incoming(&self) -> bool {
        !self.ingress.is_empty()
    }
}

/// The substrate component: owns the shared socket and the two link-layer
/// tasks.
pub struct Substrate {
    host_ip: IpAddr,
    port: u16,
    neighbors: Vec<NeighborInfo>,
    static_delay: bool,
    debug: u8,
    sender_task: Option<JoinHandle<Result<(), SubstrateError>>>,
    receiver_task: Option<JoinHandle<Result<(), SubstrateError>>>,
}

impl Substrate {
    /// Create a substrate on the standard overlay port.
    pub fn new(
        host_ip: IpAddr,
        neighbors: Vec<NeighborInfo>,
        static_delay: bool,
        debug: u8,
    ) -> Self {
        Self::with_port(host_ip, neighbors, static_delay, debug, OVERLAY_PORT)
    }

    /// Create a substrate on a specific port. All routers in an overlay
    /// must use the same port; this mainly supports tests.
    pub fn with_port(
        host_ip: IpAddr,
        neighbors: Vec<NeighborInfo>,
        static_delay: bool,
        debug: u8,
        port: u16,
    ) -> Self {
        Self {
            host_ip,
            port,
            neighbors,
            static_delay,
            debug,
            sender_task: None,
            receiver_task: None,
        }
    }

    /// Bind the socket and spawn the sender and receiver tasks, returning
    /// the handle the forwarder drives.
    pub async fn start(&mut self) -> Result<SubstrateHandle, SubstrateError> {
        let sock = UdpSocket::bind((self.host_ip, self.port))
            .await
            .map_err(|source| SubstrateError::Bind {
                host: self.host_ip,
                port: self.port,
                source,
            })?;
        let sock = Arc::new(sock);

        let mut egress_tx = Vec::with_capacity(self.neighbors.len());
        let mut egress_rx = Vec::with_capacity(self.neighbors.len());
        for _ in &self.neighbors {
            let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
            egress_tx.push(tx);
            egress_rx.push(rx);
        }
        let (ingress_tx, ingress_rx) = mpsc::channel(QUEUE_CAPACITY);

        let sender = sender::Sender::new(
            sock.clone(),
            self.neighbors.clone(),
            self.port,
            self.static_delay,
            self.debug,
            egress_rx,
        );
        let receiver =
            receiver::Receiver::new(sock, self.neighbors.clone(), self.debug, ingress_tx);

        self.sender_task = Some(tokio::spawn(sender.run()));
        self.receiver_task = Some(tokio::spawn(receiver.run()));

        Ok(SubstrateHandle {
            egress: egress_tx,
            ingress: ingress_rx,
        })
    }

    /// Wait for the substrate to wind down.
    ///
    /// Returns as soon as either task fails (fatal for the process), or
    /// once both have exited via the quiet-network watermark.
    /// The socket is released when both tasks are gone.
    pub async fn join(&mut self) -> Result<(), SubstrateError> {
        async fn flatten(
            task: Option<JoinHandle<Result<(), SubstrateError>>>,
        ) -> Result<(), SubstrateError> {
            match task {
                None => Ok(()),
                Some(handle) => match handle.await {
                    Ok(result) => result,
                    Err(e) => Err(SubstrateError::Task(e.to_string())),
                },
            }
        }

        let sender = self.sender_task.take();
        let receiver = self.receiver_task.take();
        tokio::try_join!(flatten(sender), flatten(receiver)).map(|_| ())
    }
}

/// Debug-level gate for packet tracing: 4 prints every packet, 3 every
/// control packet, 2 only advertisements.
pub(crate) fn should_trace(debug: u8, packet: &Packet) -> bool {
    debug >= 4
        || (debug == 3 && packet.protocol == Protocol::Control)
        || (debug == 2
            && packet.protocol == Protocol::Control
            && packet.payload.contains("advert"))
}
