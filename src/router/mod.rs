//! Path-vector routing engine.
//!
//! The router drives two wall-clock timers, a hello probe every second
//! and a full prefix advertisement every ten, and processes inbound
//! protocol packets delivered by the forwarder. Neighbor liveness is a
//! countdown: three unanswered hello rounds take a link down, at which
//! point every route using it is marked invalid (and, when enabled, a
//! link-failure advertisement is flooded).
//!
//! Received advertisements extend the path vector through this router,
//! are dropped on loops (our own address in the path) and on dead links,
//! and are re-advertised with split horizon: never back to the neighbor
//! they came from. The forwarding table is kept in sync whenever a
//! route's outgoing link changes.

mod link;
mod route;
#[cfg(test)]
mod tests;

pub use link::{LinkInfo, EWMA_ALPHA, HELLO_STATE_UP};
pub use route::{update_route, Route, RoutingTable, IMPROVEMENT_FACTOR, STALENESS_SECS};

use crate::addr::{OverlayAddr, Prefix};
use crate::config::NeighborInfo;
use crate::forwarder::RouterHandle;
use crate::packet::Packet;
use crate::protocol::ControlMsg;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Seconds between hello rounds.
const HELLO_INTERVAL_SECS: f64 = 1.0;

/// Seconds between periodic advertisements of the local prefixes.
const ADVERT_INTERVAL_SECS: f64 = 10.0;

/// The router component. Created with [`Router::new`], run with
/// [`Router::start`], shut down with [`Router::stop`].
pub struct Router {
    core: Option<RouterCore>,
    task: Option<JoinHandle<()>>,
    quit: Arc<AtomicBool>,
}

impl Router {
    pub fn new(
        my_ip: OverlayAddr,
        fwdr: RouterHandle,
        prefixes: Vec<Prefix>,
        neighbors: &[NeighborInfo],
        debug: u8,
        en_fa: bool,
    ) -> Self {
        Self {
            core: Some(RouterCore::new(my_ip, fwdr, prefixes, neighbors, debug, en_fa)),
            task: None,
            quit: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the routing loop.
    pub fn start(&mut self) {
        if let Some(core) = self.core.take() {
            let quit = self.quit.clone();
            self.task = Some(tokio::spawn(core.run(quit)));
        }
    }

    /// Signal the loop to quit and wait for it; the loop logs its final
    /// routing table and link-cost statistics on the way out.
    pub async fn stop(&mut self) {
        self.quit.store(true, Ordering::Relaxed);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// State owned by the routing loop.
pub(crate) struct RouterCore {
    my_ip: OverlayAddr,
    fwdr: RouterHandle,
    prefixes: Vec<Prefix>,
    links: Vec<LinkInfo>,
    routes: RoutingTable,
    debug: u8,
    en_fa: bool,
    /// Seconds since the loop started; handlers read this instead of
    /// sampling the clock themselves.
    now: f64,
}

impl RouterCore {
    pub(crate) fn new(
        my_ip: OverlayAddr,
        fwdr: RouterHandle,
        prefixes: Vec<Prefix>,
        neighbors: &[NeighborInfo],
        debug: u8,
        en_fa: bool,
    ) -> Self {
        let links = neighbors
            .iter()
            .map(|n| LinkInfo::new(n.overlay_ip, n.delay))
            .collect();
        Self {
            my_ip,
            fwdr,
            prefixes,
            links,
            routes: RoutingTable::new(),
            debug,
            en_fa,
            now: 0.0,
        }
    }

    async fn run(mut self, quit: Arc<AtomicBool>) {
        let t0 = Instant::now();
        let mut hello_time = 0.0;
        let mut advert_time = 0.0;

        debug!(my_ip = %self.my_ip, links = self.links.len(), "router started");

        while !quit.load(Ordering::Relaxed) {
            self.now = t0.elapsed().as_secs_f64();

            if self.now - hello_time > HELLO_INTERVAL_SECS {
                hello_time = self.now;
                self.send_hellos().await;
            } else if self.now - advert_time > ADVERT_INTERVAL_SECS {
                advert_time = self.now;
                self.send_adverts().await;
            } else if self.fwdr.incoming_pkt() {
                self.handle_incoming().await;
            } else {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }

        info!("\n{}", self.format_table());
        info!("\n{}", self.format_link_stats());
    }

    /// Run one hello round.
    ///
    /// For each link, first settle the previous round: a missing reply
    /// counts the liveness down, and the 1 -> 0 transition invalidates
    /// every route using the link (flooding a failure advertisement when
    /// enabled). Then clear the reply flag and probe again.
    async fn send_hellos(&mut self) {
        for link in 0..self.links.len() {
            let mut routes_changed = false;

            if !self.links[link].got_reply {
                if self.links[link].hello_state == 1 {
                    routes_changed = self.routes.invalidate_out_link(link);
                }
                if self.links[link].hello_state > 0 {
                    self.links[link].hello_state -= 1;
                    if self.links[link].is_down() {
                        info!(link, peer = %self.links[link].peer_ip, "link is down");
                    }
                }
            }

            if routes_changed && self.debug > 0 {
                info!("\n{}", self.format_table());
            }
            if routes_changed && self.en_fa {
                self.send_failure_advert(link).await;
            }

            self.links[link].got_reply = false;
            let payload = ControlMsg::Hello {
                timestamp: self.now,
            }
            .to_payload();
            let packet = Packet::control(self.my_ip, self.links[link].peer_ip, payload);
            self.fwdr.send_pkt(packet, link).await;
        }
    }

    /// Advertise every local prefix on every link.
    ///
    /// The prefix originates here, so no split horizon applies and the
    /// advertised cost is zero with a path of just this router.
    async fn send_adverts(&mut self) {
        for prefix in self.prefixes.clone() {
            for link in 0..self.links.len() {
                let payload = ControlMsg::Advert {
                    prefix,
                    timestamp: self.now,
                    cost: 0.0,
                    path: vec![self.my_ip],
                }
                .to_payload();
                let packet = Packet::control(self.my_ip, self.links[link].peer_ip, payload);
                self.fwdr.send_pkt(packet, link).await;
            }
        }
    }

    /// Flood a link-failure advertisement for `failed_link` to every
    /// neighbor whose link is still up.
    async fn send_failure_advert(&mut self, failed_link: usize) {
        let failed_peer = self.links[failed_link].peer_ip;

        for link in 0..self.links.len() {
            if self.links[link].is_down() {
                continue;
            }
            let payload = ControlMsg::LinkFailure {
                from: self.my_ip,
                to: failed_peer,
                timestamp: self.now,
                path: vec![self.my_ip],
            }
            .to_payload();
            let packet = Packet::control(self.my_ip, self.links[link].peer_ip, payload);
            self.fwdr.send_pkt(packet, link).await;
        }
    }

    /// Retrieve and process one packet from the forwarder.
    async fn handle_incoming(&mut self) {
        let Some((packet, link)) = self.fwdr.recv_pkt().await else {
            return;
        };

        let msg = match ControlMsg::parse(&packet.payload) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(link, error = %e, "dropping malformed control packet");
                return;
            }
        };

        match msg {
            ControlMsg::Hello { timestamp } => {
                // echo the probe back, preserving its timestamp
                let payload = ControlMsg::HelloReply { timestamp }.to_payload();
                let reply = Packet::control(self.my_ip, packet.src, payload);
                self.fwdr.send_pkt(reply, link).await;
            }
            ControlMsg::HelloReply { timestamp } => {
                // half the round trip is our cost sample for this link
                let rtt = self.now - timestamp;
                self.links[link].record_reply(rtt / 2.0);
            }
            ControlMsg::Advert {
                prefix,
                cost,
                path,
                ..
            } => {
                self.handle_advert(prefix, cost, path, link).await;
            }
            ControlMsg::LinkFailure {
                from,
                to,
                timestamp,
                path,
            } => {
                self.handle_failure_advert(from, to, timestamp, path, link).await;
            }
        }
    }

    /// Handle a reachability advertisement received on `link`.
    async fn handle_advert(
        &mut self,
        prefix: Prefix,
        cost: f64,
        path: Vec<OverlayAddr>,
        link: usize,
    ) {
        // adverts arriving on a dead link are ignored
        if self.links[link].is_down() {
            debug!(link, %prefix, "dropping advert on a dead link");
            return;
        }
        // our own address in the path means a loop
        if path.contains(&self.my_ip) {
            debug!(link, %prefix, "dropping looped advert");
            return;
        }
        // the parser guarantees a non-empty path; its head sent the advert
        let Some(&received_from) = path.first() else {
            return;
        };

        let mut new_path = Vec::with_capacity(path.len() + 1);
        new_path.push(self.my_ip);
        new_path.extend_from_slice(&path);
        let new_cost = cost + self.links[link].cost;
        let candidate = Route {
            pfx: prefix,
            timestamp: self.now,
            cost: new_cost,
            path: new_path.clone(),
            out_link: link,
            valid: true,
        };

        let before = self
            .routes
            .lookup(&prefix)
            .map(|r| (r.path.clone(), r.out_link));
        let (table_changed, added) = match self.routes.lookup_mut(&prefix) {
            Some(rte) => (update_route(rte, &candidate), false),
            None => {
                self.routes.add(candidate);
                (true, true)
            }
        };
        let Some(installed) = self.routes.lookup(&prefix) else {
            return;
        };
        let (after_path, after_link) = (installed.path.clone(), installed.out_link);

        let path_changed = before
            .as_ref()
            .map_or(true, |(path, _)| *path != after_path);
        let out_link_changed = before
            .as_ref()
            .map_or(true, |(_, link)| *link != after_link);

        if self.debug > 0 && path_changed {
            info!("\n{}", self.format_table());
        }
        if out_link_changed || added {
            self.fwdr.add_route(prefix, link);
        }

        // propagate the extended path vector, but never back to its sender
        if table_changed || path_changed || out_link_changed {
            let payload = ControlMsg::Advert {
                prefix,
                timestamp: self.now,
                cost: new_cost,
                path: new_path,
            }
            .to_payload();
            for out in 0..self.links.len() {
                if self.links[out].peer_ip == received_from {
                    continue;
                }
                let packet =
                    Packet::control(self.my_ip, self.links[out].peer_ip, payload.clone());
                self.fwdr.send_pkt(packet, out).await;
            }
        }
    }

    /// Handle a link-failure advertisement for the adjacency `from -> to`.
    async fn handle_failure_advert(
        &mut self,
        from: OverlayAddr,
        to: OverlayAddr,
        timestamp: f64,
        path: Vec<OverlayAddr>,
        _link: usize,
    ) {
        // our own address in the path means a loop
        if path.contains(&self.my_ip) {
            debug!(%from, %to, "dropping looped failure advert");
            return;
        }
        let received_from = path.first().copied();

        let updated = self.routes.invalidate_adjacency(from, to);
        // a relayed copy carries the time we learned of the failure
        let timestamp = if updated { self.now } else { timestamp };

        if updated && self.debug > 0 {
            info!("\n{}", self.format_table());
        }
        if !updated {
            return;
        }

        let mut new_path = Vec::with_capacity(path.len() + 1);
        new_path.push(self.my_ip);
        new_path.extend_from_slice(&path);
        let payload = ControlMsg::LinkFailure {
            from,
            to,
            timestamp,
            path: new_path,
        }
        .to_payload();

        for out in 0..self.links.len() {
            if received_from == Some(self.links[out].peer_ip) {
                continue;
            }
            let packet = Packet::control(self.my_ip, self.links[out].peer_ip, payload.clone());
            self.fwdr.send_pkt(packet, out).await;
        }
    }

    /// Render the routing table for debug output and the final report.
    fn format_table(&self) -> String {
        let mut s = format!(
            "Routing table ({:.3})\n{:>10} {:>10} {:>8} {:>5} {:>10} \t path\n",
            self.now, "prefix", "timestamp", "cost", "link", "VLD/INVLD"
        );
        for route in self.routes.iter() {
            let _ = write!(
                s,
                "{:>10} {:>10.3} {:>8.3} {:>5} {:>10}",
                route.pfx.to_string(),
                route.timestamp,
                route.cost,
                route.out_link,
                if route.valid { "valid" } else { "invalid" }
            );
            for hop in &route.path {
                let _ = write!(s, " {}", hop);
            }
            if self
                .links
                .get(route.out_link)
                .is_some_and(LinkInfo::is_down)
            {
                let _ = write!(s, "\t ** disabled link");
            }
            s.push('\n');
        }
        s
    }

    /// Render the per-link cost statistics for the final report.
    fn format_link_stats(&self) -> String {
        let mut s = format!(
            "Router link cost statistics\n{:>8} {:>8} {:>8} {:>8} {:>8}\n",
            "peerIp", "count", "avgCost", "minCost", "maxCost"
        );
        for link in &self.links {
            if link.count == 0 {
                continue;
            }
            let _ = writeln!(
                s,
                "{:>8} {:>8} {:>8.3} {:>8.3} {:>8.3}",
                link.peer_ip.to_string(),
                link.count,
                link.total_cost / link.count as f64,
                link.min_cost,
                link.max_cost
            );
        }
        s
    }
}
