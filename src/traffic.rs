//! Test traffic source and sink.
//!
//! Generates timestamped ping payloads of random length to random
//! configured destinations, echoes pings received from others, and keeps
//! per-destination round-trip delay statistics that are logged when the
//! component stops.

use crate::addr::OverlayAddr;
use crate::forwarder::AppHandle;
use rand::Rng;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Per-destination one-way delay statistics.
#[derive(Debug, Clone)]
struct DelayStats {
    count: u64,
    total: f64,
    min: f64,
    max: f64,
}

impl DelayStats {
    fn new() -> Self {
        Self {
            count: 0,
            total: 0.0,
            min: 10.0,
            max: 0.0,
        }
    }

    fn record(&mut self, delay: f64) {
        self.count += 1;
        self.total += delay;
        self.min = self.min.min(delay);
        self.max = self.max.max(delay);
    }
}

/// The traffic component. Uses only the application plane of the
/// forwarder: `send`, `receive`, `ready`, `incoming`.
pub struct Traffic {
    core: Option<TrafficCore>,
    task: Option<JoinHandle<()>>,
    quit: Arc<AtomicBool>,
}

impl Traffic {
    /// `delta` is the interval between generated packets in seconds,
    /// `run_length` how long generation lasts once it starts.
    pub fn new(
        delta: f64,
        run_length: f64,
        app: AppHandle,
        destinations: Vec<OverlayAddr>,
    ) -> Self {
        Self {
            core: Some(TrafficCore {
                delta,
                run_length,
                app,
                destinations,
            }),
            task: None,
            quit: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the traffic loop.
    pub fn start(&mut self) {
        if let Some(core) = self.core.take() {
            let quit = self.quit.clone();
            self.task = Some(tokio::spawn(core.run(quit)));
        }
    }

    /// Signal the loop to quit and wait for it; the loop logs its delay
    /// statistics on the way out.
    pub async fn stop(&mut self) {
        self.quit.store(true, Ordering::Relaxed);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

struct TrafficCore {
    delta: f64,
    run_length: f64,
    app: AppHandle,
    destinations: Vec<OverlayAddr>,
}

impl TrafficCore {
    async fn run(mut self, quit: Arc<AtomicBool>) {
        let t0 = Instant::now();
        let mut next = 1.0;
        let stop_time = next + self.run_length;

        // filler text the random payload slices are cut from
        let mut filler = String::from("supercalifragisticexpialidocious");
        for _ in 0..4 {
            let doubled = filler.clone();
            filler.push_str(&doubled);
        }

        let mut stats: HashMap<String, DelayStats> = HashMap::new();

        while !quit.load(Ordering::Relaxed) {
            let now = t0.elapsed().as_secs_f64();

            if self.app.incoming() {
                let Some((payload, src)) = self.app.receive().await else {
                    break;
                };
                self.handle_payload(&payload, &src, now, &mut stats);
            } else if now > next
                && now < stop_time
                && self.delta > 0.0
                && !self.destinations.is_empty()
                && self.app.ready()
            {
                let (payload, dest) = self.next_ping(now, &filler);
                if let Err(e) = self.app.send(&payload, &dest) {
                    debug!(dest = %dest, error = %e, "could not queue ping");
                }
                next += self.delta;
            } else {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }

        info!("\n{}", format_stats(&stats));
    }

    /// Echo pings; fold ping replies into the delay statistics.
    fn handle_payload(
        &self,
        payload: &str,
        src: &str,
        now: f64,
        stats: &mut HashMap<String, DelayStats>,
    ) {
        match payload.split_once(':') {
            Some(("ping", rest)) => {
                let reply = format!("ping reply:{rest}");
                if let Err(e) = self.app.send(&reply, src) {
                    debug!(dest = %src, error = %e, "could not queue ping reply");
                }
            }
            Some((_, rest)) => {
                // a reply to one of our pings: first line is our timestamp
                let sent_at: Option<f64> =
                    rest.lines().next().and_then(|l| l.trim().parse().ok());
                match sent_at {
                    Some(sent_at) => {
                        let delay = (now - sent_at) / 2.0;
                        stats
                            .entry(src.to_string())
                            .or_insert_with(DelayStats::new)
                            .record(delay);
                    }
                    None => debug!(src, "ignoring unparseable ping reply"),
                }
            }
            None => debug!(src, "ignoring unrecognized payload"),
        }
    }

    /// Build a timestamped ping of random length for a random destination.
    fn next_ping(&self, now: f64, filler: &str) -> (String, String) {
        let mut rng = rand::thread_rng();
        let i = rng.gen_range(0..filler.len());
        let j = (i + 1) + rng.gen_range(0..filler.len() - i);
        let payload = format!("ping: {now}\n{}\n", &filler[i..j]);
        let dest = self.destinations[rng.gen_range(0..self.destinations.len())];
        (payload, dest.to_string())
    }
}

fn format_stats(stats: &HashMap<String, DelayStats>) -> String {
    let mut s = format!(
        "Traffic delay statistics\n{:>8} {:>8} {:>8} {:>8} {:>8}\n",
        "destIp", "count", "avgDelay", "minDelay", "maxDelay"
    );
    for (dest, stat) in stats {
        if stat.count == 0 {
            continue;
        }
        let _ = writeln!(
            s,
            "{:>8} {:>8} {:>8.3} {:>8.3} {:>8.3}",
            dest,
            stat.count,
            stat.total / stat.count as f64,
            stat.min,
            stat.max
        );
    }
    s
}
