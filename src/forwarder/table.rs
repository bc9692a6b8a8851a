//! Longest-prefix-match forwarding table.

use crate::addr::{OverlayAddr, Prefix};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

/// The forwarding table shared between the forwarder (lookups on the data
/// plane) and the router handle (route installs on the control plane).
pub type SharedTable = Arc<Mutex<ForwardingTable>>;

/// An ordered sequence of `(prefix, link)` entries kept in descending
/// prefix-length order, so the first matching entry is the longest match.
///
/// A permanent default entry `0.0.0.0/0 -> link 0` is installed at
/// construction and never removed, so every address has a lookup answer.
#[derive(Debug, Clone)]
pub struct ForwardingTable {
    entries: Vec<(Prefix, usize)>,
}

impl ForwardingTable {
    pub fn new() -> Self {
        let default = Prefix::new(OverlayAddr::from_bits(0), 0);
        Self {
            entries: vec![(default, 0)],
        }
    }

    /// Install or update a route.
    ///
    /// If an entry with the same prefix exists its link is replaced;
    /// otherwise the new entry is inserted just before the first entry
    /// with a strictly shorter prefix, preserving descending-length order.
    /// Idempotent: repeating a call leaves the table unchanged.
    pub fn add_route(&mut self, prefix: Prefix, link: usize) {
        for i in 0..self.entries.len() {
            if self.entries[i].0 == prefix {
                self.entries[i].1 = link;
                return;
            }
            if self.entries[i].0.len() < prefix.len() {
                self.entries.insert(i, (prefix, link));
                return;
            }
        }
        self.entries.push((prefix, link));
    }

    /// Longest-prefix-match lookup.
    ///
    /// Returns `None` only if no entry matches, which cannot happen while
    /// the default route is installed; callers keep a defensive drop arm
    /// for it anyway.
    pub fn lookup(&self, ip: OverlayAddr) -> Option<usize> {
        self.entries
            .iter()
            .find(|(prefix, _)| prefix.matches(ip))
            .map(|&(_, link)| link)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Prefix, usize)> {
        self.entries.iter()
    }

    /// Render the table for debug output.
    pub fn format(&self, now: f64) -> String {
        let mut s = format!("Forwarding table ({:.3})\n", now);
        for (prefix, link) in &self.entries {
            let _ = writeln!(s, "{} {}", prefix, link);
        }
        s
    }
}

impl Default for ForwardingTable {
    fn default() -> Self {
        Self::new()
    }
}
