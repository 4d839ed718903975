//! Advertisements the consumer could connect to, with a cooldown on the ones
//! that just failed.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use camstream_core::{service_type_matches, RawAdvertisement, ServiceEvent};
use tokio::time::Instant;
use tracing::{debug, info};

pub(crate) struct Candidates {
    cooldown: Duration,
    /// fullname → latest record seen for it
    live: BTreeMap<String, RawAdvertisement>,
    /// fullname → instant it may be tried again
    failed: HashMap<String, Instant>,
}

impl Candidates {
    pub(crate) fn new(cooldown: Duration) -> Self {
        Self { cooldown, live: BTreeMap::new(), failed: HashMap::new() }
    }

    /// Fold one browse event in.
    ///
    /// A `Found` carrying a different address or port than the record that
    /// failed counts as a new producer and lifts the cooldown; so does a `Lost`.
    pub(crate) fn observe(&mut self, event: ServiceEvent) {
        match event {
            ServiceEvent::Found(raw) => {
                let changed = match self.live.get(&raw.fullname) {
                    Some(prev) => prev.port != raw.port || prev.addresses != raw.addresses,
                    None => true,
                };
                if changed {
                    info!("[Consumer] found '{}' ({}:{})", raw.name, raw.hostname, raw.port);
                    self.failed.remove(&raw.fullname);
                }
                self.live.insert(raw.fullname.clone(), raw);
            }
            ServiceEvent::Lost { name, service_type } => {
                let gone: Vec<String> = self
                    .live
                    .values()
                    .filter(|r| r.name == name && service_type_matches(&service_type, &r.service_type))
                    .map(|r| r.fullname.clone())
                    .collect();
                for fullname in gone {
                    debug!("[Consumer] '{}' gone", name);
                    self.live.remove(&fullname);
                    self.failed.remove(&fullname);
                }
            }
        }
    }

    /// First live advertisement that is not cooling down.
    pub(crate) fn pick(&mut self, now: Instant) -> Option<RawAdvertisement> {
        self.failed.retain(|_, until| *until > now);
        self.live
            .values()
            .find(|r| !self.failed.contains_key(&r.fullname))
            .cloned()
    }

    pub(crate) fn mark_failed(&mut self, fullname: &str, now: Instant) {
        self.failed.insert(fullname.to_owned(), now + self.cooldown);
    }

    /// When the earliest cooldown on a live advertisement runs out.
    pub(crate) fn next_retry(&self) -> Option<Instant> {
        self.live
            .keys()
            .filter_map(|fullname| self.failed.get(fullname))
            .min()
            .copied()
    }

    /// Drop every record but keep the cooldowns; a restarted browse replays
    /// whatever is still out there.
    pub(crate) fn forget_records(&mut self) {
        self.live.clear();
    }
}
