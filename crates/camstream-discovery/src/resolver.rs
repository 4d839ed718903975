use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use camstream_core::{
    service_type_matches, FrameFormat, RawAdvertisement, ResolutionError, ResolvedEndpoint, ServiceEvent,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Browser, ServiceFilter};

/// Filtering, deduplicating front end over a [`Browser`] backend.
///
/// - events for other service types or names never leave [`Resolver::start_browsing`];
/// - a given advertisement is resolved at most once at a time
///   ([`ResolutionError::InFlight`] for the second caller);
/// - each resolution is bounded by a deadline.
pub struct Resolver<B: Browser> {
    backend: B,
    filter: ServiceFilter,
    timeout: Duration,
    expected_grid: Option<FrameFormat>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    forward: Mutex<Option<JoinHandle<()>>>,
}

impl<B: Browser> Resolver<B> {
    pub fn new(backend: B, filter: ServiceFilter, timeout: Duration) -> Self {
        Self {
            backend,
            filter,
            timeout,
            expected_grid: None,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            forward: Mutex::new(None),
        }
    }

    /// Reject advertisements whose `grid` TXT entry disagrees with `grid`.
    pub fn with_expected_grid(mut self, grid: FrameFormat) -> Self {
        self.expected_grid = Some(grid);
        self
    }

    /// Start (or restart) browsing. Only events accepted by the filter come out.
    pub async fn start_browsing(&self) -> Result<mpsc::Receiver<ServiceEvent>, ResolutionError> {
        self.abort_forward();
        let mut raw_rx = self.backend.start_browsing(&self.filter.service_type).await?;
        let (tx, rx) = mpsc::channel(16);
        let filter = self.filter.clone();

        let task = tokio::spawn(async move {
            while let Some(event) = raw_rx.recv().await {
                if !filter.accepts(&event) {
                    continue;
                }
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        *self.forward.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        info!("[Discovery] browsing for '{}' ({})", self.filter.name, self.filter.service_type);
        Ok(rx)
    }

    pub fn stop_browsing(&self) {
        self.abort_forward();
        self.backend.stop_browsing();
    }

    fn abort_forward(&self) {
        if let Some(task) = self.forward.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }

    /// Resolve one browse result. Dropping the returned future cancels the
    /// resolution and releases the in-flight slot.
    pub async fn resolve(&self, raw: &RawAdvertisement) -> Result<ResolvedEndpoint, ResolutionError> {
        if !service_type_matches(&self.filter.service_type, &raw.service_type) {
            warn!("[Discovery] refusing to resolve '{}' of type {}", raw.name, raw.service_type);
            return Err(ResolutionError::Malformed {
                name: raw.name.clone(),
                reason: format!("unexpected service type {}", raw.service_type),
            });
        }
        self.check_grid(raw)?;

        let _guard = InFlightGuard::acquire(&self.in_flight, &raw.fullname)
            .ok_or_else(|| ResolutionError::InFlight { name: raw.name.clone() })?;

        let endpoint = tokio::time::timeout(self.timeout, self.backend.resolve(raw))
            .await
            .map_err(|_| ResolutionError::Timeout {
                name: raw.name.clone(),
                ms: self.timeout.as_millis() as u64,
            })??;

        debug!("[Discovery] resolved {}", endpoint);
        Ok(endpoint)
    }

    fn check_grid(&self, raw: &RawAdvertisement) -> Result<(), ResolutionError> {
        let (Some(expected), Some(advertised)) = (self.expected_grid, raw.grid.as_deref()) else {
            return Ok(());
        };
        match FrameFormat::parse(advertised) {
            Some(grid) if grid == expected => Ok(()),
            _ => Err(ResolutionError::Malformed {
                name: raw.name.clone(),
                reason: format!("grid {advertised}, expected {expected}"),
            }),
        }
    }
}

impl<B: Browser> Drop for Resolver<B> {
    fn drop(&mut self) {
        self.stop_browsing();
    }
}

/// Holds a fullname in the in-flight set for as long as it lives.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl InFlightGuard {
    fn acquire(set: &Arc<Mutex<HashSet<String>>>, key: &str) -> Option<Self> {
        let inserted = set.lock().unwrap_or_else(PoisonError::into_inner).insert(key.to_owned());
        inserted.then(|| Self { set: Arc::clone(set), key: key.to_owned() })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.key);
    }
}
