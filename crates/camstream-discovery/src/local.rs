use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use camstream_core::{
    normalize_service_type, RawAdvertisement, RegistrationError, ResolutionError, ResolvedEndpoint,
    ServiceAdvertisement, ServiceEvent, TXT_GRID,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{endpoint_from_raw, AdvertisementHandle, Advertiser, Browser};

const WATCHER_CAPACITY: usize = 64;

/// In-process service registry.
///
/// Implements [`Advertiser`] directly; [`LocalRegistry::browser`] hands out
/// [`Browser`]s over the same registry. Browsers get every event the registry
/// sees, whatever its type, like a noisy multicast segment would deliver;
/// filtering is left to the [`Resolver`](crate::Resolver).
#[derive(Clone, Default)]
pub struct LocalRegistry {
    inner: Arc<Mutex<Registry>>,
}

#[derive(Default)]
struct Registry {
    /// fullname → record
    services: BTreeMap<String, RawAdvertisement>,
    watchers: BTreeMap<u64, mpsc::Sender<ServiceEvent>>,
    next_watcher: u64,
    unavailable: bool,
    resolve_delay: Duration,
}

impl Registry {
    fn broadcast(&mut self, event: &ServiceEvent) {
        self.watchers.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("[Local] watcher {} full, event dropped", id);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate an unreachable daemon: advertise and browse fail while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Delay every resolve by `delay`.
    pub fn set_resolve_delay(&self, delay: Duration) {
        self.lock().resolve_delay = delay;
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.lock().services.values().any(|s| s.name == name)
    }

    pub fn registered(&self) -> Vec<RawAdvertisement> {
        self.lock().services.values().cloned().collect()
    }

    /// Push an arbitrary event to every browser, as if it arrived off the wire.
    pub fn inject(&self, event: ServiceEvent) {
        self.lock().broadcast(&event);
    }

    pub fn browser(&self) -> LocalBrowser {
        LocalBrowser { registry: self.clone(), watcher: Mutex::new(None) }
    }
}

#[async_trait]
impl Advertiser for LocalRegistry {
    async fn advertise(&self, ad: &ServiceAdvertisement) -> Result<AdvertisementHandle, RegistrationError> {
        let mut reg = self.lock();
        if reg.unavailable {
            return Err(RegistrationError::DaemonUnavailable("local registry offline".into()));
        }
        let ty = normalize_service_type(&ad.service_type);
        let fullname = format!("{}.{}", ad.name, ty);
        if reg.services.contains_key(&fullname) {
            return Err(RegistrationError::NameConflict { name: ad.name.clone() });
        }

        let raw = RawAdvertisement {
            name: ad.name.clone(),
            service_type: ty,
            fullname: fullname.clone(),
            hostname: "localhost".into(),
            addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            port: ad.port,
            grid: ad.txt.get(TXT_GRID).cloned(),
        };
        reg.services.insert(fullname.clone(), raw.clone());
        reg.broadcast(&ServiceEvent::Found(raw));

        info!("[Local] advertising '{}' on port {}", ad.name, ad.port);
        Ok(AdvertisementHandle::new(&ad.name, fullname))
    }

    fn unadvertise(&self, handle: &AdvertisementHandle) {
        if !handle.deactivate() {
            return;
        }
        let mut reg = self.lock();
        if let Some(raw) = reg.services.remove(handle.fullname()) {
            reg.broadcast(&ServiceEvent::Lost { name: raw.name, service_type: raw.service_type });
            info!("[Local] '{}' withdrawn", handle.name());
        }
    }
}

/// One browse session over a [`LocalRegistry`].
pub struct LocalBrowser {
    registry: LocalRegistry,
    watcher: Mutex<Option<u64>>,
}

#[async_trait]
impl Browser for LocalBrowser {
    async fn start_browsing(&self, _service_type: &str) -> Result<mpsc::Receiver<ServiceEvent>, ResolutionError> {
        self.stop_browsing();
        let mut reg = self.registry.lock();
        if reg.unavailable {
            return Err(ResolutionError::BrowseFailed("local registry offline".into()));
        }

        let (tx, rx) = mpsc::channel(WATCHER_CAPACITY);
        // replay what is already registered, like an mDNS cache would
        for raw in reg.services.values() {
            let _ = tx.try_send(ServiceEvent::Found(raw.clone()));
        }
        let id = reg.next_watcher;
        reg.next_watcher += 1;
        reg.watchers.insert(id, tx);
        drop(reg);

        *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);
        Ok(rx)
    }

    fn stop_browsing(&self) {
        let id = self.watcher.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(id) = id {
            self.registry.lock().watchers.remove(&id);
        }
    }

    async fn resolve(&self, raw: &RawAdvertisement) -> Result<ResolvedEndpoint, ResolutionError> {
        let delay = self.registry.lock().resolve_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let current = self.registry.lock().services.get(&raw.fullname).cloned();
        endpoint_from_raw(current.as_ref().unwrap_or(raw))
    }
}

impl Drop for LocalBrowser {
    fn drop(&mut self) {
        self.stop_browsing();
    }
}
