//! camstream-discovery — advertise a producer and find it from a consumer.
//!
//! Two seams keep the session layer independent of mDNS:
//!
//! - [`Advertiser`]: publish / withdraw a [`ServiceAdvertisement`].
//! - [`Browser`]: stream [`ServiceEvent`]s for a service type and turn a
//!   [`RawAdvertisement`] into a connectable [`ResolvedEndpoint`].
//!
//! [`MdnsAdvertiser`] / [`MdnsBrowser`] talk to the network through `mdns-sd`;
//! [`LocalRegistry`] is an in-process registry used by tests and by
//! `--registry local`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use camstream_core::{
    service_type_matches, NameMatch, RawAdvertisement, RegistrationError, ResolutionError, ResolvedEndpoint,
    ServiceAdvertisement, ServiceEvent,
};
use tokio::sync::mpsc;
use tracing::debug;

pub mod advertiser;
pub mod browser;
pub mod local;
pub mod resolver;

pub use advertiser::{detect_local_ip, MdnsAdvertiser};
pub use browser::MdnsBrowser;
pub use local::{LocalBrowser, LocalRegistry};
pub use resolver::Resolver;

// MARK: - Advertiser

/// Publishes the producer's service on the local network.
#[async_trait]
pub trait Advertiser: Send + Sync {
    /// Publish `ad`. At most one advertisement is active per advertiser.
    async fn advertise(&self, ad: &ServiceAdvertisement) -> Result<AdvertisementHandle, RegistrationError>;

    /// Withdraw a published advertisement. Idempotent.
    fn unadvertise(&self, handle: &AdvertisementHandle);
}

/// Token for one active advertisement.
#[derive(Debug, Clone)]
pub struct AdvertisementHandle {
    name: String,
    fullname: String,
    active: Arc<AtomicBool>,
}

impl AdvertisementHandle {
    pub fn new(name: &str, fullname: String) -> Self {
        Self {
            name: name.to_owned(),
            fullname,
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fullname(&self) -> &str {
        &self.fullname
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Mark withdrawn. Returns whether it was still active, so only the first
    /// caller tears anything down.
    pub fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::SeqCst)
    }
}

// MARK: - Browser

/// Browses for advertisements and resolves them.
#[async_trait]
pub trait Browser: Send + Sync {
    /// Start browsing `service_type`. Replaces any browse already running.
    async fn start_browsing(&self, service_type: &str) -> Result<mpsc::Receiver<ServiceEvent>, ResolutionError>;

    /// Stop the current browse. Idempotent.
    fn stop_browsing(&self);

    /// Turn a browse result into a connectable endpoint.
    async fn resolve(&self, raw: &RawAdvertisement) -> Result<ResolvedEndpoint, ResolutionError>;
}

#[async_trait]
impl<B: Browser + ?Sized> Browser for Arc<B> {
    async fn start_browsing(&self, service_type: &str) -> Result<mpsc::Receiver<ServiceEvent>, ResolutionError> {
        (**self).start_browsing(service_type).await
    }

    fn stop_browsing(&self) {
        (**self).stop_browsing()
    }

    async fn resolve(&self, raw: &RawAdvertisement) -> Result<ResolvedEndpoint, ResolutionError> {
        (**self).resolve(raw).await
    }
}

/// Pick an address from a browse result. IPv4 wins over IPv6 because link-local
/// v6 addresses need a scope id the endpoint cannot carry.
pub fn endpoint_from_raw(raw: &RawAdvertisement) -> Result<ResolvedEndpoint, ResolutionError> {
    if raw.port == 0 {
        return Err(ResolutionError::Malformed { name: raw.name.clone(), reason: "port 0".into() });
    }
    let address = raw
        .addresses
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| raw.addresses.first())
        .copied()
        .ok_or_else(|| ResolutionError::Malformed {
            name: raw.name.clone(),
            reason: "no address".into(),
        })?;
    Ok(ResolvedEndpoint { name: raw.name.clone(), address, port: raw.port })
}

// MARK: - ServiceFilter

/// Which events a consumer cares about.
#[derive(Debug, Clone)]
pub struct ServiceFilter {
    pub service_type: String,
    pub name: String,
    pub name_match: NameMatch,
}

impl ServiceFilter {
    pub fn new(service_type: impl Into<String>, name: impl Into<String>, name_match: NameMatch) -> Self {
        Self { service_type: service_type.into(), name: name.into(), name_match }
    }

    pub fn accepts(&self, event: &ServiceEvent) -> bool {
        if !service_type_matches(&self.service_type, event.service_type()) {
            debug!("[Discovery] ignoring '{}' of type {}", event.name(), event.service_type());
            return false;
        }
        if !self.name_match.matches(&self.name, event.name()) {
            debug!("[Discovery] ignoring '{}' (want '{}')", event.name(), self.name);
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use camstream_core::{SERVICE_NAME, SERVICE_TYPE};

    use super::*;

    fn raw(name: &str, ty: &str, addresses: Vec<IpAddr>, port: u16) -> RawAdvertisement {
        RawAdvertisement {
            name: name.into(),
            service_type: ty.into(),
            fullname: format!("{name}.{ty}"),
            hostname: "host.local".into(),
            addresses,
            port,
            grid: None,
        }
    }

    #[test]
    fn handle_deactivates_once() {
        let h = AdvertisementHandle::new("CameraStream", "CameraStream._camerastream._tcp.local.".into());
        let copy = h.clone();
        assert!(h.is_active());
        assert!(copy.deactivate());
        assert!(!h.deactivate());
        assert!(!h.is_active());
    }

    #[test]
    fn endpoint_prefers_ipv4() {
        let v6: IpAddr = "fe80::1".parse().unwrap();
        let v4 = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));
        let ep = endpoint_from_raw(&raw(SERVICE_NAME, SERVICE_TYPE, vec![v6, v4], 4000)).unwrap();
        assert_eq!(ep.address, v4);
        assert_eq!(ep.port, 4000);
    }

    #[test]
    fn endpoint_without_address_or_port_is_malformed() {
        let err = endpoint_from_raw(&raw(SERVICE_NAME, SERVICE_TYPE, vec![], 4000)).unwrap_err();
        assert!(matches!(err, ResolutionError::Malformed { .. }));
        let err = endpoint_from_raw(&raw(SERVICE_NAME, SERVICE_TYPE, vec![IpAddr::V4(Ipv4Addr::LOCALHOST)], 0))
            .unwrap_err();
        assert!(matches!(err, ResolutionError::Malformed { .. }));
    }

    #[test]
    fn filter_drops_other_types_and_names() {
        let filter = ServiceFilter::new(SERVICE_TYPE, SERVICE_NAME, NameMatch::Substring);
        let ip = vec![IpAddr::V4(Ipv4Addr::LOCALHOST)];

        assert!(filter.accepts(&ServiceEvent::Found(raw("CameraStream", "_camerastream._tcp.local.", ip.clone(), 1))));
        assert!(filter.accepts(&ServiceEvent::Found(raw("CameraStream (2)", SERVICE_TYPE, ip.clone(), 1))));
        assert!(!filter.accepts(&ServiceEvent::Found(raw("CameraStream", "_http._tcp.local.", ip.clone(), 1))));
        assert!(!filter.accepts(&ServiceEvent::Found(raw("Printer", SERVICE_TYPE, ip, 1))));

        let exact = ServiceFilter::new(SERVICE_TYPE, SERVICE_NAME, NameMatch::Exact);
        assert!(!exact.accepts(&ServiceEvent::Lost {
            name: "CameraStream (2)".into(),
            service_type: SERVICE_TYPE.into(),
        }));
    }
}
