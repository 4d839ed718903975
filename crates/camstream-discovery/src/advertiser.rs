//! mDNS service advertisement for the CameraStream producer.
//!
//! The producer calls [`Advertiser::advertise`] once its listener is bound so
//! that a consumer on the same subnet can find it without knowing its address.
//!
//! # TXT record keys
//!
//! | Key       | Value                                        |
//! |-----------|----------------------------------------------|
//! | `version` | Protocol version (`"1"`)                     |
//! | `grid`    | Sample grid, `WxHxC` (e.g. `"10x10x1"`)      |
//! | `framing` | `raw` or `length_prefixed`                   |
//!
//! # Usage
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), camstream_core::RegistrationError> {
//! use camstream_core::{ServiceAdvertisement, SERVICE_NAME, SERVICE_TYPE};
//! use camstream_discovery::{Advertiser, MdnsAdvertiser};
//! use std::time::Duration;
//!
//! let adv = MdnsAdvertiser::new(Duration::from_millis(1500));
//! let handle = adv
//!     .advertise(&ServiceAdvertisement::new(SERVICE_NAME, SERVICE_TYPE, 40123))
//!     .await?;
//!
//! // When the producer shuts down:
//! adv.unadvertise(&handle);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use camstream_core::{normalize_service_type, RawAdvertisement, RegistrationError, ServiceAdvertisement};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{AdvertisementHandle, Advertiser};

/// Advertises one producer on the local mDNS domain.
pub struct MdnsAdvertiser {
    daemon: Mutex<Option<ServiceDaemon>>,
    current: Mutex<Slot>,
    probe: Duration,
    host_ip: Option<IpAddr>,
}

/// At most one advertisement per advertiser, counting one still being probed.
#[derive(Debug, Default)]
enum Slot {
    #[default]
    Free,
    Pending(String),
    Active(AdvertisementHandle),
}

/// Claim on [`Slot`] for the duration of one `advertise` call. Released on
/// drop unless committed, so every error path (and a cancelled call) frees it.
struct Reservation<'a> {
    slot: &'a Mutex<Slot>,
    committed: bool,
}

impl Reservation<'_> {
    fn commit(mut self, handle: AdvertisementHandle) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Slot::Active(handle);
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Slot::Free;
        }
    }
}

impl MdnsAdvertiser {
    /// `probe` is how long to listen for an existing instance with the same
    /// name before registering. Zero skips the probe.
    pub fn new(probe: Duration) -> Self {
        Self {
            daemon: Mutex::new(None),
            current: Mutex::new(Slot::Free),
            probe,
            host_ip: None,
        }
    }

    /// Advertise this address instead of the detected LAN address.
    pub fn with_host_ip(mut self, ip: IpAddr) -> Self {
        self.host_ip = Some(ip);
        self
    }

    fn reserve(&self, name: &str) -> Result<Reservation<'_>, RegistrationError> {
        let mut slot = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        match &*slot {
            Slot::Pending(busy) => {
                return Err(RegistrationError::AlreadyAdvertising { name: busy.clone() });
            }
            Slot::Active(handle) if handle.is_active() => {
                return Err(RegistrationError::AlreadyAdvertising { name: handle.name().to_owned() });
            }
            _ => {}
        }
        *slot = Slot::Pending(name.to_owned());
        Ok(Reservation { slot: &self.current, committed: false })
    }

    fn daemon(&self) -> Result<ServiceDaemon, RegistrationError> {
        let mut slot = self.daemon.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(d) = slot.as_ref() {
            return Ok(d.clone());
        }
        let d = ServiceDaemon::new().map_err(|e| RegistrationError::DaemonUnavailable(e.to_string()))?;
        *slot = Some(d.clone());
        Ok(d)
    }

    /// Browse `ty` for `self.probe` and report whether `name` already resolves.
    async fn name_taken(&self, daemon: &ServiceDaemon, ty: &str, name: &str) -> Result<bool, RegistrationError> {
        if self.probe.is_zero() {
            return Ok(false);
        }
        let receiver = daemon
            .browse(ty)
            .map_err(|e| RegistrationError::DaemonUnavailable(e.to_string()))?;
        let deadline = Instant::now() + self.probe;
        let mut taken = false;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, receiver.recv_async()).await {
                Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                    let instance = RawAdvertisement::instance_from_fullname(info.get_fullname(), ty);
                    if instance == name {
                        taken = true;
                        break;
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => break,
            }
        }

        if let Err(e) = daemon.stop_browse(ty) {
            debug!("[mDNS] stop_browse after probe: {}", e);
        }
        Ok(taken)
    }
}

#[async_trait]
impl Advertiser for MdnsAdvertiser {
    async fn advertise(&self, ad: &ServiceAdvertisement) -> Result<AdvertisementHandle, RegistrationError> {
        let reservation = self.reserve(&ad.name)?;
        let daemon = self.daemon()?;
        let ty = normalize_service_type(&ad.service_type);

        if self.name_taken(&daemon, &ty, &ad.name).await? {
            warn!("[mDNS] '{}' already present on {}", ad.name, ty);
            return Err(RegistrationError::NameConflict { name: ad.name.clone() });
        }

        let raw_host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "camerastream".to_owned());
        let host_name = format!("{raw_host}.local."); // e.g. "myhost.local."
        let host_ip = self.host_ip.unwrap_or_else(detect_local_ip);

        let properties: HashMap<String, String> =
            ad.txt.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

        let service = ServiceInfo::new(&ty, &ad.name, &host_name, host_ip, ad.port, Some(properties))
            .map_err(|e| RegistrationError::Rejected { reason: e.to_string() })?;

        let fullname = service.get_fullname().to_owned();
        daemon
            .register(service)
            .map_err(|e| RegistrationError::DaemonUnavailable(e.to_string()))?;

        info!("[mDNS] Advertising '{}' at {}:{}", ad.name, host_ip, ad.port);

        let handle = AdvertisementHandle::new(&ad.name, fullname);
        reservation.commit(handle.clone());
        Ok(handle)
    }

    fn unadvertise(&self, handle: &AdvertisementHandle) {
        if !handle.deactivate() {
            return;
        }
        let daemon = self.daemon.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let Some(daemon) = daemon else { return };
        if let Err(e) = daemon.unregister(handle.fullname()) {
            warn!("[mDNS] Failed to unregister '{}': {}", handle.fullname(), e);
        } else {
            info!("[mDNS] Advertisement '{}' removed.", handle.fullname());
        }
    }
}

impl Drop for MdnsAdvertiser {
    fn drop(&mut self) {
        let current = std::mem::take(&mut *self.current.lock().unwrap_or_else(PoisonError::into_inner));
        if let Slot::Active(handle) = current {
            self.unadvertise(&handle);
        }
        if let Some(daemon) = self.daemon.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = daemon.shutdown();
        }
    }
}

// ── Local IP detection ────────────────────────────────────────────────────────

/// Detect the primary LAN IPv4 address by probing an external socket.
///
/// Nothing is sent; connecting a UDP socket only consults the routing table.
pub fn detect_local_ip() -> IpAddr {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("8.8.8.8:80")?;
            s.local_addr()
        })
        .map(|a| a.ip())
        .unwrap_or_else(|_| IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_advertise_is_refused_while_the_first_is_pending() {
        let adv = MdnsAdvertiser::new(Duration::from_millis(1500));
        let pending = adv.reserve("CameraStream").unwrap();

        let err = adv.reserve("CameraStream").err().unwrap();
        assert_eq!(err, RegistrationError::AlreadyAdvertising { name: "CameraStream".into() });

        // a failed or cancelled attempt frees the slot
        drop(pending);
        assert!(adv.reserve("CameraStream").is_ok());
    }

    #[test]
    fn slot_frees_once_the_advertisement_is_withdrawn() {
        let adv = MdnsAdvertiser::new(Duration::ZERO);
        let handle = AdvertisementHandle::new("CameraStream", "CameraStream._camerastream._tcp.local.".into());
        adv.reserve("CameraStream").unwrap().commit(handle.clone());

        assert!(matches!(
            adv.reserve("Other").err(),
            Some(RegistrationError::AlreadyAdvertising { .. })
        ));

        adv.unadvertise(&handle);
        assert!(!handle.is_active());
        assert!(adv.reserve("Other").is_ok());
    }
}
