use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use camstream_core::{
    normalize_service_type, RawAdvertisement, ResolutionError, ResolvedEndpoint, ServiceEvent, TXT_GRID,
};
use mdns_sd::{ServiceDaemon, ServiceInfo};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::{endpoint_from_raw, Browser};

/// Descobre producers CameraStream na rede local via mDNS.
pub struct MdnsBrowser {
    daemon: Mutex<Option<ServiceDaemon>>,
    active: Mutex<Option<(String, JoinHandle<()>)>>,
}

impl MdnsBrowser {
    pub fn new() -> Self {
        Self { daemon: Mutex::new(None), active: Mutex::new(None) }
    }

    fn daemon(&self) -> Result<ServiceDaemon, ResolutionError> {
        let mut slot = self.daemon.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(d) = slot.as_ref() {
            return Ok(d.clone());
        }
        let d = ServiceDaemon::new().map_err(|e| ResolutionError::BrowseFailed(e.to_string()))?;
        *slot = Some(d.clone());
        Ok(d)
    }
}

impl Default for MdnsBrowser {
    fn default() -> Self {
        Self::new()
    }
}

/// Raw advertisement from a resolved mDNS record.
fn raw_from_info(info: &ServiceInfo) -> RawAdvertisement {
    let service_type = info.get_type().to_owned();
    let mut addresses: Vec<IpAddr> = info.get_addresses().iter().map(|a| IpAddr::from(*a)).collect();
    addresses.sort();
    RawAdvertisement {
        name: RawAdvertisement::instance_from_fullname(info.get_fullname(), &service_type).to_owned(),
        fullname: info.get_fullname().to_owned(),
        hostname: info.get_hostname().trim_end_matches('.').to_owned(),
        addresses,
        port: info.get_port(),
        grid: info.get_properties().get(TXT_GRID).map(|v| v.val_str().to_owned()),
        service_type,
    }
}

#[async_trait]
impl Browser for MdnsBrowser {
    /// Inicia a busca por producers.
    async fn start_browsing(&self, service_type: &str) -> Result<mpsc::Receiver<ServiceEvent>, ResolutionError> {
        self.stop_browsing();

        let ty = normalize_service_type(service_type);
        let daemon = self.daemon()?;
        let receiver = daemon
            .browse(&ty)
            .map_err(|e| ResolutionError::BrowseFailed(e.to_string()))?;

        let (tx, rx) = mpsc::channel(16);

        let task = tokio::spawn(async move {
            while let Ok(event) = receiver.recv_async().await {
                let mapped = match event {
                    mdns_sd::ServiceEvent::ServiceResolved(info) => {
                        info!("[mDNS] Found: {}", info.get_fullname());
                        ServiceEvent::Found(raw_from_info(&info))
                    }
                    mdns_sd::ServiceEvent::ServiceRemoved(ty_domain, fullname) => {
                        debug!("[mDNS] Gone: {}", fullname);
                        ServiceEvent::Lost {
                            name: RawAdvertisement::instance_from_fullname(&fullname, &ty_domain).to_owned(),
                            service_type: ty_domain,
                        }
                    }
                    other => {
                        debug!("[mDNS] {:?}", other);
                        continue;
                    }
                };
                if tx.send(mapped).await.is_err() {
                    break;
                }
            }
        });

        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Some((ty, task));
        Ok(rx)
    }

    fn stop_browsing(&self) {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some((ty, task)) = active else { return };
        task.abort();
        if let Some(daemon) = self.daemon.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            if let Err(e) = daemon.stop_browse(&ty) {
                debug!("[mDNS] stop_browse({}): {}", ty, e);
            }
        }
        info!("[mDNS] Stopped browsing {}", ty);
    }

    /// mdns-sd resolves SRV/A records before reporting a service, so this only
    /// validates what arrived.
    async fn resolve(&self, raw: &RawAdvertisement) -> Result<ResolvedEndpoint, ResolutionError> {
        endpoint_from_raw(raw)
    }
}

impl Drop for MdnsBrowser {
    fn drop(&mut self) {
        self.stop_browsing();
        if let Some(daemon) = self.daemon.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = daemon.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn resolved_record_becomes_a_raw_advertisement() {
        let mut txt = HashMap::new();
        txt.insert(TXT_GRID.to_owned(), "10x10x1".to_owned());
        let info = ServiceInfo::new(
            "_camerastream._tcp.local.",
            "CameraStream",
            "phone.local.",
            "192.168.1.40",
            41234,
            Some(txt),
        )
        .unwrap();

        let raw = raw_from_info(&info);
        assert_eq!(raw.name, "CameraStream");
        assert_eq!(raw.hostname, "phone.local");
        assert_eq!(raw.port, 41234);
        assert_eq!(raw.grid.as_deref(), Some("10x10x1"));
        assert_eq!(raw.addresses, vec!["192.168.1.40".parse::<IpAddr>().unwrap()]);

        let ep = endpoint_from_raw(&raw).unwrap();
        assert_eq!(ep.socket_addr().to_string(), "192.168.1.40:41234");
    }
}
