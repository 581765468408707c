//! Façade de découverte : M-SEARCH sur toutes les interfaces et collecte
//! des réponses pendant une fenêtre de temps.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::description::{DeviceDescriptionLoader, HttpDescriptionLoader};
use crate::errors::{Result, SsdpError};
use crate::ssdp::{
    ALL_DEVICES, DiscoveryListener, DiscoveryResultsHandler, ROOT_DEVICES, SearchResponse,
    SearchSender,
};

/// Paramètres d'une découverte
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryOptions {
    pub timeout: Duration,
    pub ttl: u32,
    pub mx: u32,
    pub search_target: String,
    /// Nom d'interface ; `None` pour toutes les interfaces
    pub interface: Option<String>,
}

/// Durée d'attente effective : au moins `(mx + 1)` secondes
pub fn effective_wait(timeout: Duration, mx: u32) -> Duration {
    let mx_window = Duration::from_millis((u64::from(mx) + 1) * 1000);
    timeout.max(mx_window)
}

/// Devices collectés pendant une découverte, dédupliqués par USN
struct Collected<D> {
    seen: HashSet<String>,
    devices: Vec<D>,
}

pub struct Discovery<L: DeviceDescriptionLoader> {
    listener: Arc<DiscoveryListener>,
    sender: SearchSender,
    loader: Arc<L>,
}

impl Discovery<HttpDescriptionLoader> {
    /// Découverte sur le listener global avec le chargeur HTTP
    pub fn with_defaults() -> Self {
        Self::new(DiscoveryListener::global(), HttpDescriptionLoader::default())
    }
}

impl<L: DeviceDescriptionLoader> Discovery<L> {
    pub fn new(listener: Arc<DiscoveryListener>, loader: L) -> Self {
        let sender = SearchSender::new(listener.settings());
        Self {
            listener,
            sender,
            loader: Arc::new(loader),
        }
    }

    /// Options par défaut issues des réglages du listener
    pub fn default_options(&self, search_target: &str) -> DiscoveryOptions {
        let settings = self.listener.settings();
        DiscoveryOptions {
            timeout: Duration::from_millis(settings.discovery_timeout_ms),
            ttl: settings.ttl,
            mx: settings.mx,
            search_target: search_target.to_string(),
            interface: None,
        }
    }

    /// Découvre les devices racine avec les réglages par défaut
    pub fn discover_default(&self) -> Result<Option<Vec<L::Device>>> {
        self.discover_target(ROOT_DEVICES)
    }

    pub fn discover_target(&self, search_target: &str) -> Result<Option<Vec<L::Device>>> {
        self.discover_with(&self.default_options(search_target))
    }

    pub fn discover_with_timeout(
        &self,
        timeout: Duration,
        search_target: &str,
    ) -> Result<Option<Vec<L::Device>>> {
        let options = DiscoveryOptions {
            timeout,
            ..self.default_options(search_target)
        };
        self.discover_with(&options)
    }

    pub fn discover_all(&self) -> Result<Option<Vec<L::Device>>> {
        self.discover_target(ALL_DEVICES)
    }

    pub fn discover_with(&self, options: &DiscoveryOptions) -> Result<Option<Vec<L::Device>>> {
        self.discover(
            options.timeout,
            options.ttl,
            options.mx,
            &options.search_target,
            options.interface.as_deref(),
        )
    }

    /// Envoie un M-SEARCH sur chaque adresse IPv4 et collecte les réponses
    ///
    /// Bloque pendant `max(timeout, (mx + 1) s)`. Chaque USN n'est chargé
    /// qu'une fois (premier arrivé). Retourne `None` si aucun device n'a
    /// répondu ; les erreurs d'envoi par interface sont ignorées.
    pub fn discover(
        &self,
        timeout: Duration,
        ttl: u32,
        mx: u32,
        search_target: &str,
        interface: Option<&str>,
    ) -> Result<Option<Vec<L::Device>>> {
        if search_target.trim().is_empty() {
            return Err(SsdpError::InvalidArgument(
                "search target must not be empty".to_string(),
            ));
        }

        let collected: Arc<Mutex<Collected<L::Device>>> = Arc::new(Mutex::new(Collected {
            seen: HashSet::new(),
            devices: Vec::new(),
        }));

        let sink = Arc::clone(&collected);
        let loader = Arc::clone(&self.loader);
        let handler: Arc<dyn DiscoveryResultsHandler> =
            Arc::new(move |response: &SearchResponse| {
                let mut collected = sink.lock();
                if collected.seen.contains(&response.usn) {
                    return;
                }
                match loader.load(response) {
                    Ok(device) => {
                        collected.seen.insert(response.usn.clone());
                        collected.devices.push(device);
                    }
                    Err(e) => error!(usn = %response.usn, error = %e, "Cannot build discovered device"),
                }
            });

        self.listener
            .register_results_handler(Arc::clone(&handler), search_target)?;
        let bind_port = self
            .listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(self.listener.settings().search_port);

        let result = self.send_searches(bind_port, ttl, mx, search_target, interface);
        if result.is_ok() {
            thread::sleep(effective_wait(timeout, mx));
        }
        self.listener
            .unregister_results_handler(&handler, search_target);
        result?;

        let devices = std::mem::take(&mut collected.lock().devices);
        info!(st = search_target, count = devices.len(), "Discovery finished");
        Ok(if devices.is_empty() { None } else { Some(devices) })
    }

    fn send_searches(
        &self,
        bind_port: u16,
        ttl: u32,
        mx: u32,
        search_target: &str,
        interface: Option<&str>,
    ) -> Result<()> {
        for src in pmoutils::list_ipv4_addrs(interface)? {
            if let Err(e) = self
                .sender
                .send_search_message(src, bind_port, ttl, mx, search_target)
            {
                debug!(src = %src, error = %e, "M-SEARCH send failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_wait_uses_mx_window() {
        assert_eq!(effective_wait(Duration::from_millis(1500), 3), Duration::from_secs(4));
        assert_eq!(effective_wait(Duration::from_millis(1500), 0), Duration::from_millis(1500));
        assert_eq!(effective_wait(Duration::from_secs(10), 3), Duration::from_secs(10));
    }
}
