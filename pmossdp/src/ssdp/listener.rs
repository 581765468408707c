//! Démon de réception des réponses aux M-SEARCH

use std::net::SocketAddr;
use std::sync::Arc;

use once_cell::sync::Lazy;
use pmoconfig::get_config;
use tracing::{debug, trace};

use super::daemon::{Daemon, DaemonPhase, DaemonState, invoke_handler};
use super::device::{SearchResponse, checked_location, parse_max_age};
use super::message::HttpResponse;
use super::registry::HandlerRegistry;
use super::transport::MulticastTransport;
use super::derive_udn;
use crate::config_ext::{SsdpConfigExt, SsdpSettings};
use crate::errors::Result;

/// Reçoit les réponses aux recherches pour une cible (`ST`) donnée.
///
/// Les handlers sont appelés sur le thread du démon, dans l'ordre d'arrivée
/// des datagrammes. Une panique dans un handler plante le démon.
pub trait DiscoveryResultsHandler: Send + Sync {
    fn discovered_device(&self, response: &SearchResponse);
}

impl<F> DiscoveryResultsHandler for F
where
    F: Fn(&SearchResponse) + Send + Sync,
{
    fn discovered_device(&self, response: &SearchResponse) {
        self(response)
    }
}

pub(crate) enum ResultsCommand {
    Register {
        search_target: String,
        handler: Arc<dyn DiscoveryResultsHandler>,
    },
    Unregister {
        search_target: String,
        handler: Arc<dyn DiscoveryResultsHandler>,
    },
}

pub(crate) struct SearchResultsState {
    handlers: HandlerRegistry<dyn DiscoveryResultsHandler>,
    match_ip: bool,
}

impl SearchResultsState {
    pub(crate) fn new(match_ip: bool) -> Self {
        Self {
            handlers: HandlerRegistry::new(),
            match_ip,
        }
    }
}

impl DaemonState for SearchResultsState {
    type Command = ResultsCommand;

    fn apply(&mut self, command: ResultsCommand) {
        match command {
            ResultsCommand::Register {
                search_target,
                handler,
            } => {
                self.handlers.insert(&search_target, handler);
            }
            ResultsCommand::Unregister {
                search_target,
                handler,
            } => {
                self.handlers.remove(&search_target, &handler);
            }
        }
    }

    fn registrations(&self) -> usize {
        self.handlers.len()
    }

    fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) -> Result<()> {
        let Some(response) = parse_search_response(data, from, self.match_ip) else {
            return Ok(());
        };

        debug!(usn = %response.usn, st = %response.st, from = %from, "📥 Search response");
        for handler in self.handlers.handlers(&response.st) {
            invoke_handler(|| handler.discovered_device(&response))?;
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.handlers.clear();
    }
}

/// Interprète un datagramme comme réponse M-SEARCH
///
/// Retourne `None` pour tout ce qui n'est pas une réponse complète et
/// cohérente ; la raison est tracée.
pub(crate) fn parse_search_response(
    data: &[u8],
    from: SocketAddr,
    match_ip: bool,
) -> Option<SearchResponse> {
    let raw = String::from_utf8_lossy(data);
    let message = match HttpResponse::parse(&raw) {
        Ok(message) => message,
        Err(e) => {
            trace!(from = %from, error = %e, "Unparsable datagram dropped");
            return None;
        }
    };

    if !message.header().starts_with("HTTP/1.1 200 OK") || !message.has_field("ST") {
        trace!(from = %from, header = message.header(), "Not a search response");
        return None;
    }

    let (location, st, usn, max_age, server) = match required_fields(&message) {
        Ok(fields) => fields,
        Err(e) => {
            debug!(from = %from, error = %e, "Incomplete search response dropped");
            return None;
        }
    };

    let Some(max_age) = parse_max_age(max_age) else {
        debug!(from = %from, max_age, "Invalid max-age, search response dropped");
        return None;
    };
    let location = checked_location(location, from, match_ip)?;

    Some(SearchResponse {
        usn: usn.to_string(),
        udn: derive_udn(usn).to_string(),
        st: st.to_string(),
        max_age,
        location,
        server: server.to_string(),
        from,
    })
}

fn required_fields(message: &HttpResponse) -> Result<(&str, &str, &str, &str, &str)> {
    Ok((
        message.header_field("LOCATION")?,
        message.header_field("ST")?,
        message.header_field("USN")?,
        message.field_element("CACHE-CONTROL", "max-age")?,
        message.header_field("SERVER")?,
    ))
}

/// Listener des réponses aux recherches SSDP (port 1901 par défaut).
///
/// Le thread démon démarre à la première inscription et s'arrête quand la
/// dernière cible de recherche n'a plus de handler.
pub struct DiscoveryListener {
    settings: SsdpSettings,
    daemon: Daemon<SearchResultsState>,
}

static GLOBAL_LISTENER: Lazy<Arc<DiscoveryListener>> =
    Lazy::new(|| Arc::new(DiscoveryListener::new(get_config().get_ssdp_settings())));

impl DiscoveryListener {
    pub fn new(settings: SsdpSettings) -> Self {
        Self {
            settings,
            daemon: Daemon::new("discovery"),
        }
    }

    /// Instance partagée du processus, configurée par `pmoconfig`
    pub fn global() -> Arc<DiscoveryListener> {
        Arc::clone(&GLOBAL_LISTENER)
    }

    pub fn settings(&self) -> &SsdpSettings {
        &self.settings
    }

    /// Inscrit `handler` pour la cible `search_target`
    ///
    /// Démarre le démon si besoin et ne rend la main qu'une fois son thread
    /// en service. Les erreurs de bind sont retournées.
    pub fn register_results_handler(
        &self,
        handler: Arc<dyn DiscoveryResultsHandler>,
        search_target: &str,
    ) -> Result<()> {
        let command = ResultsCommand::Register {
            search_target: search_target.to_string(),
            handler,
        };
        self.daemon.register(command, || {
            let transport = MulticastTransport::bind(
                self.settings.search_port,
                self.settings.multicast_addr,
                self.settings.ttl,
                self.settings.receive_timeout(),
            )?;
            Ok((transport, SearchResultsState::new(self.settings.match_ip)))
        })
    }

    /// Désinscrit `handler` ; le démon s'arrête s'il n'a plus d'inscription
    pub fn unregister_results_handler(
        &self,
        handler: &Arc<dyn DiscoveryResultsHandler>,
        search_target: &str,
    ) {
        self.daemon.unregister(ResultsCommand::Unregister {
            search_target: search_target.to_string(),
            handler: Arc::clone(handler),
        });
    }

    pub fn phase(&self) -> DaemonPhase {
        self.daemon.phase()
    }

    /// Adresse du socket de réception tant que le démon tourne
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.daemon.local_addr()
    }

    /// Nombre de cibles de recherche ayant au moins un handler
    pub fn registrations(&self) -> usize {
        self.daemon.registrations()
    }

    /// Sort de l'état `Crashed` ; `false` si le démon n'avait pas planté
    pub fn reset(&self) -> bool {
        self.daemon.reset()
    }
}
