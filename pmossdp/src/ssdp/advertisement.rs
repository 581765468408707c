//! Démon de réception des annonces NOTIFY alive/byebye

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use once_cell::sync::Lazy;
use pmoconfig::get_config;
use tracing::{debug, trace, warn};

use super::daemon::{Daemon, DaemonPhase, DaemonState, invoke_handler};
use super::device::{AliveEvent, ByeByeEvent, checked_location, parse_max_age};
use super::message::HttpResponse;
use super::registry::HandlerRegistry;
use super::transport::MulticastTransport;
use super::{NT_ALL_EVENTS, derive_udn};
use crate::config_ext::{SsdpConfigExt, SsdpSettings};
use crate::errors::Result;

/// Reçoit les annonces des devices.
///
/// Un même handler peut être inscrit pour les deux types d'annonce ; seule
/// la méthode correspondant à l'inscription est appelée.
pub trait DiscoveryEventHandler: Send + Sync {
    fn ssdp_alive(&self, event: &AliveEvent);

    fn ssdp_byebye(&self, event: &ByeByeEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Alive,
    ByeBye,
}

pub(crate) enum AdvertisementCommand {
    Register {
        kind: NotificationKind,
        nt: String,
        handler: Arc<dyn DiscoveryEventHandler>,
    },
    Unregister {
        kind: NotificationKind,
        nt: String,
        handler: Arc<dyn DiscoveryEventHandler>,
    },
}

pub(crate) struct AdvertisementState {
    alive: HandlerRegistry<dyn DiscoveryEventHandler>,
    byebye: HandlerRegistry<dyn DiscoveryEventHandler>,
    // dernier émetteur d'un alive, par USN
    usn_senders: HashMap<String, IpAddr>,
    match_ip: bool,
}

impl AdvertisementState {
    pub(crate) fn new(match_ip: bool) -> Self {
        Self {
            alive: HandlerRegistry::new(),
            byebye: HandlerRegistry::new(),
            usn_senders: HashMap::new(),
            match_ip,
        }
    }

    fn registry(&mut self, kind: NotificationKind) -> &mut HandlerRegistry<dyn DiscoveryEventHandler> {
        match kind {
            NotificationKind::Alive => &mut self.alive,
            NotificationKind::ByeBye => &mut self.byebye,
        }
    }

    fn handle_alive(&mut self, message: &HttpResponse, from: SocketAddr) -> Result<()> {
        let (location, nt, max_age, usn) = match alive_fields(message) {
            Ok(fields) => fields,
            Err(e) => {
                debug!(from = %from, error = %e, "Incomplete ssdp:alive dropped");
                return Ok(());
            }
        };
        let Some(max_age) = parse_max_age(max_age) else {
            debug!(from = %from, max_age, "Invalid max-age, ssdp:alive dropped");
            return Ok(());
        };
        let Some(location) = checked_location(location, from, self.match_ip) else {
            return Ok(());
        };

        self.usn_senders.insert(usn.to_string(), from.ip());

        let event = AliveEvent {
            usn: usn.to_string(),
            udn: derive_udn(usn).to_string(),
            nt: nt.to_string(),
            max_age,
            location,
            from,
        };
        debug!(usn = %event.usn, nt = %event.nt, from = %from, "📥 ssdp:alive");

        let handlers = self.alive.handlers(NT_ALL_EVENTS);
        for handler in handlers.iter().chain(self.alive.handlers(nt).iter()) {
            invoke_handler(|| handler.ssdp_alive(&event))?;
        }
        Ok(())
    }

    fn handle_byebye(&mut self, message: &HttpResponse, from: SocketAddr) -> Result<()> {
        let (usn, nt) = match message
            .header_field("USN")
            .and_then(|usn| Ok((usn, message.header_field("NT")?)))
        {
            Ok(fields) => fields,
            Err(e) => {
                debug!(from = %from, error = %e, "Incomplete ssdp:byebye dropped");
                return Ok(());
            }
        };

        if let Some(sender) = self.usn_senders.get(usn) {
            if *sender != from.ip() {
                debug!(usn, from = %from, alive_from = %sender, "ssdp:byebye from another host ignored");
                return Ok(());
            }
        }

        let event = ByeByeEvent {
            usn: usn.to_string(),
            udn: derive_udn(usn).to_string(),
            nt: nt.to_string(),
            from,
        };
        debug!(usn = %event.usn, nt = %event.nt, from = %from, "📥 ssdp:byebye");

        let handlers = self.byebye.handlers(NT_ALL_EVENTS);
        for handler in handlers.iter().chain(self.byebye.handlers(nt).iter()) {
            invoke_handler(|| handler.ssdp_byebye(&event))?;
        }
        Ok(())
    }
}

fn alive_fields(message: &HttpResponse) -> Result<(&str, &str, &str, &str)> {
    Ok((
        message.header_field("LOCATION")?,
        message.header_field("NT")?,
        message.field_element("CACHE-CONTROL", "max-age")?,
        message.header_field("USN")?,
    ))
}

impl DaemonState for AdvertisementState {
    type Command = AdvertisementCommand;

    fn apply(&mut self, command: AdvertisementCommand) {
        match command {
            AdvertisementCommand::Register { kind, nt, handler } => {
                self.registry(kind).insert(&nt, handler);
            }
            AdvertisementCommand::Unregister { kind, nt, handler } => {
                self.registry(kind).remove(&nt, &handler);
            }
        }
    }

    fn registrations(&self) -> usize {
        self.alive.len() + self.byebye.len()
    }

    fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) -> Result<()> {
        let raw = String::from_utf8_lossy(data);
        let message = match HttpResponse::parse(&raw) {
            Ok(message) => message,
            Err(e) => {
                trace!(from = %from, error = %e, "Unparsable datagram dropped");
                return Ok(());
            }
        };

        if !message.header().starts_with("NOTIFY") {
            trace!(from = %from, header = message.header(), "Not a NOTIFY message");
            return Ok(());
        }

        match message.header_field("NTS") {
            Ok("ssdp:alive") => self.handle_alive(&message, from),
            Ok("ssdp:byebye") => self.handle_byebye(&message, from),
            Ok(other) => {
                warn!(from = %from, nts = other, "Unexpected NTS value, NOTIFY dropped");
                Ok(())
            }
            Err(e) => {
                debug!(from = %from, error = %e, "NOTIFY without NTS dropped");
                Ok(())
            }
        }
    }

    fn clear(&mut self) {
        self.alive.clear();
        self.byebye.clear();
        self.usn_senders.clear();
    }
}

/// Listener des annonces SSDP (port 1900 par défaut).
///
/// Les inscriptions se font par type de notification (`NT`) ou, avec
/// `nt = None`, pour toutes les annonces.
pub struct AdvertisementListener {
    settings: SsdpSettings,
    daemon: Daemon<AdvertisementState>,
}

static GLOBAL_ADVERTISEMENT: Lazy<Arc<AdvertisementListener>> =
    Lazy::new(|| Arc::new(AdvertisementListener::new(get_config().get_ssdp_settings())));

impl AdvertisementListener {
    pub fn new(settings: SsdpSettings) -> Self {
        Self {
            settings,
            daemon: Daemon::new("advertisement"),
        }
    }

    pub fn global() -> Arc<AdvertisementListener> {
        Arc::clone(&GLOBAL_ADVERTISEMENT)
    }

    pub fn settings(&self) -> &SsdpSettings {
        &self.settings
    }

    /// Inscrit `handler` pour les annonces `kind` de type `nt`
    ///
    /// `None` inscrit le handler pour tous les types de notification.
    pub fn register_event(
        &self,
        kind: NotificationKind,
        nt: Option<&str>,
        handler: Arc<dyn DiscoveryEventHandler>,
    ) -> Result<()> {
        let command = AdvertisementCommand::Register {
            kind,
            nt: nt.unwrap_or(NT_ALL_EVENTS).to_string(),
            handler,
        };
        self.daemon.register(command, || {
            let transport = MulticastTransport::bind(
                self.settings.port,
                self.settings.multicast_addr,
                self.settings.ttl,
                self.settings.receive_timeout(),
            )?;
            Ok((transport, AdvertisementState::new(self.settings.match_ip)))
        })
    }

    pub fn unregister_event(
        &self,
        kind: NotificationKind,
        nt: Option<&str>,
        handler: &Arc<dyn DiscoveryEventHandler>,
    ) {
        self.daemon.unregister(AdvertisementCommand::Unregister {
            kind,
            nt: nt.unwrap_or(NT_ALL_EVENTS).to_string(),
            handler: Arc::clone(handler),
        });
    }

    pub fn phase(&self) -> DaemonPhase {
        self.daemon.phase()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.daemon.local_addr()
    }

    /// Nombre de clés (NT) inscrites, alive et byebye confondus
    pub fn registrations(&self) -> usize {
        self.daemon.registrations()
    }

    pub fn reset(&self) -> bool {
        self.daemon.reset()
    }
}
