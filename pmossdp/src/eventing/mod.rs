//! # Module Eventing - abonnements GENA aux événements des services
//!
//! [`ServicesEventing`] envoie les requêtes SUBSCRIBE / UNSUBSCRIBE sur des
//! connexions TCP dédiées et fait tourner un serveur de callback qui reçoit
//! les NOTIFY des devices. Chaque NOTIFY est rattaché à sa souscription par
//! son SID (et l'adresse du device quand elle correspond), puis chaque
//! variable d'état modifiée est transmise au [`ServiceEventHandler`] inscrit.
//!
//! Le serveur de callback démarre avec la première souscription et s'arrête
//! quand la dernière est retirée.

mod parser;
mod server;
mod subscription;

pub use parser::parse_property_set;
pub use server::{BoundedPool, ConnectionExecutor, Job, ThreadPerConnection};
pub use subscription::{ServiceEventSubscription, SubscriptionDuration};

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use pmoconfig::get_config;
use tracing::{debug, info, warn};

use crate::config_ext::{EventingSettings, SsdpConfigExt};
use crate::description::UpnpService;
use crate::errors::{Result, SsdpError};
use crate::soap::parse_soap_fault;
use crate::ssdp::HttpResponse;
use server::CallbackServer;
use subscription::{
    build_subscribe_request, build_unsubscribe_request, exchange, parse_timeout_header, resolve,
};

/// Reçoit les changements de variables d'état d'un service.
///
/// Appelé sur le thread qui traite la connexion NOTIFY, une fois par
/// variable modifiée.
pub trait ServiceEventHandler: Send + Sync {
    fn handle_state_variable_event(&self, variable_name: &str, new_value: &str);
}

impl<F> ServiceEventHandler for F
where
    F: Fn(&str, &str) + Send + Sync,
{
    fn handle_state_variable_event(&self, variable_name: &str, new_value: &str) {
        self(variable_name, new_value)
    }
}

#[derive(Clone)]
pub(crate) struct Subscription {
    pub(crate) info: ServiceEventSubscription,
    pub(crate) handler: Arc<dyn ServiceEventHandler>,
}

fn same_handler(a: &Arc<dyn ServiceEventHandler>, b: &Arc<dyn ServiceEventHandler>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Souscriptions actives, partagées avec le serveur de callback
#[derive(Default)]
pub(crate) struct SubscriptionTable {
    entries: Mutex<Vec<Subscription>>,
}

impl SubscriptionTable {
    fn find_by_service(
        &self,
        service: &UpnpService,
        handler: &Arc<dyn ServiceEventHandler>,
    ) -> Option<Subscription> {
        self.entries
            .lock()
            .iter()
            .find(|sub| {
                same_handler(&sub.handler, handler)
                    && sub.info.service_id == service.service_id
                    && sub.info.service_type == service.service_type
                    && Some(&sub.info.service_url) == service.event_sub_url.as_ref()
            })
            .cloned()
    }

    pub(crate) fn find_by_sid_and_ip(&self, sid: &str, ip: IpAddr) -> Option<Subscription> {
        self.entries
            .lock()
            .iter()
            .find(|sub| sub.info.sid == sid && sub.info.device_ip == ip)
            .cloned()
    }

    pub(crate) fn find_by_sid(&self, sid: &str) -> Option<Subscription> {
        self.entries
            .lock()
            .iter()
            .find(|sub| sub.info.sid == sid)
            .cloned()
    }

    fn insert(&self, subscription: Subscription) {
        self.entries.lock().push(subscription);
    }

    fn remove(&self, sid: &str, handler: &Arc<dyn ServiceEventHandler>) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|sub| !(sub.info.sid == sid && same_handler(&sub.handler, handler)));
        entries.len() != before
    }

    fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn snapshot(&self) -> Vec<ServiceEventSubscription> {
        self.entries.lock().iter().map(|sub| sub.info.clone()).collect()
    }
}

/// Gestionnaire des souscriptions aux événements des services UPnP
pub struct ServicesEventing {
    table: Arc<SubscriptionTable>,
    server: Mutex<Option<CallbackServer>>,
    callback_port: AtomicU16,
    io_timeout: Duration,
    executor: Arc<dyn ConnectionExecutor>,
}

static GLOBAL_EVENTING: Lazy<ServicesEventing> =
    Lazy::new(|| ServicesEventing::new(get_config().get_eventing_settings()));

impl ServicesEventing {
    pub fn new(settings: EventingSettings) -> Self {
        Self::with_executor(settings, Arc::new(ThreadPerConnection))
    }

    /// Utilise `executor` pour traiter les connexions NOTIFY
    pub fn with_executor(settings: EventingSettings, executor: Arc<dyn ConnectionExecutor>) -> Self {
        Self {
            table: Arc::new(SubscriptionTable::default()),
            server: Mutex::new(None),
            callback_port: AtomicU16::new(settings.callback_port),
            io_timeout: settings.io_timeout(),
            executor,
        }
    }

    /// Instance partagée du processus, configurée par `pmoconfig`
    pub fn global() -> &'static ServicesEventing {
        &GLOBAL_EVENTING
    }

    /// Port du serveur de callback
    ///
    /// Un port 0 est remplacé par le port attribué au premier démarrage, pour
    /// que les URLs de callback déjà envoyées restent valides après un
    /// redémarrage du serveur.
    pub fn callback_port(&self) -> u16 {
        self.callback_port.load(Ordering::Acquire)
    }

    /// Change le port du serveur de callback
    ///
    /// Pris en compte au prochain démarrage du serveur.
    pub fn set_callback_port(&self, port: u16) {
        self.callback_port.store(port, Ordering::Release);
    }

    /// Adresse effective du serveur de callback s'il tourne
    pub fn callback_addr(&self) -> Option<SocketAddr> {
        self.server.lock().as_ref().map(CallbackServer::local_addr)
    }

    pub fn is_server_running(&self) -> bool {
        self.server.lock().is_some()
    }

    pub fn subscriptions(&self) -> Vec<ServiceEventSubscription> {
        self.table.snapshot()
    }

    /// Souscrit aux événements de `service`
    ///
    /// Retourne `None` si le service n'a pas d'URL d'événements ou si le
    /// device refuse la souscription. Les erreurs réseau sont propagées.
    /// Une souscription existante pour le même couple (service, handler)
    /// est d'abord résiliée.
    pub fn register_event(
        &self,
        service: &UpnpService,
        handler: Arc<dyn ServiceEventHandler>,
        duration: SubscriptionDuration,
    ) -> Result<Option<ServiceEventSubscription>> {
        let Some(event_url) = service.event_sub_url.as_ref() else {
            debug!(service = %service.service_id, "Service has no eventSubURL");
            return Ok(None);
        };

        if let Some(stale) = self.table.find_by_service(service, &handler) {
            debug!(sid = %stale.info.sid, "Replacing existing subscription");
            self.unregister(service, &handler)?;
        }

        let callback_port = self.ensure_server()?;
        let device = resolve(event_url)?;
        let local_ip = pmoutils::local_ip_for(device)?;
        let request = build_subscribe_request(event_url, local_ip, callback_port, duration)?;
        debug!("SUBSCRIBE request\n{}", request);

        let (raw, device_ip) = exchange(device, &request, self.io_timeout)?;
        debug!("SUBSCRIBE response\n{}", raw);
        if raw.trim().is_empty() {
            warn!(url = %event_url, "Empty SUBSCRIBE response");
            return Ok(None);
        }

        let response = match HttpResponse::parse(&raw) {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %event_url, error = %e, "Malformed SUBSCRIBE response");
                return Ok(None);
            }
        };
        if !response.header().starts_with("HTTP/1.1 200 OK") {
            log_device_error("SUBSCRIBE", &response);
            return Ok(None);
        }

        let sid = match response.header_field("SID") {
            Ok(sid) => sid.to_string(),
            Err(e) => {
                warn!(url = %event_url, error = %e, "SUBSCRIBE response without SID");
                return Ok(None);
            }
        };
        let duration_secs = match response.header_field("TIMEOUT") {
            Ok(value) => parse_timeout_header(value).unwrap_or_else(|| {
                warn!(timeout = value, "Unparsable TIMEOUT, keeping requested duration");
                duration.as_secs()
            }),
            Err(_) => duration.as_secs(),
        };

        let info = ServiceEventSubscription {
            service_type: service.service_type.clone(),
            service_id: service.service_id.clone(),
            service_url: event_url.clone(),
            sid,
            device_ip,
            duration_secs,
        };
        {
            // sous le verrou du serveur : un unregister concurrent ne peut
            // plus l'arrêter entre l'insertion et la vérification
            let mut server = self.server.lock();
            self.table.insert(Subscription {
                info: info.clone(),
                handler,
            });
            self.ensure_server_locked(&mut server)?;
        }

        info!(
            sid = %info.sid,
            service = %info.service_id,
            device = %info.device_ip,
            duration = info.duration_secs,
            "Subscribed to service events"
        );
        Ok(Some(info))
    }

    /// Comme [`register_event`](Self::register_event), en retournant la durée
    /// accordée (0 pour infinie) ou -1 si aucune souscription n'a été créée
    pub fn register(
        &self,
        service: &UpnpService,
        handler: Arc<dyn ServiceEventHandler>,
        duration: SubscriptionDuration,
    ) -> Result<i64> {
        Ok(self
            .register_event(service, handler, duration)?
            .map_or(-1, |sub| i64::from(sub.duration_secs)))
    }

    /// Résilie la souscription de `handler` à `service`
    ///
    /// Retourne `false` si aucune souscription ne correspond. Si l'envoi de
    /// l'UNSUBSCRIBE échoue, l'erreur est propagée et la souscription gardée.
    pub fn unregister(
        &self,
        service: &UpnpService,
        handler: &Arc<dyn ServiceEventHandler>,
    ) -> Result<bool> {
        let Some(event_url) = service.event_sub_url.as_ref() else {
            return Ok(false);
        };
        let Some(subscription) = self.table.find_by_service(service, handler) else {
            return Ok(false);
        };

        let request = build_unsubscribe_request(event_url, &subscription.info.sid)?;
        let device = resolve(event_url)?;
        let (raw, _) = exchange(device, &request, self.io_timeout)?;
        match HttpResponse::parse(&raw) {
            Ok(response) if response.header().starts_with("HTTP/1.1 200") => {
                debug!(sid = %subscription.info.sid, "UNSUBSCRIBE accepted");
            }
            Ok(response) => log_device_error("UNSUBSCRIBE", &response),
            Err(e) => debug!(sid = %subscription.info.sid, error = %e, "Unparsable UNSUBSCRIBE response"),
        }

        let mut server = self.server.lock();
        self.table.remove(&subscription.info.sid, handler);
        if self.table.is_empty() {
            if let Some(server) = server.take() {
                server.stop();
            }
        }
        info!(sid = %subscription.info.sid, "Unsubscribed from service events");
        Ok(true)
    }

    /// Démarre le serveur de callback si besoin et retourne son port
    fn ensure_server(&self) -> Result<u16> {
        let mut server = self.server.lock();
        self.ensure_server_locked(&mut server)
    }

    fn ensure_server_locked(&self, server: &mut Option<CallbackServer>) -> Result<u16> {
        if let Some(running) = server.as_ref() {
            return Ok(running.local_addr().port());
        }
        let started = CallbackServer::start(
            self.callback_port(),
            Arc::clone(&self.table),
            Arc::clone(&self.executor),
            self.io_timeout,
        )?;
        let port = started.local_addr().port();
        if self
            .callback_port
            .compare_exchange(0, port, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!(port, "Callback port pinned");
        }
        *server = Some(started);
        Ok(port)
    }
}

/// Trace un refus du device, en distinguant un SOAP fault d'un simple statut
fn log_device_error(operation: &str, response: &HttpResponse) {
    let status = response
        .header()
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    let error = match response.body().and_then(parse_soap_fault) {
        Some(fault) => fault.into_device_error(status),
        None => SsdpError::Device {
            code: status,
            description: response.header().to_string(),
        },
    };
    warn!(operation, error = %error, "Device refused request");
}
