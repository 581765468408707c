//! Identités de devices extraites des messages SSDP

use std::net::SocketAddr;

use tracing::{debug, warn};
use url::Url;

/// Réponse à un M-SEARCH acceptée par le [`DiscoveryListener`](super::DiscoveryListener)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    pub usn: String,
    pub udn: String,
    /// Cible de recherche (`ST`) à laquelle le device a répondu
    pub st: String,
    pub max_age: u32,
    pub location: Url,
    /// En-tête `SERVER` (OS, version UPnP, produit)
    pub server: String,
    pub from: SocketAddr,
}

/// Annonce `ssdp:alive`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliveEvent {
    pub usn: String,
    pub udn: String,
    pub nt: String,
    pub max_age: u32,
    pub location: Url,
    pub from: SocketAddr,
}

/// Annonce `ssdp:byebye`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByeByeEvent {
    pub usn: String,
    pub udn: String,
    pub nt: String,
    pub from: SocketAddr,
}

/// Valide l'en-tête `LOCATION` d'un message reçu de `from`
///
/// Avec `match_ip`, l'hôte de l'URL est résolu et doit désigner l'émetteur
/// UDP ; sinon le message est ignoré.
pub(crate) fn checked_location(raw: &str, from: SocketAddr, match_ip: bool) -> Option<Url> {
    let location = match Url::parse(raw) {
        Ok(url) => url,
        Err(e) => {
            debug!(from = %from, location = raw, error = %e, "Invalid LOCATION, message dropped");
            return None;
        }
    };

    if match_ip && !location_matches_sender(&location, from) {
        warn!(
            from = %from,
            location = %location,
            "LOCATION host does not match sender, message dropped"
        );
        return None;
    }

    Some(location)
}

fn location_matches_sender(location: &Url, from: SocketAddr) -> bool {
    match location.socket_addrs(|| Some(80)) {
        Ok(addrs) => addrs.iter().any(|addr| addr.ip() == from.ip()),
        Err(e) => {
            warn!(location = %location, error = %e, "Cannot resolve LOCATION host");
            false
        }
    }
}

/// Lit la valeur de l'élément `max-age` (`"1800"`, `"1800;foo"` → 1800)
pub(crate) fn parse_max_age(value: &str) -> Option<u32> {
    let digits: String = value
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}
