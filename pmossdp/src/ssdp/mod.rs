//! # Module SSDP - Simple Service Discovery Protocol
//!
//! Ce module implémente la partie *control point* du protocole SSDP :
//! envoi de M-SEARCH, réception des réponses et écoute des annonces
//! NOTIFY alive/byebye.
//!
//! ## Architecture
//!
//! - [`HttpResponse`] / [`HttpRequest`] : messages HTTP-lite stricts et tolérants
//! - [`MulticastTransport`] : socket multicast lié (groupe, TTL, timeout)
//! - [`SearchSender`] : émission des M-SEARCH depuis une interface donnée
//! - [`DiscoveryListener`] : démon recevant les réponses aux recherches
//! - [`AdvertisementListener`] : démon recevant les annonces alive/byebye
//!
//! Chaque listener possède un thread démon démarré à la première
//! inscription et arrêté quand la dernière inscription disparaît.

mod advertisement;
mod daemon;
mod device;
mod listener;
mod message;
mod registry;
mod search;
mod transport;

pub use advertisement::{AdvertisementListener, DiscoveryEventHandler, NotificationKind};
pub use daemon::DaemonPhase;
pub use device::{AliveEvent, ByeByeEvent, SearchResponse};
pub use listener::{DiscoveryListener, DiscoveryResultsHandler};
pub use message::{HttpRequest, HttpResponse};
pub use search::{SearchSender, build_msearch};
pub use transport::MulticastTransport;

/// Cible de recherche des devices racine
pub const ROOT_DEVICES: &str = "upnp:rootdevice";

/// Cible de recherche de tous les devices et services
pub const ALL_DEVICES: &str = "ssdp:all";

/// Clé d'inscription recevant les annonces de tous les types (NT)
pub const NT_ALL_EVENTS: &str = "DiscoveryAdvertisement:nt:allevents";

/// Taille du tampon de réception des datagrammes
pub(crate) const RECEIVE_BUFFER_SIZE: usize = 8192;

/// Extrait l'UDN d'un USN
///
/// `uuid:abc::upnp:rootdevice` donne `uuid:abc` ; un USN sans `::` est déjà
/// un UDN.
pub fn derive_udn(usn: &str) -> &str {
    match usn.find("::") {
        Some(index) => &usn[..index],
        None => usn,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_udn_truncates_at_first_separator() {
        assert_eq!(derive_udn("uuid:abc::upnp:rootdevice"), "uuid:abc");
        assert_eq!(
            derive_udn("uuid:abc::urn:schemas-upnp-org:service:AVTransport:1"),
            "uuid:abc"
        );
        assert_eq!(derive_udn("uuid:a::b::c"), "uuid:a");
    }

    #[test]
    fn test_derive_udn_without_separator_is_identity() {
        assert_eq!(derive_udn("uuid:abc"), "uuid:abc");
        assert_eq!(derive_udn(""), "");
    }
}
