//! Extension pour intégrer la configuration SSDP/GENA dans pmoconfig
//!
//! Ce module fournit le trait `SsdpConfigExt` qui ajoute à `pmoconfig::Config`
//! des accesseurs typés pour les clés `upnp.ssdp.*` et `upnp.eventing.*`, et
//! construit les valeurs [`SsdpSettings`] / [`EventingSettings`] injectées dans
//! les listeners et le gestionnaire d'événements.

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::Result;
use pmoconfig::Config;
use serde::Deserialize;
use serde_yaml::Value;
use tracing::warn;

pub const DEFAULT_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const DEFAULT_SSDP_PORT: u16 = 1900;
pub const DEFAULT_SEARCH_PORT: u16 = 1901;
pub const DEFAULT_TTL: u32 = 4;
pub const DEFAULT_MX: u32 = 3;
pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 1500;
pub const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 250;
pub const DEFAULT_CALLBACK_PORT: u16 = 9999;
pub const DEFAULT_IO_TIMEOUT_SECS: u64 = 30;

const SSDP_SECTION: [&str; 2] = ["upnp", "ssdp"];
const EVENTING_SECTION: [&str; 2] = ["upnp", "eventing"];

/// Réglages SSDP partagés par les deux listeners et la façade de découverte.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SsdpSettings {
    pub multicast_addr: Ipv4Addr,
    /// Port des annonces NOTIFY (écoute de l'AdvertisementListener)
    pub port: u16,
    /// Port local d'émission des M-SEARCH et de réception des réponses
    pub search_port: u16,
    pub ttl: u32,
    pub mx: u32,
    pub discovery_timeout_ms: u64,
    pub receive_timeout_ms: u64,
    /// Rejette les messages dont l'hôte de LOCATION n'est pas l'émetteur UDP
    pub match_ip: bool,
}

impl Default for SsdpSettings {
    fn default() -> Self {
        Self {
            multicast_addr: DEFAULT_MULTICAST_ADDR,
            port: DEFAULT_SSDP_PORT,
            search_port: DEFAULT_SEARCH_PORT,
            ttl: DEFAULT_TTL,
            mx: DEFAULT_MX,
            discovery_timeout_ms: DEFAULT_DISCOVERY_TIMEOUT_MS,
            receive_timeout_ms: DEFAULT_RECEIVE_TIMEOUT_MS,
            match_ip: true,
        }
    }
}

impl SsdpSettings {
    pub fn receive_timeout(&self) -> Duration {
        // un timeout nul désactiverait le timeout de lecture
        Duration::from_millis(self.receive_timeout_ms.max(1))
    }
}

/// Réglages du gestionnaire d'abonnements GENA.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EventingSettings {
    pub callback_port: u16,
    pub io_timeout_secs: u64,
}

impl Default for EventingSettings {
    fn default() -> Self {
        Self {
            callback_port: DEFAULT_CALLBACK_PORT,
            io_timeout_secs: DEFAULT_IO_TIMEOUT_SECS,
        }
    }
}

impl EventingSettings {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs.max(1))
    }
}

/// Trait d'extension pour ajouter la configuration SSDP à pmoconfig
///
/// # Exemple
///
/// ```rust,ignore
/// use pmoconfig::get_config;
/// use pmossdp::SsdpConfigExt;
///
/// let config = get_config();
/// config.set_ssdp_match_ip(false)?;
/// let listener = pmossdp::DiscoveryListener::new(config.get_ssdp_settings());
/// ```
pub trait SsdpConfigExt {
    /// Construit les réglages SSDP depuis la section `upnp.ssdp`
    ///
    /// Une section absente ou mal typée donne les valeurs par défaut.
    fn get_ssdp_settings(&self) -> SsdpSettings;

    /// Construit les réglages GENA depuis la section `upnp.eventing`
    fn get_eventing_settings(&self) -> EventingSettings;

    /// Récupère le contrôle d'adresse IP des annonces (défaut: true)
    fn get_ssdp_match_ip(&self) -> bool;

    /// Active ou désactive le contrôle d'adresse IP des annonces
    fn set_ssdp_match_ip(&self, enabled: bool) -> Result<()>;

    /// Récupère le port local des M-SEARCH (défaut: 1901)
    fn get_ssdp_search_port(&self) -> u16;

    fn set_ssdp_search_port(&self, port: u16) -> Result<()>;

    /// Récupère le TTL multicast par défaut (défaut: 4)
    fn get_ssdp_ttl(&self) -> u32;

    fn set_ssdp_ttl(&self, ttl: u32) -> Result<()>;

    /// Récupère le port du serveur de callback GENA (défaut: 9999)
    fn get_eventing_callback_port(&self) -> u16;

    fn set_eventing_callback_port(&self, port: u16) -> Result<()>;
}

impl SsdpConfigExt for Config {
    fn get_ssdp_settings(&self) -> SsdpSettings {
        match self.get_section::<SsdpSettings>(&SSDP_SECTION) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(error = %e, "Invalid upnp.ssdp section, using defaults");
                SsdpSettings::default()
            }
        }
    }

    fn get_eventing_settings(&self) -> EventingSettings {
        match self.get_section::<EventingSettings>(&EVENTING_SECTION) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(error = %e, "Invalid upnp.eventing section, using defaults");
                EventingSettings::default()
            }
        }
    }

    fn get_ssdp_match_ip(&self) -> bool {
        self.get_bool_or(&["upnp", "ssdp", "match_ip"], true)
    }

    fn set_ssdp_match_ip(&self, enabled: bool) -> Result<()> {
        self.set_value(&["upnp", "ssdp", "match_ip"], Value::Bool(enabled))
    }

    fn get_ssdp_search_port(&self) -> u16 {
        self.get_u16_or(&["upnp", "ssdp", "search_port"], DEFAULT_SEARCH_PORT)
    }

    fn set_ssdp_search_port(&self, port: u16) -> Result<()> {
        self.set_value(
            &["upnp", "ssdp", "search_port"],
            Value::Number(port.into()),
        )
    }

    fn get_ssdp_ttl(&self) -> u32 {
        match self.get_value(&["upnp", "ssdp", "ttl"]) {
            Ok(Value::Number(n)) => n
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(DEFAULT_TTL),
            _ => DEFAULT_TTL,
        }
    }

    fn set_ssdp_ttl(&self, ttl: u32) -> Result<()> {
        self.set_value(&["upnp", "ssdp", "ttl"], Value::Number(ttl.into()))
    }

    fn get_eventing_callback_port(&self) -> u16 {
        self.get_u16_or(&["upnp", "eventing", "callback_port"], DEFAULT_CALLBACK_PORT)
    }

    fn set_eventing_callback_port(&self, port: u16) -> Result<()> {
        self.set_value(
            &["upnp", "eventing", "callback_port"],
            Value::Number(port.into()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_embedded_yaml() {
        let config = Config::from_yaml_str("").unwrap();

        assert_eq!(config.get_ssdp_settings(), SsdpSettings::default());
        assert_eq!(config.get_eventing_settings(), EventingSettings::default());
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config = Config::from_yaml_str("upnp:\n  ssdp:\n    match_ip: false\n    ttl: 8\n").unwrap();
        let settings = config.get_ssdp_settings();

        assert!(!settings.match_ip);
        assert_eq!(settings.ttl, 8);
        assert_eq!(settings.search_port, DEFAULT_SEARCH_PORT);
        assert_eq!(settings.multicast_addr, DEFAULT_MULTICAST_ADDR);
    }

    #[test]
    fn test_setters_are_visible_in_settings() {
        let config = Config::from_yaml_str("").unwrap();
        config.set_ssdp_match_ip(false).unwrap();
        config.set_ssdp_search_port(0).unwrap();
        config.set_eventing_callback_port(12345).unwrap();

        assert!(!config.get_ssdp_match_ip());
        assert_eq!(config.get_ssdp_settings().search_port, 0);
        assert_eq!(config.get_eventing_settings().callback_port, 12345);
    }

    #[test]
    fn test_invalid_section_falls_back_to_defaults() {
        let config = Config::from_yaml_str("upnp:\n  ssdp:\n    port: not-a-port\n").unwrap();

        assert_eq!(config.get_ssdp_settings(), SsdpSettings::default());
    }
}
