//! Descriptions de devices UPnP (`description.xml`)
//!
//! La découverte délègue la construction des devices à un
//! [`DeviceDescriptionLoader`]. [`HttpDescriptionLoader`] télécharge la
//! description pointée par `LOCATION` et la transforme en [`RootDevice`].

use std::time::Duration;

use tracing::debug;
use ureq::Agent;
use url::Url;
use xmltree::Element;

use crate::errors::{Result, SsdpError};
use crate::soap::{child_text, xml_children};
use crate::ssdp::SearchResponse;

/// Service déclaré dans une description de device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpnpService {
    pub service_type: String,
    pub service_id: String,
    pub scpd_url: Option<Url>,
    pub control_url: Option<Url>,
    /// URL de souscription aux événements ; absente si le service n'émet rien
    pub event_sub_url: Option<Url>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpnpDevice {
    pub device_type: String,
    pub friendly_name: String,
    pub manufacturer: String,
    pub model_name: String,
    pub udn: String,
    pub services: Vec<UpnpService>,
    pub devices: Vec<UpnpDevice>,
}

impl UpnpDevice {
    /// Cherche un service de ce device ou de ses sous-devices
    pub fn find_service(&self, service_type: &str) -> Option<&UpnpService> {
        self.services
            .iter()
            .find(|s| s.service_type == service_type)
            .or_else(|| self.devices.iter().find_map(|d| d.find_service(service_type)))
    }

    /// Cherche ce device ou un sous-device par type
    pub fn find_device(&self, device_type: &str) -> Option<&UpnpDevice> {
        if self.device_type == device_type {
            return Some(self);
        }
        self.devices.iter().find_map(|d| d.find_device(device_type))
    }
}

/// Device racine découvert, avec son identité SSDP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootDevice {
    pub usn: String,
    pub udn: String,
    pub location: Url,
    pub max_age: u32,
    /// En-tête `SERVER` de la réponse de découverte
    pub firmware: String,
    /// Base de résolution des URLs relatives (`URLBase` ou `LOCATION`)
    pub url_base: Url,
    pub device: UpnpDevice,
}

/// Construit un device à partir d'une réponse de découverte.
///
/// Appelé sur le thread du démon de découverte.
pub trait DeviceDescriptionLoader: Send + Sync + 'static {
    type Device: Send + 'static;

    fn load(&self, response: &SearchResponse) -> Result<Self::Device>;
}

/// Chargeur HTTP des descriptions (`ureq` + `xmltree`)
#[derive(Debug, Clone)]
pub struct HttpDescriptionLoader {
    timeout: Duration,
}

impl Default for HttpDescriptionLoader {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl HttpDescriptionLoader {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn fetch(&self, location: &Url) -> Result<String> {
        let agent: Agent = Agent::config_builder()
            .timeout_global(Some(self.timeout))
            .build()
            .into();

        let response = agent
            .get(location.as_str())
            .call()
            .map_err(|e| SsdpError::Description(format!("GET {}: {}", location, e)))?;
        let mut body = response.into_body();
        body.read_to_string()
            .map_err(|e| SsdpError::Description(format!("reading {}: {}", location, e)))
    }
}

impl DeviceDescriptionLoader for HttpDescriptionLoader {
    type Device = RootDevice;

    fn load(&self, response: &SearchResponse) -> Result<RootDevice> {
        debug!(udn = %response.udn, location = %response.location, "Fetching description");
        let xml = self.fetch(&response.location)?;
        let (url_base, device) = parse_description(&xml, &response.location)?;

        Ok(RootDevice {
            usn: response.usn.clone(),
            udn: response.udn.clone(),
            location: response.location.clone(),
            max_age: response.max_age,
            firmware: response.server.clone(),
            url_base,
            device,
        })
    }
}

/// Analyse un document `description.xml`
///
/// Retourne la base de résolution des URLs et le device racine. Les URLs
/// relatives sont résolues contre `URLBase` s'il est présent, sinon contre
/// `location`.
pub fn parse_description(xml: &str, location: &Url) -> Result<(Url, UpnpDevice)> {
    let root = Element::parse(xml.trim().as_bytes())?;

    let url_base = child_text(&root, "URLBase")
        .filter(|base| !base.is_empty())
        .and_then(|base| Url::parse(&base).ok())
        .unwrap_or_else(|| location.clone());

    let device = root
        .get_child("device")
        .ok_or_else(|| SsdpError::Description("missing <device> element".to_string()))?;

    Ok((url_base.clone(), parse_device(device, &url_base)))
}

fn parse_device(element: &Element, base: &Url) -> UpnpDevice {
    let text = |name: &str| child_text(element, name).unwrap_or_default();

    let services = element
        .get_child("serviceList")
        .map(|list| {
            xml_children(list)
                .filter(|child| child.name == "service")
                .filter_map(|service| parse_service(service, base))
                .collect()
        })
        .unwrap_or_default();

    let devices = element
        .get_child("deviceList")
        .map(|list| {
            xml_children(list)
                .filter(|child| child.name == "device")
                .map(|device| parse_device(device, base))
                .collect()
        })
        .unwrap_or_default();

    UpnpDevice {
        device_type: text("deviceType"),
        friendly_name: text("friendlyName"),
        manufacturer: text("manufacturer"),
        model_name: text("modelName"),
        udn: text("UDN"),
        services,
        devices,
    }
}

fn parse_service(element: &Element, base: &Url) -> Option<UpnpService> {
    let service_type = child_text(element, "serviceType").filter(|t| !t.is_empty())?;
    let url = |name: &str| {
        child_text(element, name)
            .filter(|u| !u.is_empty())
            .and_then(|u| base.join(&u).ok())
    };

    Some(UpnpService {
        service_id: child_text(element, "serviceId").unwrap_or_default(),
        scpd_url: url("SCPDURL"),
        control_url: url("controlURL"),
        event_sub_url: url("eventSubURL"),
        service_type,
    })
}
