//! SOAP Faults renvoyés par les devices UPnP

use xmltree::{Element, XMLNode};

use crate::errors::SsdpError;

/// Erreur SOAP (Fault)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapFault {
    /// Code d'erreur (ex: "s:Client")
    pub fault_code: String,

    /// Description de l'erreur
    pub fault_string: String,

    /// Détails UPnP optionnels
    pub upnp_error: Option<UpnpError>,
}

/// Erreur UPnP spécifique (`detail/UPnPError`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpnpError {
    /// Code d'erreur UPnP (ex: 401, 501)
    pub error_code: u32,

    pub error_description: String,
}

impl SoapFault {
    /// Convertit le fault en erreur device
    ///
    /// Le code UPnP est préféré au statut HTTP quand il est présent.
    pub fn into_device_error(self, http_status: u32) -> SsdpError {
        match self.upnp_error {
            Some(upnp) => SsdpError::Device {
                code: upnp.error_code,
                description: upnp.error_description,
            },
            None => SsdpError::Device {
                code: http_status,
                description: self.fault_string,
            },
        }
    }
}

/// Cherche un `Fault` SOAP dans un corps de réponse
///
/// Retourne `None` si le corps n'est pas du XML ou ne contient pas de fault.
pub fn parse_soap_fault(body: &str) -> Option<SoapFault> {
    let root = Element::parse(body.trim().as_bytes()).ok()?;
    let fault = find_element(&root, "Fault")?;

    let upnp_error = find_element(fault, "UPnPError").and_then(|err| {
        let error_code = child_text(err, "errorCode")?.parse().ok()?;
        Some(UpnpError {
            error_code,
            error_description: child_text(err, "errorDescription").unwrap_or_default(),
        })
    });

    Some(SoapFault {
        fault_code: child_text(fault, "faultcode").unwrap_or_default(),
        fault_string: child_text(fault, "faultstring").unwrap_or_default(),
        upnp_error,
    })
}

fn find_element<'a>(element: &'a Element, name: &str) -> Option<&'a Element> {
    if element.name == name {
        return Some(element);
    }
    xml_children(element).find_map(|child| find_element(child, name))
}

pub(crate) fn xml_children(element: &Element) -> impl Iterator<Item = &Element> {
    element.children.iter().filter_map(|node| match node {
        XMLNode::Element(elem) => Some(elem),
        _ => None,
    })
}

pub(crate) fn child_text(element: &Element, name: &str) -> Option<String> {
    xml_children(element)
        .find(|child| child.name == name)
        .and_then(|child| child.get_text().map(|text| text.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAULT: &str = r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
  <s:Body>
    <s:Fault>
      <faultcode>s:Client</faultcode>
      <faultstring>UPnPError</faultstring>
      <detail>
        <UPnPError xmlns="urn:schemas-upnp-org:control-1-0">
          <errorCode>412</errorCode>
          <errorDescription>Precondition Failed</errorDescription>
        </UPnPError>
      </detail>
    </s:Fault>
  </s:Body>
</s:Envelope>"#;

    #[test]
    fn test_parse_upnp_fault() {
        let fault = parse_soap_fault(FAULT).unwrap();

        assert_eq!(fault.fault_code, "s:Client");
        assert_eq!(fault.fault_string, "UPnPError");
        assert_eq!(
            fault.upnp_error,
            Some(UpnpError {
                error_code: 412,
                error_description: "Precondition Failed".to_string()
            })
        );
    }

    #[test]
    fn test_into_device_error_prefers_upnp_code() {
        let err = parse_soap_fault(FAULT).unwrap().into_device_error(500);

        assert!(matches!(err, SsdpError::Device { code: 412, ref description } if description == "Precondition Failed"));
    }

    #[test]
    fn test_plain_fault_uses_http_status() {
        let body = "<Envelope><Body><Fault><faultcode>Server</faultcode><faultstring>boom</faultstring></Fault></Body></Envelope>";
        let err = parse_soap_fault(body).unwrap().into_device_error(500);

        assert!(matches!(err, SsdpError::Device { code: 500, ref description } if description == "boom"));
    }

    #[test]
    fn test_non_fault_bodies() {
        assert!(parse_soap_fault("").is_none());
        assert!(parse_soap_fault("not xml").is_none());
        assert!(parse_soap_fault("<Envelope><Body/></Envelope>").is_none());
    }
}
