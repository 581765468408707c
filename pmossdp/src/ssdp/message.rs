//! Messages HTTP-lite échangés sur UDP (SSDP) et TCP (GENA)
//!
//! Deux contrats coexistent :
//!
//! - [`HttpResponse`] est strict : toute ligne d'en-tête sans `:` rejette le
//!   message et les accesseurs échouent avec une erreur distincte quand un
//!   champ manque. Il sert aux réponses M-SEARCH, aux annonces NOTIFY et aux
//!   réponses SUBSCRIBE.
//! - [`HttpRequest`] est tolérant : les lignes sans `:` sont ignorées, les
//!   accesseurs renvoient `None`, et la ligne de commande est décomposée. Il
//!   sert aux requêtes NOTIFY reçues par le serveur de callback.

use std::collections::HashMap;

use tracing::trace;

use crate::errors::{Result, SsdpError};

#[derive(Debug, Clone, PartialEq, Eq)]
struct RawMessage {
    header: String,
    fields: HashMap<String, String>,
    body: Option<String>,
}

impl RawMessage {
    fn parse(raw: &str, strict: bool) -> Result<Self> {
        if raw.trim().is_empty() {
            return Err(SsdpError::EmptyMessage);
        }

        // CRLF attendu, LF seul toléré
        let mut lines = raw.split('\n').map(|line| line.strip_suffix('\r').unwrap_or(line));

        let header = lines.next().unwrap_or_default().trim().to_string();
        if header.is_empty() {
            return Err(SsdpError::MalformedHeader("missing start line".to_string()));
        }

        let mut fields = HashMap::new();
        let mut body: Option<String> = None;

        for line in lines {
            if let Some(body) = body.as_mut() {
                if !line.is_empty() {
                    body.push_str(line);
                    body.push_str("\r\n");
                }
                continue;
            }

            if line.trim().is_empty() {
                body = Some(String::new());
                continue;
            }

            match line.split_once(':') {
                Some((name, value)) => {
                    fields.insert(name.trim().to_ascii_uppercase(), value.trim().to_string());
                }
                None if strict => {
                    return Err(SsdpError::MalformedHeader(line.to_string()));
                }
                None => trace!("Skipping line without colon: '{}'", line),
            }
        }

        Ok(Self {
            header,
            fields,
            body,
        })
    }

    fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(&name.to_ascii_uppercase())
            .map(String::as_str)
    }

    fn field_element(&self, name: &str, element: &str) -> Option<&str> {
        self.field(name)?.split(',').find_map(|token| {
            let token = token.trim();
            let starts = token
                .get(..element.len())
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case(element));
            if !starts {
                return None;
            }
            token.split_once('=').map(|(_, value)| value.trim())
        })
    }
}

/// Message HTTP-lite strict (réponses et annonces).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    inner: RawMessage,
}

impl HttpResponse {
    pub fn parse(raw: &str) -> Result<Self> {
        RawMessage::parse(raw, true).map(|inner| Self { inner })
    }

    /// Ligne de tête, nettoyée des espaces (`HTTP/1.1 200 OK`, `NOTIFY * HTTP/1.1`)
    pub fn header(&self) -> &str {
        &self.inner.header
    }

    pub fn body(&self) -> Option<&str> {
        self.inner.body.as_deref()
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.inner.field(name).is_some()
    }

    /// Valeur d'un champ, recherché sans tenir compte de la casse
    pub fn header_field(&self, name: &str) -> Result<&str> {
        self.inner
            .field(name)
            .ok_or_else(|| SsdpError::missing_field(name))
    }

    /// Élément `clé=valeur` d'un champ à valeurs séparées par des virgules
    ///
    /// `CACHE-CONTROL: no-cache, max-age = 1800` donne `"1800"` pour
    /// l'élément `max-age`.
    pub fn field_element(&self, name: &str, element: &str) -> Result<&str> {
        self.inner
            .field_element(name, element)
            .ok_or_else(|| SsdpError::missing_field_element(name, element))
    }
}

/// Message HTTP-lite tolérant (requêtes reçues).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    inner: RawMessage,
}

impl HttpRequest {
    pub fn parse(raw: &str) -> Result<Self> {
        RawMessage::parse(raw, false).map(|inner| Self { inner })
    }

    pub fn header(&self) -> &str {
        &self.inner.header
    }

    /// Méthode de la requête (`NOTIFY /path HTTP/1.1` → `NOTIFY`)
    pub fn command(&self) -> Option<&str> {
        self.inner.header.split_whitespace().next()
    }

    /// Argument de la méthode (`NOTIFY /path HTTP/1.1` → `/path`)
    pub fn command_arg(&self) -> Option<&str> {
        self.inner.header.split_whitespace().nth(1)
    }

    pub fn body(&self) -> Option<&str> {
        self.inner.body.as_deref()
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.inner.field(name)
    }

    pub fn field_element(&self, name: &str, element: &str) -> Option<&str> {
        self.inner.field_element(name, element)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEARCH_RESPONSE: &str = "HTTP/1.1 200 OK\r\n\
        CACHE-CONTROL: max-age = 1800\r\n\
        EXT:\r\n\
        LOCATION: http://192.168.1.10:8080/desc.xml\r\n\
        SERVER: Linux/5.10 UPnP/1.0 Test/1.0\r\n\
        ST: upnp:rootdevice\r\n\
        USN: uuid:abc::upnp:rootdevice\r\n\
        \r\n";

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let msg = HttpResponse::parse(SEARCH_RESPONSE).unwrap();

        assert_eq!(msg.header(), "HTTP/1.1 200 OK");
        assert_eq!(msg.header_field("location").unwrap(), "http://192.168.1.10:8080/desc.xml");
        assert_eq!(msg.header_field("Location").unwrap(), "http://192.168.1.10:8080/desc.xml");
        assert_eq!(msg.header_field("EXT").unwrap(), "");
    }

    #[test]
    fn test_field_element_with_spaces_around_equal() {
        let msg = HttpResponse::parse(SEARCH_RESPONSE).unwrap();

        assert_eq!(msg.field_element("CACHE-CONTROL", "max-age").unwrap(), "1800");
    }

    #[test]
    fn test_field_element_among_several_tokens() {
        let msg = HttpResponse::parse("HTTP/1.1 200 OK\r\nCache-Control: no-cache, MAX-AGE=60\r\n\r\n").unwrap();

        assert_eq!(msg.field_element("cache-control", "max-age").unwrap(), "60");
        assert!(matches!(
            msg.field_element("cache-control", "s-maxage"),
            Err(SsdpError::MissingFieldElement { .. })
        ));
    }

    #[test]
    fn test_missing_field_is_a_distinct_error() {
        let msg = HttpResponse::parse(SEARCH_RESPONSE).unwrap();

        assert!(matches!(msg.header_field("NTS"), Err(SsdpError::MissingField(name)) if name == "NTS"));
    }

    #[test]
    fn test_value_keeps_colons_after_the_first() {
        let msg = HttpResponse::parse(SEARCH_RESPONSE).unwrap();

        assert_eq!(msg.header_field("USN").unwrap(), "uuid:abc::upnp:rootdevice");
    }

    #[test]
    fn test_empty_message_is_rejected() {
        assert!(matches!(HttpResponse::parse(""), Err(SsdpError::EmptyMessage)));
        assert!(matches!(HttpResponse::parse(" \r\n \r\n"), Err(SsdpError::EmptyMessage)));
        assert!(matches!(HttpRequest::parse(""), Err(SsdpError::EmptyMessage)));
    }

    #[test]
    fn test_strict_rejects_colonless_header_line() {
        let raw = "HTTP/1.1 200 OK\r\nST: upnp:rootdevice\r\ngarbage line\r\n\r\n";

        assert!(matches!(HttpResponse::parse(raw), Err(SsdpError::MalformedHeader(_))));
    }

    #[test]
    fn test_lenient_skips_colonless_header_line() {
        let raw = "NOTIFY /event HTTP/1.1\r\ngarbage line\r\nSID: uuid:1\r\n\r\n";
        let msg = HttpRequest::parse(raw).unwrap();

        assert_eq!(msg.field("sid"), Some("uuid:1"));
        assert_eq!(msg.field("garbage line"), None);
    }

    #[test]
    fn test_request_exposes_command_and_argument() {
        let msg = HttpRequest::parse("NOTIFY /path HTTP/1.1\r\nNT: upnp:event\r\n\r\n").unwrap();

        assert_eq!(msg.command(), Some("NOTIFY"));
        assert_eq!(msg.command_arg(), Some("/path"));
        assert_eq!(msg.field("NTS"), None);
        assert_eq!(msg.field_element("NT", "foo"), None);
    }

    #[test]
    fn test_body_lines_are_crlf_terminated_and_blank_lines_dropped() {
        let raw = "NOTIFY / HTTP/1.1\r\nSID: x\r\n\r\n<a>\r\n\r\n<b/>\r\n</a>";
        let msg = HttpRequest::parse(raw).unwrap();

        assert_eq!(msg.body(), Some("<a>\r\n<b/>\r\n</a>\r\n"));
    }

    #[test]
    fn test_no_blank_line_means_no_body() {
        let msg = HttpResponse::parse("HTTP/1.1 200 OK\r\nSID: x").unwrap();

        assert_eq!(msg.body(), None);
    }

    #[test]
    fn test_bare_lf_is_tolerated() {
        let msg = HttpResponse::parse("HTTP/1.1 200 OK\nST: ssdp:all\n\n").unwrap();

        assert_eq!(msg.header_field("st").unwrap(), "ssdp:all");
        assert_eq!(msg.body(), Some(""));
    }
}
