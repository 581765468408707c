//! Souscriptions GENA : requêtes SUBSCRIBE / UNSUBSCRIBE

use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use url::Url;

use crate::errors::{Result, SsdpError};

/// Durée demandée pour une souscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionDuration {
    Seconds(u32),
    Infinite,
}

impl SubscriptionDuration {
    /// Valeur de l'en-tête `TIMEOUT`
    pub fn header_value(&self) -> String {
        match self {
            SubscriptionDuration::Seconds(secs) => format!("Second-{}", secs),
            SubscriptionDuration::Infinite => "Second-infinite".to_string(),
        }
    }

    /// Durée en secondes, 0 pour une souscription infinie
    pub fn as_secs(&self) -> u32 {
        match self {
            SubscriptionDuration::Seconds(secs) => *secs,
            SubscriptionDuration::Infinite => 0,
        }
    }
}

/// Souscription acceptée par un device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEventSubscription {
    pub service_type: String,
    pub service_id: String,
    /// URL de souscription du service
    pub service_url: Url,
    pub sid: String,
    /// Adresse du device ayant accepté la souscription
    pub device_ip: IpAddr,
    /// Durée accordée en secondes ; 0 signifie infinie
    pub duration_secs: u32,
}

/// Chemin de requête de l'URL (chemin et requête)
pub(crate) fn request_path(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

pub(crate) fn host_port(url: &Url) -> Result<(String, u16)> {
    let host = url
        .host_str()
        .ok_or_else(|| SsdpError::invalid_url(url.as_str(), "missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| SsdpError::invalid_url(url.as_str(), "missing port"))?;
    Ok((host.to_string(), port))
}

pub(crate) fn resolve(url: &Url) -> Result<SocketAddr> {
    let (host, port) = host_port(url)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| SsdpError::invalid_url(url.as_str(), "host does not resolve"))
}

pub(crate) fn build_subscribe_request(
    event_url: &Url,
    callback_ip: IpAddr,
    callback_port: u16,
    duration: SubscriptionDuration,
) -> Result<String> {
    let (host, port) = host_port(event_url)?;
    let path = request_path(event_url);
    let callback_host = match callback_ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{}]", v6),
    };

    Ok(format!(
        "SUBSCRIBE {path} HTTP/1.1\r\n\
         HOST: {host}:{port}\r\n\
         CALLBACK: <http://{callback_host}:{callback_port}{path}>\r\n\
         NT: upnp:event\r\n\
         Connection: close\r\n\
         TIMEOUT: {timeout}\r\n\r\n",
        timeout = duration.header_value()
    ))
}

pub(crate) fn build_unsubscribe_request(event_url: &Url, sid: &str) -> Result<String> {
    let (host, port) = host_port(event_url)?;
    Ok(format!(
        "UNSUBSCRIBE {} HTTP/1.1\r\nHOST: {}:{}\r\nSID: {}\r\n\r\n",
        request_path(event_url),
        host,
        port,
        sid
    ))
}

/// Lit la durée accordée dans `TIMEOUT` (`Second-1800`, `Second-infinite` → 0)
pub(crate) fn parse_timeout_header(value: &str) -> Option<u32> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("Second-infinite") {
        return Some(0);
    }
    let prefix = value.get(..7)?;
    if !prefix.eq_ignore_ascii_case("Second-") {
        return None;
    }
    value[7..].trim().parse().ok()
}

/// Envoie `request` sur une nouvelle connexion et lit la réponse jusqu'à EOF
///
/// Retourne la réponse brute et l'adresse du pair.
pub(crate) fn exchange(
    addr: SocketAddr,
    request: &str,
    timeout: Duration,
) -> Result<(String, IpAddr)> {
    let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    stream.write_all(request.as_bytes())?;
    stream.flush()?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw)?;
    let peer = stream.peer_addr().map(|a| a.ip()).unwrap_or(addr.ip());

    Ok((String::from_utf8_lossy(&raw).into_owned(), peer))
}
