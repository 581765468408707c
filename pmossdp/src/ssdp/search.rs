//! Émission des requêtes M-SEARCH

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use crate::config_ext::SsdpSettings;

/// Construit le datagramme M-SEARCH
pub fn build_msearch(search_target: &str, mx: u32) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: 239.255.255.250:1900\r\n\
         ST: {}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: {}\r\n\
         \r\n",
        search_target, mx
    )
}

/// Émetteur de M-SEARCH vers le groupe SSDP
#[derive(Debug, Clone)]
pub struct SearchSender {
    group: SocketAddrV4,
}

impl SearchSender {
    pub fn new(settings: &SsdpSettings) -> Self {
        Self {
            group: SocketAddrV4::new(settings.multicast_addr, settings.port),
        }
    }

    /// Envoie un M-SEARCH depuis `src:bind_port`
    ///
    /// Le port est partagé avec le [`DiscoveryListener`](super::DiscoveryListener)
    /// (SO_REUSEADDR) pour que les réponses unicast lui parviennent.
    pub fn send_search_message(
        &self,
        src: Ipv4Addr,
        bind_port: u16,
        ttl: u32,
        mx: u32,
        search_target: &str,
    ) -> io::Result<()> {
        let socket2 = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket2.set_reuse_address(true)?;
        socket2.bind(&SocketAddr::V4(SocketAddrV4::new(src, bind_port)).into())?;
        socket2.set_multicast_if_v4(&src)?;

        let socket: UdpSocket = socket2.into();
        socket.set_multicast_ttl_v4(ttl)?;

        let msg = build_msearch(search_target, mx);
        socket.send_to(msg.as_bytes(), self.group)?;

        debug!(
            src = %src,
            st = search_target,
            mx,
            "📤 M-SEARCH sent\n<details>\n\n```\n{}\n```\n</details>\n",
            msg
        );
        Ok(())
    }
}
