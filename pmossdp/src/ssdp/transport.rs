//! Socket UDP multicast des listeners SSDP

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

/// Socket lié sur `0.0.0.0:port` et inscrit au groupe multicast SSDP.
///
/// Le groupe est quitté à la destruction.
#[derive(Debug)]
pub struct MulticastTransport {
    socket: UdpSocket,
    group: Ipv4Addr,
    joined: Vec<Ipv4Addr>,
}

impl MulticastTransport {
    /// Lie le socket et rejoint `group` sur chaque interface IPv4 non-loopback
    ///
    /// Un échec d'inscription au groupe n'est pas fatal : le socket reste
    /// utilisable pour les réponses unicast aux M-SEARCH.
    pub fn bind(
        port: u16,
        group: Ipv4Addr,
        ttl: u32,
        receive_timeout: Duration,
    ) -> io::Result<Self> {
        let socket2 = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket2.set_reuse_address(true)?;

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        socket2.bind(&SocketAddr::V4(bind_addr).into())?;

        let socket: UdpSocket = socket2.into();
        socket.set_read_timeout(Some(receive_timeout))?;
        socket.set_multicast_ttl_v4(ttl)?;

        let mut joined = Vec::new();
        let interfaces = match pmoutils::list_ipv4_addrs(None) {
            Ok(interfaces) => interfaces,
            Err(e) => {
                warn!("SSDP: cannot list interfaces: {}", e);
                Vec::new()
            }
        };
        for iface in interfaces {
            match socket.join_multicast_v4(&group, &iface) {
                Ok(()) => {
                    debug!("SSDP: joined {} on {}", group, iface);
                    joined.push(iface);
                }
                Err(e) => warn!("SSDP: failed to join {} on {}: {}", group, iface, e),
            }
        }
        if joined.is_empty() {
            match socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED) {
                Ok(()) => joined.push(Ipv4Addr::UNSPECIFIED),
                Err(e) => warn!("SSDP: failed to join {} on default interface: {}", group, e),
            }
        }

        Ok(Self {
            socket,
            group,
            joined,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Reçoit un datagramme ; `Ok(None)` quand le timeout de lecture expire
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for MulticastTransport {
    fn drop(&mut self) {
        for iface in &self.joined {
            if let Err(e) = self.socket.leave_multicast_v4(&self.group, iface) {
                debug!("SSDP: failed to leave {} on {}: {}", self.group, iface, e);
            }
        }
    }
}
