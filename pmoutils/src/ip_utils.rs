use get_if_addrs::get_if_addrs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use tracing::trace;

/// Retourne l'adresse locale que le système utiliserait pour joindre `remote`.
///
/// Utilisé pour construire les URLs de callback annoncées aux devices : l'adresse
/// doit être joignable depuis le device, pas seulement depuis la machine.
pub fn local_ip_for(remote: SocketAddr) -> io::Result<IpAddr> {
    let bind_addr: SocketAddr = if remote.is_ipv6() {
        SocketAddr::from(([0u16; 8], 0))
    } else {
        SocketAddr::from(([0, 0, 0, 0], 0))
    };
    let socket = UdpSocket::bind(bind_addr)?;
    socket.connect(remote)?;
    Ok(socket.local_addr()?.ip())
}

/// Liste les adresses IPv4 non-loopback des interfaces réseau.
///
/// # Arguments
///
/// * `interface` - Nom d'interface (ex: `"eth0"`) pour restreindre la recherche,
///   ou `None` pour parcourir toutes les interfaces
///
/// # Returns
///
/// Les adresses dans l'ordre d'énumération du système, sans doublon.
/// Une interface inconnue donne une liste vide.
///
/// # Note
///
/// - Seules les adresses IPv4 sont retournées
/// - Les adresses de loopback (127.x.x.x) sont filtrées
pub fn list_ipv4_addrs(interface: Option<&str>) -> io::Result<Vec<Ipv4Addr>> {
    let mut result = Vec::new();

    for iface in get_if_addrs()? {
        if let Some(name) = interface {
            if iface.name != name {
                continue;
            }
        }
        match iface.ip() {
            IpAddr::V4(ipv4) if !ipv4.is_loopback() => {
                if !result.contains(&ipv4) {
                    result.push(ipv4);
                }
            }
            other => trace!(interface = %iface.name, ip = %other, "Skipping address"),
        }
    }

    Ok(result)
}
