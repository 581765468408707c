/// Utilitaires réseau partagés par les crates du workspace.
///
/// Ce module fournit des fonctions pour détecter les adresses IP
/// des interfaces réseau locales de la machine.
///
/// # Fonctions principales
///
/// - [`list_ipv4_addrs`] : Liste les adresses IPv4 non-loopback, éventuellement pour une seule interface
/// - [`local_ip_for`] : Adresse locale que le système utiliserait pour joindre un pair donné
///
/// # Examples
///
/// ```no_run
/// use pmoutils::list_ipv4_addrs;
///
/// for ip in list_ipv4_addrs(None)? {
///     println!("Adresse IPv4 locale: {}", ip);
/// }
/// # Ok::<(), std::io::Error>(())
/// ```
mod ip_utils;

pub use ip_utils::{list_ipv4_addrs, local_ip_for};
