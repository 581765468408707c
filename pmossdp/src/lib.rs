//! # pmossdp - Control point UPnP : découverte SSDP et événements GENA
//!
//! Cette crate fournit la partie *control point* de la pile UPnP :
//!
//! - découverte des devices par M-SEARCH multicast ([`Discovery`]) ;
//! - écoute des réponses de recherche ([`DiscoveryListener`]) et des
//!   annonces alive/byebye ([`AdvertisementListener`]) par des démons
//!   démarrés à la demande ;
//! - abonnement aux événements des services et réception des NOTIFY
//!   ([`ServicesEventing`]).
//!
//! La configuration vient de `pmoconfig` via [`SsdpConfigExt`] ; chaque
//! listener peut aussi être construit avec ses propres [`SsdpSettings`].
//!
//! ## Exemple
//!
//! ```rust,ignore
//! use pmossdp::{Discovery, ROOT_DEVICES};
//!
//! let discovery = Discovery::with_defaults();
//! if let Some(devices) = discovery.discover_target(ROOT_DEVICES)? {
//!     for root in devices {
//!         println!("{} at {}", root.device.friendly_name, root.location);
//!     }
//! }
//! ```

pub mod config_ext;
pub mod description;
pub mod discovery;
pub mod errors;
pub mod eventing;
pub mod soap;
pub mod ssdp;

pub use crate::config_ext::{EventingSettings, SsdpConfigExt, SsdpSettings};
pub use crate::description::{
    DeviceDescriptionLoader, HttpDescriptionLoader, RootDevice, UpnpDevice, UpnpService,
};
pub use crate::discovery::{Discovery, DiscoveryOptions};
pub use crate::errors::{Result, SsdpError};
pub use crate::eventing::{
    ServiceEventHandler, ServiceEventSubscription, ServicesEventing, SubscriptionDuration,
};
pub use crate::ssdp::{
    ALL_DEVICES, AdvertisementListener, AliveEvent, ByeByeEvent, DaemonPhase,
    DiscoveryEventHandler, DiscoveryListener, DiscoveryResultsHandler, NT_ALL_EVENTS,
    NotificationKind, ROOT_DEVICES, SearchResponse,
};
