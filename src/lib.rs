pub mod chains;
pub mod comm;
pub mod config;
pub mod crypto;
pub mod keyshare;
pub mod relayer;
pub mod store;
pub mod topology;
pub mod tss;

pub use comm::{Communication, PeerTransport, SessionBus};
pub use config::{load_config, RelayerConfig};
pub use crypto::{Keypair, PeerId};
pub use relayer::Relayer;
pub use store::{BlockStore, PropStatus, PropStore};
pub use topology::{load_topology, NetworkTopology};
pub use tss::{Coordinator, CoordinatorConfig};
