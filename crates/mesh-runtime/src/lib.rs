//! mesh-runtime — the async I/O half of the Layer 8 mesh interface layer:
//! framing, the connection handshake, and the VNic dispatch surface.
//! Everything here builds on `mesh-core`'s pure types and wire codec.

pub mod error;
pub mod frame;
pub mod handshake;
pub mod pending;
pub mod providers;
pub mod transaction;
pub mod vnic;

pub use error::RuntimeError;
pub use pending::PendingTable;
pub use providers::{ProviderInfo, ProviderRegistry};
pub use transaction::{epoch_seconds, TransactionTracker};
pub use vnic::{DispatchConfig, ServiceHandler, VNic};
