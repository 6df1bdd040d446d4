//! mesh-core — shared types, wire format, and cryptographic primitives for
//! the Layer 8 mesh interface layer. `mesh-runtime` depends on this crate
//! for everything that doesn't need an async runtime.

pub mod config;
pub mod crypto;
pub mod message;
pub mod wire;

pub use config::{ServiceRegistry, SystemConfig};
pub use crypto::{CryptoError, SecurityProvider};
pub use message::Message;
pub use wire::{Action, MulticastMode, Priority, TransactionState, WireError};
