//! The five-step connection handshake (SPEC_FULL §4.C), grounded
//! directly on the original `nets.ExecuteProtocol`: both peers run the
//! identical routine — write, then read — at every step. There is no
//! initiator/responder asymmetry baked into the wire format; whichever
//! side's write lands on the socket first is simply first, and the
//! routine is safe to run unconditionally on both ends of a freshly
//! accepted or freshly dialed connection.
//!
//! Any error at steps 1-4 closes the connection and discards whatever
//! partial state was collected — `cfg` must not be read as valid after
//! an `Err` here. Step 5 (vnet exchange) is newer than the four-step
//! original and is deliberately tolerant of a peer that doesn't speak
//! it: a frame/decryption/protocol error there is logged and treated as
//! "no vnet exchanged," not a handshake failure, so this implementation
//! stays interoperable with peers built against the original four-step
//! protocol.

use mesh_core::{SecurityProvider, ServiceRegistry, SystemConfig};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::RuntimeError;
use crate::frame;

/// Run the handshake over `conn`, mutating `cfg` in place with
/// everything learned from the peer: `remote_uuid`, `force_external`
/// (OR'd with the peer's), `remote_alias`, the peer's `services`
/// registry (replaced wholesale, not merged), and `remote_vnet` (adopted
/// from the peer only if this side didn't already have one).
pub async fn execute<C>(
    conn: &mut C,
    cfg: &mut SystemConfig,
    security: &dyn SecurityProvider,
) -> Result<(), RuntimeError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    // Step 1: uuid exchange.
    frame::write_encrypted(Some(conn), Some(cfg.local_uuid().as_bytes()), Some(cfg), security).await?;
    cfg.remote_uuid = frame::read_encrypted(Some(conn), Some(cfg), security).await?;

    // Step 2: forceExternal, negotiated by logical OR.
    let local_claim = if cfg.force_external { "true" } else { "false" };
    frame::write_encrypted(Some(conn), Some(local_claim.as_bytes()), Some(cfg), security).await?;
    let peer_claim = frame::read_encrypted(Some(conn), Some(cfg), security).await?;
    if peer_claim == "true" {
        cfg.force_external = true;
    }

    // Step 3: alias exchange.
    frame::write_encrypted(Some(conn), Some(cfg.local_alias.as_bytes()), Some(cfg), security).await?;
    cfg.remote_alias = frame::read_encrypted(Some(conn), Some(cfg), security).await?;

    // Step 4: service registry exchange. The peer's view of its own
    // services replaces our view of it wholesale, never merges.
    let local_services = cfg.services.encode();
    frame::write_encrypted(Some(conn), Some(&local_services), Some(cfg), security).await?;
    let peer_services = frame::read_encrypted_bytes(Some(conn), Some(cfg), security).await?;
    let registry = ServiceRegistry::decode(&peer_services)
        .map_err(|e| RuntimeError::Protocol(e.to_string()))?;
    cfg.services.replace_with(registry);

    // Step 5: vnet exchange. Tolerant of older peers that omit it.
    if let Err(err) = exchange_vnet(conn, cfg, security).await {
        tracing::debug!(
            error = %err,
            "peer did not complete the vnet handshake step; continuing without it"
        );
    }

    Ok(())
}

async fn exchange_vnet<C>(
    conn: &mut C,
    cfg: &mut SystemConfig,
    security: &dyn SecurityProvider,
) -> Result<(), RuntimeError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    frame::write_encrypted(Some(conn), Some(cfg.remote_vnet.as_bytes()), Some(cfg), security).await?;
    let peer_vnet = frame::read_encrypted(Some(conn), Some(cfg), security).await?;
    if cfg.remote_vnet.is_empty() {
        cfg.remote_vnet = peer_vnet;
    }
    Ok(())
}
