//! The VNic dispatch surface (SPEC_FULL §4.D): unicast, multicast,
//! round-robin, proximity, leader, and local delivery, each with a
//! fire-and-forget (`*_notify`) and a blocking (`*_request`) variant;
//! request/reply correlation via the pending-request table; and the
//! transactional request path driving `transaction::TransactionTracker`
//! on both ends of a transactional exchange.
//!
//! Grounded on the original `common.IVirtualNetworkInterface` for the
//! method surface (`Unicast`/`Request`, `Multicast`, `Single`/
//! `SingleRequest`, `Leader`) and on this workspace's own
//! `dispatch.rs`/`delivery.rs` for the registry-of-handlers +
//! `tracing::warn!`-on-miss idiom. One VNic owns exactly one connection:
//! a reader task and a writer task, communicating with the rest of the
//! program only through this struct's async methods and the bounded
//! write channel (SPEC_FULL §5).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{split, AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use mesh_core::{Action, Message, MulticastMode, SecurityProvider, SystemConfig, TransactionState};

use crate::error::RuntimeError;
use crate::frame;
use crate::pending::{self, PendingTable};
use crate::providers::ProviderRegistry;
use crate::transaction::{epoch_seconds, TransactionTracker};

/// Tunables outside the wire protocol itself: default request timeout
/// and the writer task's queue depth. Same `#[derive(Default)]` +
/// explicit-builder-method shape as this codebase's other config types;
/// `SystemConfig` carries everything that *is* part of the protocol
/// (SPEC_FULL §3.3).
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub default_timeout: Duration,
    pub write_queue_depth: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            default_timeout: Duration::from_secs(5),
            write_queue_depth: 256,
        }
    }
}

impl DispatchConfig {
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_write_queue_depth(mut self, depth: usize) -> Self {
        self.write_queue_depth = depth;
        self
    }
}

/// A locally hosted `(serviceName, serviceArea)` handler. Invoked for
/// every inbound non-reply `Message` addressed to that pair. A panic
/// inside `call` is caught at the dispatch boundary and turned into a
/// fail-reply (SPEC_FULL §4.D.3) — it never brings down the VNic.
#[async_trait::async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn call(&self, request: &Message) -> Result<Vec<u8>, String>;
}

struct Registration {
    service_name: String,
    service_area: u8,
    handler: Arc<dyn ServiceHandler>,
}

/// One VNic: the identity, connection, and dispatch state a caller
/// interacts with after a successful handshake.
pub struct VNic {
    local_uuid: String,
    config: Arc<SystemConfig>,
    security: Arc<dyn SecurityProvider>,
    sequence: AtomicU32,
    txn_counter: AtomicU64,
    pending: PendingTable,
    providers: Arc<ProviderRegistry>,
    handlers: RwLock<Vec<Registration>>,
    write_tx: mpsc::Sender<Message>,
    dispatch_cfg: DispatchConfig,
}

impl VNic {
    /// Run the handshake over `conn`, then spawn its reader and writer
    /// tasks. Returns the `VNic` and the reader task's `JoinHandle`, so a
    /// caller can observe when the connection ends.
    pub async fn establish<C>(
        mut conn: C,
        mut config: SystemConfig,
        security: Arc<dyn SecurityProvider>,
        dispatch_cfg: DispatchConfig,
        providers: Arc<ProviderRegistry>,
    ) -> Result<(Arc<VNic>, JoinHandle<()>), RuntimeError>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        crate::handshake::execute(&mut conn, &mut config, security.as_ref()).await?;
        Ok(Self::establish_post_handshake(conn, config, security, dispatch_cfg, providers))
    }

    /// Spawn a VNic's reader and writer tasks over a connection whose
    /// handshake the caller has already completed by some other means.
    /// `establish` is the usual entry point; this exists for callers that
    /// need to drive the handshake themselves (e.g. to inject a malformed
    /// frame right after it, as the decryption-teardown test does).
    pub fn establish_post_handshake<C>(
        conn: C,
        config: SystemConfig,
        security: Arc<dyn SecurityProvider>,
        dispatch_cfg: DispatchConfig,
        providers: Arc<ProviderRegistry>,
    ) -> (Arc<VNic>, JoinHandle<()>)
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let local_uuid = config.local_uuid().to_string();
        let config = Arc::new(config);
        let pending = PendingTable::new();
        let (write_tx, write_rx) = mpsc::channel(dispatch_cfg.write_queue_depth);
        let (read_half, write_half) = split(conn);

        let vnic = Arc::new(VNic {
            local_uuid,
            config: config.clone(),
            security: security.clone(),
            sequence: AtomicU32::new(0),
            txn_counter: AtomicU64::new(0),
            pending,
            providers,
            handlers: RwLock::new(Vec::new()),
            write_tx,
            dispatch_cfg,
        });

        tokio::spawn(writer_task(write_half, config, security, write_rx));

        let reader_vnic = vnic.clone();
        let reader_handle = tokio::spawn(async move { reader_task(read_half, reader_vnic).await });

        (vnic, reader_handle)
    }

    pub fn local_uuid(&self) -> &str {
        &self.local_uuid
    }

    pub async fn register_handler(
        &self,
        service_name: impl Into<String>,
        service_area: u8,
        handler: Arc<dyn ServiceHandler>,
    ) {
        self.handlers.write().await.push(Registration {
            service_name: service_name.into(),
            service_area,
            handler,
        });
    }

    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    pub fn remote_uuid(&self) -> String {
        self.config.remote_uuid.clone()
    }

    /// Number of requests currently awaiting a reply on this connection.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn next_transaction_id(&self) -> String {
        let n = self.txn_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-txn-{}", self.local_uuid, n)
    }

    fn build_message(
        &self,
        destination: String,
        service_name: impl Into<String>,
        service_area: u8,
        action: Action,
        mode: MulticastMode,
        payload: Vec<u8>,
        request: bool,
    ) -> Message {
        let mut msg = Message::new(
            self.local_uuid.clone(),
            self.local_uuid.clone(),
            destination,
            service_name,
            service_area,
            action,
            payload,
        );
        msg.multicast_mode = mode;
        msg.request = request;
        msg
    }

    async fn send(&self, msg: Message) -> Result<(), RuntimeError> {
        self.write_tx.send(msg).await.map_err(|_| RuntimeError::ConnectionLost)
    }

    async fn dispatch_request(
        &self,
        destination: String,
        service_name: impl Into<String>,
        service_area: u8,
        action: Action,
        mode: MulticastMode,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, RuntimeError> {
        let sequence = self.next_sequence();
        let mut msg = self.build_message(destination, service_name, service_area, action, mode, payload, true);
        msg.sequence = sequence;
        let rx = self.pending.register(sequence);
        if let Err(e) = self.send(msg).await {
            self.pending.cancel(sequence);
            return Err(e);
        }
        pending::await_reply(&self.pending, sequence, rx, timeout).await
    }

    async fn find_handler(&self, service_name: &str, service_area: u8) -> Option<Arc<dyn ServiceHandler>> {
        self.handlers
            .read()
            .await
            .iter()
            .find(|r| r.service_name == service_name && r.service_area == service_area)
            .map(|r| r.handler.clone())
    }

    async fn invoke_local(&self, msg: &Message) -> Result<Vec<u8>, RuntimeError> {
        let handler = self
            .find_handler(&msg.service_name, msg.service_area)
            .await
            .ok_or(RuntimeError::NoProvider)?;
        match invoke_catching_panics(handler, msg.clone()).await {
            Ok(payload) => Ok(payload),
            Err(text) => Err(RuntimeError::RemoteFailure(text)),
        }
    }

    // ── Unicast ──────────────────────────────────────────────────────

    pub async fn unicast_notify(
        &self,
        destination: impl Into<String>,
        service_name: impl Into<String>,
        service_area: u8,
        action: Action,
        payload: Vec<u8>,
    ) -> Result<(), RuntimeError> {
        let msg = self.build_message(destination.into(), service_name, service_area, action, MulticastMode::Unicast, payload, false);
        self.send(msg).await
    }

    pub async fn unicast_request(
        &self,
        destination: impl Into<String>,
        service_name: impl Into<String>,
        service_area: u8,
        action: Action,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, RuntimeError> {
        self.dispatch_request(destination.into(), service_name, service_area, action, MulticastMode::Unicast, payload, timeout)
            .await
    }

    // ── Multicast — fire-and-forget only (SPEC_FULL §4.D.1) ─────────

    pub async fn multicast_notify(
        &self,
        service_name: impl Into<String>,
        service_area: u8,
        action: Action,
        payload: Vec<u8>,
    ) -> Result<(), RuntimeError> {
        // Empty destination + All mode: the routing layer beyond this
        // VNic fans the single wire send out to every listener, per the
        // §3.1 invariant that multicast destinations are empty or a
        // well-known sentinel.
        let msg = self.build_message(String::new(), service_name, service_area, action, MulticastMode::All, payload, false);
        self.send(msg).await
    }

    // ── Round robin ──────────────────────────────────────────────────

    pub async fn round_robin_notify(
        &self,
        service_name: impl Into<String>,
        service_area: u8,
        action: Action,
        payload: Vec<u8>,
    ) -> Result<(), RuntimeError> {
        let service_name = service_name.into();
        let provider = self.providers.round_robin(&service_name, service_area)?;
        let msg = self.build_message(provider.uuid, service_name, service_area, action, MulticastMode::RoundRobin, payload, false);
        self.send(msg).await
    }

    pub async fn round_robin_request(
        &self,
        service_name: impl Into<String>,
        service_area: u8,
        action: Action,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, RuntimeError> {
        let service_name = service_name.into();
        let provider = self.providers.round_robin(&service_name, service_area)?;
        self.dispatch_request(provider.uuid, service_name, service_area, action, MulticastMode::RoundRobin, payload, timeout)
            .await
    }

    // ── Proximity ────────────────────────────────────────────────────

    pub async fn proximity_notify(
        &self,
        service_name: impl Into<String>,
        service_area: u8,
        action: Action,
        payload: Vec<u8>,
    ) -> Result<(), RuntimeError> {
        let service_name = service_name.into();
        let provider = self.providers.proximity(&service_name, service_area)?;
        let msg = self.build_message(provider.uuid, service_name, service_area, action, MulticastMode::Proximity, payload, false);
        self.send(msg).await
    }

    pub async fn proximity_request(
        &self,
        service_name: impl Into<String>,
        service_area: u8,
        action: Action,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, RuntimeError> {
        let service_name = service_name.into();
        let provider = self.providers.proximity(&service_name, service_area)?;
        self.dispatch_request(provider.uuid, service_name, service_area, action, MulticastMode::Proximity, payload, timeout)
            .await
    }

    // ── Leader ───────────────────────────────────────────────────────

    pub async fn leader_notify(
        &self,
        service_name: impl Into<String>,
        service_area: u8,
        action: Action,
        payload: Vec<u8>,
    ) -> Result<(), RuntimeError> {
        let service_name = service_name.into();
        let leader = self.providers.leader(&service_name, service_area)?;
        let msg = self.build_message(leader, service_name, service_area, action, MulticastMode::Leader, payload, false);
        self.send(msg).await
    }

    pub async fn leader_request(
        &self,
        service_name: impl Into<String>,
        service_area: u8,
        action: Action,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, RuntimeError> {
        let service_name = service_name.into();
        let leader = self.providers.leader(&service_name, service_area)?;
        self.dispatch_request(leader, service_name, service_area, action, MulticastMode::Leader, payload, timeout)
            .await
    }

    // ── Local — no wire traffic at all ──────────────────────────────

    pub async fn local_notify(
        &self,
        service_name: impl Into<String>,
        service_area: u8,
        action: Action,
        payload: Vec<u8>,
    ) -> Result<(), RuntimeError> {
        let msg = self.build_message(String::new(), service_name, service_area, action, MulticastMode::Local, payload, false);
        self.invoke_local(&msg).await.map(|_| ())
    }

    pub async fn local_request(
        &self,
        service_name: impl Into<String>,
        service_area: u8,
        action: Action,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, RuntimeError> {
        let msg = self.build_message(String::new(), service_name, service_area, action, MulticastMode::Local, payload, true);
        self.invoke_local(&msg).await
    }

    // ── Transactional requests (SPEC_FULL §4.D.2) ───────────────────

    /// Dispatch a transactional mutating request (`Post`/`Put`/`Patch`/
    /// `Delete`). `tr_timeout` is the absolute epoch-second deadline the
    /// receiver must finish processing by. Returns the committed
    /// payload, or `RemoteFailure` carrying the receiver's `err_msg` if
    /// the transaction rolled back or timed out on that side.
    pub async fn transactional_request(
        &self,
        destination: impl Into<String>,
        service_name: impl Into<String>,
        service_area: u8,
        action: Action,
        payload: Vec<u8>,
        request_timeout: Duration,
        tr_timeout: i64,
    ) -> Result<Vec<u8>, RuntimeError> {
        let sequence = self.next_sequence();
        let mut msg = self.build_message(
            destination.into(),
            service_name,
            service_area,
            action,
            MulticastMode::Unicast,
            payload,
            true,
        );
        msg.sequence = sequence;
        msg.transaction_state = TransactionState::Created;
        msg.transaction_id = self.next_transaction_id();
        msg.tr_created = epoch_seconds();
        msg.tr_timeout = tr_timeout;

        let rx = self.pending.register(sequence);
        if let Err(e) = self.send(msg).await {
            self.pending.cancel(sequence);
            return Err(e);
        }
        pending::await_reply(&self.pending, sequence, rx, request_timeout).await
    }

    /// Build `count` replica clones of a transactional write: each
    /// stamped with its replica index, every clone but the primary
    /// (index 0) marked `is_replica` (SPEC_FULL §4.D.2).
    pub fn replicate(msg: &Message, count: u8) -> Vec<Message> {
        (0..count)
            .map(|i| {
                let mut clone = msg.clone();
                clone.replica_number = i;
                clone.is_replica = i != 0;
                clone
            })
            .collect()
    }
}

/// Run `handler.call(msg)`, catching a panic at this boundary the same
/// way a spawned task's `JoinError` catches one — SPEC_FULL §4.D.3
/// requires a handler panic never crash the VNic. Spawning the call
/// itself is what makes `JoinHandle::await` observe the panic instead of
/// unwinding straight through this async stack.
async fn invoke_catching_panics(handler: Arc<dyn ServiceHandler>, msg: Message) -> Result<Vec<u8>, String> {
    match tokio::spawn(async move { handler.call(&msg).await }).await {
        Ok(result) => result,
        Err(join_err) => Err(format!("handler task failed: {join_err}")),
    }
}

async fn writer_task<W>(
    mut write_half: W,
    config: Arc<SystemConfig>,
    security: Arc<dyn SecurityProvider>,
    mut rx: mpsc::Receiver<Message>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        let bytes = match msg.serialize() {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "dropping outbound message that failed to serialize");
                continue;
            }
        };
        match frame::write_encrypted(Some(&mut write_half), Some(&bytes), Some(&config), security.as_ref()).await {
            Ok(()) => {}
            // Oversize is a per-message rejection, not a connection fault
            // (SPEC_FULL §8 scenario 3): drop this frame, keep writing.
            Err(e @ RuntimeError::OversizeFrame { .. }) => {
                tracing::warn!(error = %e, "dropping outbound frame that exceeds the configured maximum");
            }
            Err(e) => {
                tracing::warn!(error = %e, "writer task failed, connection is considered closed");
                return;
            }
        }
    }
}

async fn reader_task<R>(mut read_half: R, vnic: Arc<VNic>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match frame::read_encrypted_bytes(Some(&mut read_half), Some(&vnic.config), vnic.security.as_ref()).await {
            Ok(bytes) => match Message::deserialize(&bytes) {
                Ok(msg) => vnic.route_inbound(msg).await,
                Err(e) => tracing::warn!(error = %e, "dropping unparseable inbound message"),
            },
            Err(e) => {
                tracing::warn!(error = %e, "connection lost, failing every pending request");
                vnic.pending.fail_all();
                return;
            }
        }
    }
}

impl VNic {
    /// Route one inbound message: a reply (or a delivery/handler
    /// failure, which SPEC_FULL §4.D.3 says "arrives as a reply with a
    /// non-empty failMessage" regardless of the reply bit) completes a
    /// pending request; anything else is a new request for a locally
    /// registered handler.
    async fn route_inbound(&self, msg: Message) {
        if msg.reply || !msg.fail_message.is_empty() {
            if !self.pending.complete(msg.sequence, msg.clone()) {
                tracing::warn!(sequence = msg.sequence, "dropped reply with no matching pending request");
            }
            return;
        }

        if msg.transaction_state.has_extension() {
            self.handle_transactional_request(msg).await;
        } else {
            self.handle_plain_request(msg).await;
        }
    }

    async fn handle_plain_request(&self, msg: Message) {
        let remote_uuid = self.remote_uuid();
        let handler = self.find_handler(&msg.service_name, msg.service_area).await;

        let Some(handler) = handler else {
            tracing::warn!(service = %msg.service_name, area = msg.service_area, "no local handler registered, dropping");
            return;
        };

        if !msg.request {
            let _ = invoke_catching_panics(handler, msg).await;
            return;
        }

        let reply = match invoke_catching_panics(handler, msg.clone()).await {
            Ok(payload) => {
                let mut reply = msg.clone_reply(self.local_uuid.clone(), remote_uuid.clone());
                reply.payload = payload;
                reply
            }
            Err(fail_text) => msg.clone_fail(fail_text, remote_uuid.clone()),
        };

        if self.write_tx.send(reply).await.is_err() {
            tracing::warn!("writer task gone, could not send reply");
        }
    }

    async fn handle_transactional_request(&self, msg: Message) {
        let remote_uuid = self.remote_uuid();
        let mut tx = TransactionTracker::new(msg.tr_timeout);
        if let Err(e) = tx.create(msg.tr_created).and_then(|_| tx.queue(epoch_seconds())).and_then(|_| tx.run(epoch_seconds())) {
            tracing::warn!(error = %e, "could not advance transaction to running, failing it");
        }

        let handler = self.find_handler(&msg.service_name, msg.service_area).await;
        let outcome = match handler {
            Some(h) => invoke_catching_panics(h, msg.clone()).await,
            None => Err("no local handler registered for this service/area".to_string()),
        };

        let now = epoch_seconds();
        let _ = tx.enforce_timeout(now);

        let (payload, fail_text) = if tx.state() == TransactionState::Failed {
            (Vec::new(), tx.err_msg.clone())
        } else {
            match outcome {
                Ok(payload) => {
                    let _ = tx.commit(epoch_seconds());
                    (payload, String::new())
                }
                Err(text) => {
                    let _ = tx.fail(epoch_seconds(), text.clone());
                    (Vec::new(), text)
                }
            }
        };

        let mut reply = msg.clone_reply(self.local_uuid.clone(), remote_uuid.clone());
        reply.payload = payload;
        reply.fail_message = fail_text;
        reply.transaction_state = tx.state();
        reply.transaction_id = msg.transaction_id.clone();
        reply.err_msg = tx.err_msg.clone();
        reply.tr_created = tx.created;
        reply.tr_queued = tx.queued;
        reply.tr_running = tx.running;
        reply.tr_end = tx.end;
        reply.tr_timeout = tx.timeout;

        if self.write_tx.send(reply).await.is_err() {
            tracing::warn!("writer task gone, could not send transaction reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::crypto::NullSecurityProvider;
    use std::sync::atomic::AtomicUsize;

    struct Echo;

    #[async_trait::async_trait]
    impl ServiceHandler for Echo {
        async fn call(&self, request: &Message) -> Result<Vec<u8>, String> {
            Ok(request.payload.clone())
        }
    }

    struct AlwaysFails;

    #[async_trait::async_trait]
    impl ServiceHandler for AlwaysFails {
        async fn call(&self, _request: &Message) -> Result<Vec<u8>, String> {
            Err("intentional failure".to_string())
        }
    }

    struct Panics;

    #[async_trait::async_trait]
    impl ServiceHandler for Panics {
        async fn call(&self, _request: &Message) -> Result<Vec<u8>, String> {
            panic!("boom");
        }
    }

    struct CountingEcho(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl ServiceHandler for CountingEcho {
        async fn call(&self, request: &Message) -> Result<Vec<u8>, String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(request.payload.clone())
        }
    }

    async fn paired_vnics() -> (Arc<VNic>, Arc<VNic>) {
        let (a_conn, b_conn) = tokio::io::duplex(1 << 20);
        let a_cfg = SystemConfig::new("vnic-a", "a", 1 << 20);
        let b_cfg = SystemConfig::new("vnic-b", "b", 1 << 20);
        let security: Arc<dyn SecurityProvider> = Arc::new(NullSecurityProvider);

        let a_fut = VNic::establish(
            a_conn,
            a_cfg,
            security.clone(),
            DispatchConfig::default(),
            ProviderRegistry::shared(),
        );
        let b_fut = VNic::establish(
            b_conn,
            b_cfg,
            security,
            DispatchConfig::default(),
            ProviderRegistry::shared(),
        );
        let (a_res, b_res) = tokio::join!(a_fut, b_fut);
        let (a, _a_reader) = a_res.unwrap();
        let (b, _b_reader) = b_res.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn basic_request_reply() {
        let (a, b) = paired_vnics().await;
        b.register_handler("svc", 1, Arc::new(Echo)).await;

        let reply = a
            .unicast_request("vnic-b", "svc", 1, Action::Get, b"hello".to_vec(), Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(reply, b"hello");
    }

    #[tokio::test]
    async fn request_to_black_hole_times_out_and_frees_the_table() {
        let (a, b) = paired_vnics().await;
        // b registers no handler at all; a's request never gets a reply.
        let err = a
            .unicast_request("vnic-b", "svc", 1, Action::Get, b"hi".to_vec(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Timeout));
        assert_eq!(a.pending_count(), 0);
        let _ = b;
    }

    #[tokio::test]
    async fn remote_handler_failure_surfaces_as_remote_failure() {
        let (a, b) = paired_vnics().await;
        b.register_handler("svc", 1, Arc::new(AlwaysFails)).await;

        let err = a
            .unicast_request("vnic-b", "svc", 1, Action::Post, b"x".to_vec(), Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::RemoteFailure(text) if text == "intentional failure"));
    }

    #[tokio::test]
    async fn remote_handler_panic_does_not_crash_and_surfaces_as_failure() {
        let (a, b) = paired_vnics().await;
        b.register_handler("svc", 1, Arc::new(Panics)).await;

        let err = a
            .unicast_request("vnic-b", "svc", 1, Action::Post, b"x".to_vec(), Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::RemoteFailure(_)));

        // The connection and VNic are still usable afterward.
        b.register_handler("svc", 2, Arc::new(Echo)).await;
        let reply = a
            .unicast_request("vnic-b", "svc", 2, Action::Get, b"still alive".to_vec(), Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(reply, b"still alive");
    }

    #[tokio::test]
    async fn notify_does_not_wait_for_a_reply() {
        let (a, b) = paired_vnics().await;
        let count = Arc::new(AtomicUsize::new(0));
        b.register_handler("svc", 1, Arc::new(CountingEcho(count.clone()))).await;

        a.unicast_notify("vnic-b", "svc", 1, Action::Notify, b"evt".to_vec()).await.unwrap();
        // Give the reader task a moment to route it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn local_request_never_touches_the_wire() {
        let (a, _b) = paired_vnics().await;
        a.register_handler("local-svc", 0, Arc::new(Echo)).await;
        let reply = a.local_request("local-svc", 0, Action::Get, b"loopback".to_vec()).await.unwrap();
        assert_eq!(reply, b"loopback");
    }

    #[tokio::test]
    async fn local_request_with_no_handler_is_no_provider() {
        let (a, _b) = paired_vnics().await;
        let err = a.local_request("missing", 0, Action::Get, Vec::new()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::NoProvider));
    }

    #[tokio::test]
    async fn round_robin_request_with_no_known_providers_is_no_provider() {
        let (a, _b) = paired_vnics().await;
        let err = a
            .round_robin_request("svc", 0, Action::Get, Vec::new(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::NoProvider));
    }

    #[tokio::test]
    async fn transactional_request_commits_with_monotonic_timestamps() {
        let (a, b) = paired_vnics().await;
        b.register_handler("txsvc", 0, Arc::new(Echo)).await;

        let reply = a
            .transactional_request(
                "vnic-b",
                "txsvc",
                0,
                Action::Post,
                b"payload".to_vec(),
                Duration::from_millis(500),
                epoch_seconds() + 3600,
            )
            .await
            .unwrap();
        assert_eq!(reply, b"payload");
    }

    #[tokio::test]
    async fn transactional_request_with_failing_handler_rolls_back() {
        let (a, b) = paired_vnics().await;
        b.register_handler("txsvc", 0, Arc::new(AlwaysFails)).await;

        let err = a
            .transactional_request(
                "vnic-b",
                "txsvc",
                0,
                Action::Post,
                Vec::new(),
                Duration::from_millis(500),
                epoch_seconds() + 3600,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::RemoteFailure(text) if text == "intentional failure"));
    }

    #[tokio::test]
    async fn connection_loss_fails_every_pending_request() {
        // Drive the handshake manually so B's raw connection half can be
        // dropped directly: an Arc<VNic> alone can't sever anything, its
        // reader/writer tasks hold their own handles to the connection.
        let (mut a_conn, mut b_conn) = tokio::io::duplex(1 << 20);
        let mut a_cfg = SystemConfig::new("vnic-a", "a", 1 << 20);
        let mut b_cfg = SystemConfig::new("vnic-b", "b", 1 << 20);
        let security = NullSecurityProvider;
        let a_handshake = tokio::spawn(async move {
            crate::handshake::execute(&mut a_conn, &mut a_cfg, &security).await.unwrap();
            (a_conn, a_cfg)
        });
        let security_b = NullSecurityProvider;
        let b_handshake = tokio::spawn(async move {
            crate::handshake::execute(&mut b_conn, &mut b_cfg, &security_b).await.unwrap();
            (b_conn, b_cfg)
        });
        let (a_conn, a_cfg) = a_handshake.await.unwrap();
        let (b_conn, _b_cfg) = b_handshake.await.unwrap();

        let security: Arc<dyn SecurityProvider> = Arc::new(NullSecurityProvider);
        let (a, _a_reader) = VNic::establish_post_handshake(a_conn, a_cfg, security, DispatchConfig::default(), ProviderRegistry::shared());

        let timeout = Duration::from_secs(10);
        let first = tokio::spawn({
            let a = a.clone();
            async move { a.unicast_request("vnic-b", "svc", 0, Action::Get, Vec::new(), timeout).await }
        });
        let second = tokio::spawn({
            let a = a.clone();
            async move { a.unicast_request("vnic-b", "svc", 1, Action::Get, Vec::new(), timeout).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(b_conn); // peer's connection half disappears entirely

        let first_err = first.await.unwrap().unwrap_err();
        let second_err = second.await.unwrap().unwrap_err();
        assert!(matches!(first_err, RuntimeError::ConnectionLost));
        assert!(matches!(second_err, RuntimeError::ConnectionLost));
    }

    #[test]
    fn replicate_stamps_replica_index_and_is_replica() {
        let base = Message::new("s", "s", "d", "svc", 0, Action::Post, Vec::new());
        let clones = VNic::replicate(&base, 3);
        assert_eq!(clones.len(), 3);
        assert_eq!(clones[0].replica_number, 0);
        assert!(!clones[0].is_replica);
        assert_eq!(clones[1].replica_number, 1);
        assert!(clones[1].is_replica);
        assert_eq!(clones[2].replica_number, 2);
        assert!(clones[2].is_replica);
    }
}
