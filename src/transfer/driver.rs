// OfflineTransfer - runs a TransferSession over a live connection
//
// One OfflineTransfer drives one payment. Every wait (accept, dial,
// next message) races the stop handle and a timeout. Once stopped, the
// transfer releases its connection and transport, settles in `Error`
// and never calls the listener again.

use super::message::TransferMessage;
use super::phase::{Role, TransferPhase};
use super::session::TransferSession;
use super::TransferError;
use crate::ledger::{now_millis, DoubleSpendLedger, ReconcileOutcome, SharedLedger};
use crate::selection::DeterministicSelector;
use crate::storage::{restore_tokens, snapshot_tokens, TokenStore};
use crate::token::{total_amount, Token, TokenVerifier};
use crate::transport::{Connection, PeerAddress, Transport, TransportError};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::timeout;
use tracing::{debug, info, warn};

// ============================================================================
// CONFIG
// ============================================================================

/// Timeouts and filter gossip for one transfer
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// How long to wait for the transport link
    pub connect_timeout: Duration,
    /// How long to wait for each peer message
    pub response_timeout: Duration,
    /// Attach and absorb shared Bloom filters
    pub share_filters: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(60),
            response_timeout: Duration::from_secs(30),
            share_filters: true,
        }
    }
}

impl TransferConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_share_filters(mut self, share: bool) -> Self {
        self.share_filters = share;
        self
    }
}

// ============================================================================
// WALLET
// ============================================================================

/// The local state a transfer reads and writes
#[derive(Clone)]
pub struct Wallet {
    store: Arc<dyn TokenStore>,
    ledger: SharedLedger,
    verifier: TokenVerifier,
    selector: DeterministicSelector,
}

impl Wallet {
    /// Own tokens are selected only if they carry a valid issuer signature
    pub fn new(store: Arc<dyn TokenStore>, ledger: SharedLedger, verifier: TokenVerifier) -> Self {
        let selector = DeterministicSelector::new().with_verifier(verifier.clone());
        Self {
            store,
            ledger,
            verifier,
            selector,
        }
    }

    pub fn with_selector(mut self, selector: DeterministicSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    pub fn ledger(&self) -> &SharedLedger {
        &self.ledger
    }

    pub fn verifier(&self) -> &TokenVerifier {
        &self.verifier
    }
}

// ============================================================================
// OUTCOME / LISTENER
// ============================================================================

/// A completed transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub role: Role,
    /// Address the counterparty was reached at
    pub peer: PeerAddress,
    pub seed: String,
    /// Tokens handed over (sender) or taken in (receiver)
    pub tokens: Vec<Token>,
    pub total_amount: i64,
    /// Result of reconciling the peer's filter, when one was shared
    pub filter_outcome: Option<ReconcileOutcome>,
}

/// Progress callbacks. None of them fire after `stop()`.
pub trait TransferListener: Send + Sync {
    fn on_connected(&self, _role: Role) {}
    fn on_phase_changed(&self, _from: TransferPhase, _to: TransferPhase) {}
    fn on_completed(&self, _outcome: &TransferOutcome) {}
    fn on_error(&self, _error: &TransferError) {}
}

/// Listener that ignores everything
pub struct NoopListener;

impl TransferListener for NoopListener {}

// ============================================================================
// STOP HANDLE
// ============================================================================

/// Cancels a running transfer from any task
#[derive(Clone)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
    notify: Arc<Notify>,
    phase: Arc<watch::Sender<TransferPhase>>,
}

impl StopHandle {
    fn new(phase: Arc<watch::Sender<TransferPhase>>) -> Self {
        Self {
            stopped: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
            phase,
        }
    }

    /// Request cancellation. Returns false if already requested.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.phase.send_if_modified(|phase| {
            if phase.is_terminal() {
                false
            } else {
                *phase = TransferPhase::Error;
                true
            }
        });
        self.notify.notify_one();
        info!("Transfer stop requested");
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn stopped(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

// ============================================================================
// DRIVER
// ============================================================================

/// Drives one payment as sender or receiver
pub struct OfflineTransfer {
    wallet: Wallet,
    config: TransferConfig,
    listener: Arc<dyn TransferListener>,
    stop: StopHandle,
    phase: watch::Receiver<TransferPhase>,
}

impl OfflineTransfer {
    pub fn new(wallet: Wallet, config: TransferConfig) -> Self {
        let (tx, rx) = watch::channel(TransferPhase::NotStarted);
        Self {
            wallet,
            config,
            listener: Arc::new(NoopListener),
            stop: StopHandle::new(Arc::new(tx)),
            phase: rx,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn TransferListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn wallet(&self) -> &Wallet {
        &self.wallet
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Cancel; safe from any phase and idempotent
    pub fn stop(&self) -> bool {
        self.stop.stop()
    }

    /// Last published phase
    pub fn phase(&self) -> TransferPhase {
        *self.phase.borrow()
    }

    /// Subscribe to phase changes
    pub fn watch_phase(&self) -> watch::Receiver<TransferPhase> {
        self.phase.clone()
    }

    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    /// Listen for one sender, take its tokens, release the transport
    pub async fn receive(
        &self,
        transport: &mut dyn Transport,
        service_id: &str,
        expected_amount: Option<i64>,
    ) -> Result<TransferOutcome, TransferError> {
        let mut session = TransferSession::receiver(expected_amount);
        let result = self.accept_and_receive(&mut session, transport, service_id).await;
        if let Err(e) = transport.stop().await {
            warn!(error = %e, "Failed to stop transport");
        }
        self.conclude(session, result)
    }

    /// Dial the receiver, pay `amount`, release the transport
    pub async fn send(
        &self,
        transport: &mut dyn Transport,
        address: &PeerAddress,
        amount: i64,
    ) -> Result<TransferOutcome, TransferError> {
        let mut session = TransferSession::sender(amount);
        let result = self.dial_and_send(&mut session, transport, address).await;
        if let Err(e) = transport.stop().await {
            warn!(error = %e, "Failed to stop transport");
        }
        self.conclude(session, result)
    }

    /// Run the receiver side over an already established connection
    pub async fn receive_on(
        &self,
        connection: Box<dyn Connection>,
        expected_amount: Option<i64>,
    ) -> Result<TransferOutcome, TransferError> {
        let mut session = TransferSession::receiver(expected_amount);
        let result = match self.begin(&mut session) {
            Ok(()) => self.run_receiver(&mut session, connection).await,
            Err(e) => Err(e),
        };
        self.conclude(session, result)
    }

    /// Run the sender side over an already established connection
    pub async fn send_on(&self, connection: Box<dyn Connection>, amount: i64) -> Result<TransferOutcome, TransferError> {
        let mut session = TransferSession::sender(amount);
        let result = match self.begin(&mut session) {
            Ok(()) => self.run_sender(&mut session, connection).await,
            Err(e) => Err(e),
        };
        self.conclude(session, result)
    }

    async fn accept_and_receive(
        &self,
        session: &mut TransferSession,
        transport: &mut dyn Transport,
        service_id: &str,
    ) -> Result<TransferOutcome, TransferError> {
        self.begin(session)?;
        let connection = self
            .guarded("an incoming connection", self.config.connect_timeout, transport.listen(service_id))
            .await?;
        self.run_receiver(session, connection).await
    }

    async fn dial_and_send(
        &self,
        session: &mut TransferSession,
        transport: &mut dyn Transport,
        address: &PeerAddress,
    ) -> Result<TransferOutcome, TransferError> {
        self.begin(session)?;
        let connection = self
            .guarded("the receiver to answer", self.config.connect_timeout, transport.connect(address))
            .await?;
        self.run_sender(session, connection).await
    }

    // ------------------------------------------------------------------
    // Exchanges
    // ------------------------------------------------------------------

    async fn run_receiver(
        &self,
        session: &mut TransferSession,
        mut connection: Box<dyn Connection>,
    ) -> Result<TransferOutcome, TransferError> {
        let result = self.receiver_exchange(session, connection.as_mut()).await;
        self.release(connection.as_mut(), result.as_ref().err()).await;
        result
    }

    async fn run_sender(
        &self,
        session: &mut TransferSession,
        mut connection: Box<dyn Connection>,
    ) -> Result<TransferOutcome, TransferError> {
        let result = self.sender_exchange(session, connection.as_mut()).await;
        self.release(connection.as_mut(), result.as_ref().err()).await;
        result
    }

    async fn receiver_exchange(
        &self,
        session: &mut TransferSession,
        connection: &mut dyn Connection,
    ) -> Result<TransferOutcome, TransferError> {
        self.advance(session, TransferSession::connected)?;
        self.notify(|l| l.on_connected(Role::Receiver));
        info!(peer = %connection.info().address(), "Sender connected");

        let filter = self.outgoing_filter().await;
        let seed_message = self.advance(session, |s| s.issue_seed(filter))?;
        self.transmit(connection, &seed_message).await?;

        let (payload, peer_filter) = loop {
            match self.next_message(session, connection).await? {
                TransferMessage::Tokens { tokens, filter } => break (tokens, filter),
                TransferMessage::Rejected { code, reason } => return Err(session.on_rejected(code, &reason)),
                other => debug!(kind = other.kind(), "Ignoring message"),
            }
        };

        let peer = connection.info().address().clone();
        let tokens = {
            let mut ledger = self.wallet.ledger.lock().await;
            let tokens = session.on_tokens(&payload, peer_filter.as_deref(), &self.wallet.verifier, &ledger)?;
            self.commit_received(&mut ledger, tokens)?
        };

        // tokens are ours now; a lost acknowledgement does not undo that
        if let Err(e) = self.transmit(connection, &TransferMessage::completed()).await {
            warn!(error = %e, "Could not acknowledge received tokens");
        }
        self.advance(session, TransferSession::complete)?;

        let filter_outcome = self.absorb_peer_filter(session.peer_filter().map(str::to_string)).await;
        Ok(self.outcome(session, peer, tokens, filter_outcome))
    }

    async fn sender_exchange(
        &self,
        session: &mut TransferSession,
        connection: &mut dyn Connection,
    ) -> Result<TransferOutcome, TransferError> {
        self.advance(session, TransferSession::connected)?;
        self.notify(|l| l.on_connected(Role::Sender));
        info!(peer = %connection.info().address(), "Connected to receiver");

        let (seed, peer_filter) = loop {
            match self.next_message(session, connection).await? {
                TransferMessage::Seed { seed, filter } => break (seed, filter),
                TransferMessage::Rejected { code, reason } => return Err(session.on_rejected(code, &reason)),
                other => debug!(kind = other.kind(), "Ignoring message"),
            }
        };

        let unspent = self.wallet.store.list_unspent()?;
        let filter = self.outgoing_filter().await;
        let selector = &self.wallet.selector;
        let tokens_message =
            self.advance(session, |s| s.on_seed(&seed, peer_filter.as_deref(), &unspent, selector, filter))?;
        self.transmit(connection, &tokens_message).await?;

        loop {
            match self.next_message(session, connection).await? {
                TransferMessage::Completed { .. } => break,
                TransferMessage::Rejected { code, reason } => return Err(session.on_rejected(code, &reason)),
                other => debug!(kind = other.kind(), "Ignoring message"),
            }
        }

        let spent: Vec<String> = session.tokens().iter().map(|t| t.id().to_string()).collect();
        self.wallet.store.mark_all_spent(&spent)?;
        self.advance(session, TransferSession::complete)?;

        let tokens = session.tokens().to_vec();
        let filter_outcome = self.absorb_peer_filter(session.peer_filter().map(str::to_string)).await;
        Ok(self.outcome(session, connection.info().address().clone(), tokens, filter_outcome))
    }

    /// Store accepted tokens, then record them in the ledger. If either
    /// step fails neither the store nor the ledger keeps any of them.
    fn commit_received(
        &self,
        ledger: &mut DoubleSpendLedger,
        mut tokens: Vec<Token>,
    ) -> Result<Vec<Token>, TransferError> {
        let store = self.wallet.store.as_ref();
        let now = now_millis();
        let snapshot = snapshot_tokens(store, tokens.iter().map(|t| t.id()))?;

        for token in tokens.iter_mut() {
            token.set_date_received(now);
        }
        store.save_all(&tokens)?;

        if let Err(e) = ledger.add_received_money(&mut tokens, now) {
            restore_tokens(store, &snapshot);
            return Err(e.into());
        }
        Ok(tokens)
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    fn begin(&self, session: &mut TransferSession) -> Result<(), TransferError> {
        if self.stop.is_stopped() {
            return Err(TransferError::Cancelled);
        }
        self.advance(session, TransferSession::start)
    }

    /// Apply one session step and publish any phase change
    fn advance<T>(
        &self,
        session: &mut TransferSession,
        step: impl FnOnce(&mut TransferSession) -> Result<T, TransferError>,
    ) -> Result<T, TransferError> {
        let before = session.phase();
        let out = step(session)?;
        let after = session.phase();
        if before != after {
            self.publish(before, after);
        }
        Ok(out)
    }

    fn publish(&self, from: TransferPhase, to: TransferPhase) {
        let stop = &self.stop;
        let changed = stop.phase.send_if_modified(|phase| {
            if stop.is_stopped() || *phase == to {
                false
            } else {
                *phase = to;
                true
            }
        });
        if changed {
            self.notify(|l| l.on_phase_changed(from, to));
        }
    }

    fn notify(&self, callback: impl FnOnce(&dyn TransferListener)) {
        if !self.stop.is_stopped() {
            callback(self.listener.as_ref());
        }
    }

    /// Await `fut` unless stopped or out of time
    async fn guarded<T, F>(&self, waiting_for: &str, limit: Duration, fut: F) -> Result<T, TransferError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        tokio::select! {
            biased;
            _ = self.stop.stopped() => Err(TransferError::Cancelled),
            res = timeout(limit, fut) => match res {
                Ok(inner) => inner.map_err(TransferError::from),
                Err(_) => Err(TransferError::Timeout(waiting_for.to_string())),
            },
        }
    }

    async fn transmit(&self, connection: &mut dyn Connection, message: &TransferMessage) -> Result<(), TransferError> {
        let bytes = message.to_bytes()?;
        debug!(kind = message.kind(), len = bytes.len(), "Sending transfer message");
        self.guarded("the send to finish", self.config.response_timeout, connection.send(&bytes))
            .await
    }

    /// Next message the session expects, skipping unknown and stale ones
    async fn next_message(
        &self,
        session: &TransferSession,
        connection: &mut dyn Connection,
    ) -> Result<TransferMessage, TransferError> {
        loop {
            let frame = self
                .guarded("the peer's next message", self.config.response_timeout, connection.receive())
                .await?;
            match TransferMessage::from_bytes(&frame)? {
                None => debug!("Ignoring message of unknown type"),
                Some(message) if session.expects(&message) => return Ok(message),
                Some(message) => debug!(kind = message.kind(), phase = %session.phase(), "Ignoring out-of-phase message"),
            }
        }
    }

    /// Tell the peer why we gave up (best effort), then close
    async fn release(&self, connection: &mut dyn Connection, error: Option<&TransferError>) {
        if let Some(error) = error.filter(|e| e.should_notify_peer() && !self.stop.is_stopped()) {
            if let Ok(bytes) = TransferMessage::rejected(error).to_bytes() {
                if let Err(e) = timeout(self.config.response_timeout, connection.send(&bytes)).await {
                    debug!(error = %e, "Rejection notice timed out");
                }
            }
        }
        if let Err(e) = connection.close().await {
            debug!(error = %e, "Error closing connection");
        }
    }

    async fn outgoing_filter(&self) -> Option<String> {
        if !self.config.share_filters {
            return None;
        }
        let ledger = self.wallet.ledger.lock().await;
        ledger
            .has_valid_filter_to_share()
            .then(|| URL_SAFE_NO_PAD.encode(ledger.shared_filter_bytes()))
    }

    /// Reconcile the peer's filter; failures here never fail the transfer
    async fn absorb_peer_filter(&self, encoded: Option<String>) -> Option<ReconcileOutcome> {
        if !self.config.share_filters {
            return None;
        }
        let bytes = match URL_SAFE_NO_PAD.decode(encoded?) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Peer filter is not valid base64");
                return None;
            }
        };
        match self.wallet.ledger.lock().await.process_received_filter(&bytes) {
            Ok(reconciliation) => Some(reconciliation.outcome),
            Err(e) => {
                warn!(error = %e, "Could not reconcile peer filter");
                None
            }
        }
    }

    fn outcome(
        &self,
        session: &TransferSession,
        peer: PeerAddress,
        tokens: Vec<Token>,
        filter_outcome: Option<ReconcileOutcome>,
    ) -> TransferOutcome {
        let total_amount = total_amount(&tokens);
        TransferOutcome {
            role: session.role(),
            peer,
            seed: session.seed().unwrap_or_default().to_string(),
            tokens,
            total_amount,
            filter_outcome,
        }
    }

    fn conclude(
        &self,
        mut session: TransferSession,
        result: Result<TransferOutcome, TransferError>,
    ) -> Result<TransferOutcome, TransferError> {
        match result {
            Ok(outcome) => {
                info!(
                    role = %outcome.role,
                    tokens = outcome.tokens.len(),
                    total = outcome.total_amount,
                    "Transfer completed"
                );
                self.notify(|l| l.on_completed(&outcome));
                Ok(outcome)
            }
            Err(error) => {
                let error = if self.stop.is_stopped() {
                    TransferError::Cancelled
                } else {
                    error
                };
                let from = session.phase();
                if session.fail(error.clone()) {
                    self.publish(from, TransferPhase::Error);
                }
                self.notify(|l| l.on_error(&error));
                Err(error)
            }
        }
    }
}
