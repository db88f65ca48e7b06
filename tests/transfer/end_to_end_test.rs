// End-to-End Transfer Tests
// Holders paying merchants over in-process and TCP transports

use offcash::ledger::{DoubleSpendLedger, LedgerConfig, ReconcileOutcome, SharedLedger};
use offcash::settlement::{RecordingSubmitter, Settler, SettlerConfig, SubmissionError};
use offcash::storage::{MemoryTokenStore, StoreError, TokenStore};
use offcash::token::{IssuerKeypair, Token, TokenCodec, TokenSigner, TokenVerifier};
use offcash::transfer::{
    OfflineTransfer, RejectionCode, Role, TransferConfig, TransferError, TransferListener, TransferMessage,
    TransferOutcome, TransferPhase, Wallet,
};
use offcash::transport::{
    Connection, MemoryConnection, MemoryNetwork, PeerAddress, TcpTransport, TcpTransportConfig, TransportError,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SERVICE: &str = "offcash-test";
const MAX_FRAME: usize = 64 * 1024;

// ============================================================================
// HELPERS
// ============================================================================

/// Memory store that can be told to fail individual writes
#[derive(Default)]
struct FlakyStore {
    inner: MemoryTokenStore,
    saves: AtomicUsize,
    fail_save_on: AtomicUsize,
    marks: AtomicUsize,
    fail_mark_on: AtomicUsize,
    fail_save_received: AtomicBool,
}

impl FlakyStore {
    fn with_tokens(tokens: &[Token]) -> Self {
        Self {
            inner: MemoryTokenStore::with_tokens(tokens),
            ..Self::default()
        }
    }

    /// Fail the n-th `save` from now on, counting from 1
    fn fail_save(&self, nth: usize) {
        self.saves.store(0, Ordering::SeqCst);
        self.fail_save_on.store(nth, Ordering::SeqCst);
    }

    /// Fail the n-th `mark_spent` from now on, counting from 1
    fn fail_mark_spent(&self, nth: usize) {
        self.marks.store(0, Ordering::SeqCst);
        self.fail_mark_on.store(nth, Ordering::SeqCst);
    }

    fn fail_save_received(&self, fail: bool) {
        self.fail_save_received.store(fail, Ordering::SeqCst);
    }

    fn heal(&self) {
        self.fail_save(0);
        self.fail_mark_spent(0);
        self.fail_save_received(false);
    }

    fn trip(counter: &AtomicUsize, fail_on: &AtomicUsize) -> Result<(), StoreError> {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if n == fail_on.load(Ordering::SeqCst) {
            return Err(StoreError::DatabaseError("disk full".to_string()));
        }
        Ok(())
    }
}

impl TokenStore for FlakyStore {
    fn save(&self, token: &Token) -> Result<(), StoreError> {
        Self::trip(&self.saves, &self.fail_save_on)?;
        self.inner.save(token)
    }
    fn get(&self, id: &str) -> Result<Option<Token>, StoreError> {
        self.inner.get(id)
    }
    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        self.inner.delete(id)
    }
    fn mark_spent(&self, id: &str) -> Result<bool, StoreError> {
        Self::trip(&self.marks, &self.fail_mark_on)?;
        self.inner.mark_spent(id)
    }
    fn list_unspent(&self) -> Result<Vec<Token>, StoreError> {
        self.inner.list_unspent()
    }
    fn list_spent(&self) -> Result<Vec<Token>, StoreError> {
        self.inner.list_spent()
    }
    fn update_received_date(&self, id: &str, date_received: i64) -> Result<bool, StoreError> {
        self.inner.update_received_date(id, date_received)
    }
    fn save_received(&self, spending_id: &str, received_at: i64) -> Result<(), StoreError> {
        if self.fail_save_received.load(Ordering::SeqCst) {
            return Err(StoreError::DatabaseError("disk full".to_string()));
        }
        self.inner.save_received(spending_id, received_at)
    }
    fn list_received(&self) -> Result<Vec<(String, i64)>, StoreError> {
        self.inner.list_received()
    }
    fn delete_received(&self, spending_id: &str) -> Result<(), StoreError> {
        self.inner.delete_received(spending_id)
    }
    fn clear_received(&self) -> Result<(), StoreError> {
        self.inner.clear_received()
    }
    fn save_filter(&self, slot: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.inner.save_filter(slot, bytes)
    }
    fn get_filter(&self, slot: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get_filter(slot)
    }
    fn delete_filter(&self, slot: &str) -> Result<(), StoreError> {
        self.inner.delete_filter(slot)
    }
}

struct Party {
    store: Arc<FlakyStore>,
    ledger: SharedLedger,
    wallet: Wallet,
}

impl Party {
    fn new(verifier: &TokenVerifier, tokens: &[Token]) -> Self {
        let store = Arc::new(FlakyStore::with_tokens(tokens));
        let ledger = DoubleSpendLedger::open(LedgerConfig::default(), store.clone(), 0).unwrap();
        let ledger = SharedLedger::new(ledger);
        let wallet = Wallet::new(store.clone(), ledger.clone(), verifier.clone());
        Self { store, ledger, wallet }
    }

    fn transfer(&self) -> OfflineTransfer {
        OfflineTransfer::new(self.wallet.clone(), TransferConfig::default())
    }

    fn balance(&self) -> i64 {
        self.store.balance().unwrap()
    }
}

/// Holder A's wallet: {5, 5, 10}
fn holder_tokens(signer: &TokenSigner, owner: &str) -> Vec<Token> {
    vec![
        signer.issue(owner, 5, 1),
        signer.issue(owner, 5, 2),
        signer.issue(owner, 10, 3),
    ]
}

fn ids(tokens: &[Token]) -> Vec<String> {
    let mut ids: Vec<String> = tokens.iter().map(|t| t.id().to_string()).collect();
    ids.sort();
    ids
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl TransferListener for Recorder {
    fn on_connected(&self, role: Role) {
        self.push(format!("connected:{}", role));
    }

    fn on_phase_changed(&self, from: TransferPhase, to: TransferPhase) {
        self.push(format!("phase:{}->{}", from, to));
    }

    fn on_completed(&self, outcome: &TransferOutcome) {
        self.push(format!("completed:{}", outcome.total_amount));
    }

    fn on_error(&self, error: &TransferError) {
        self.push(format!("error:{}", error.code()));
    }
}

/// Pay `amount` from `holder` to `merchant` over an in-process network
async fn pay(
    holder: &Party,
    merchant: &Party,
    amount: i64,
) -> (
    Result<TransferOutcome, TransferError>,
    Result<TransferOutcome, TransferError>,
) {
    let network = MemoryNetwork::new();
    let mut merchant_transport = network.transport("merchant");
    let address = merchant_transport.bind().unwrap();
    let mut holder_transport = network.transport("holder");

    let sending = holder.transfer();
    let receiving = merchant.transfer();
    let result = tokio::join!(
        sending.send(&mut holder_transport, &address, amount),
        receiving.receive(&mut merchant_transport, SERVICE, None),
    );
    assert!(!network.is_listening("merchant"));
    result
}

// ============================================================================
// HAPPY PATH
// ============================================================================

#[tokio::test]
async fn test_payment_over_memory_network() {
    let signer = TokenSigner::new(IssuerKeypair::generate());
    let holder = Party::new(&signer.verifier(), &holder_tokens(&signer, "alice"));
    let merchant = Party::new(&signer.verifier(), &[]);

    let sender_listener = Arc::new(Recorder::default());
    let receiver_listener = Arc::new(Recorder::default());

    let network = MemoryNetwork::new();
    let mut merchant_transport = network.transport("merchant");
    let address = merchant_transport.bind().unwrap();
    let mut holder_transport = network.transport("holder");

    let sending = holder.transfer().with_listener(sender_listener.clone());
    let receiving = merchant.transfer().with_listener(receiver_listener.clone());
    let (sent, received) = tokio::join!(
        sending.send(&mut holder_transport, &address, 10),
        receiving.receive(&mut merchant_transport, SERVICE, Some(10)),
    );
    let sent = sent.unwrap();
    let received = received.unwrap();

    assert_eq!(sent.role, Role::Sender);
    assert_eq!(received.role, Role::Receiver);
    assert_eq!(sent.seed, received.seed);
    assert_eq!(ids(&sent.tokens), ids(&received.tokens));
    assert!(sent.total_amount >= 10);
    assert_eq!(sent.total_amount, received.total_amount);

    // holder's tokens are spent, merchant holds them unspent
    assert_eq!(holder.balance(), 20 - sent.total_amount);
    assert_eq!(merchant.balance(), received.total_amount);
    for token in &received.tokens {
        assert!(holder.store.get(token.id()).unwrap().unwrap().is_spent());
        let stored = merchant.store.get(token.id()).unwrap().unwrap();
        assert!(stored.date_received().is_some());
        assert!(merchant.ledger.lock().await.is_seen(token.id()));
    }

    assert_eq!(sending.phase(), TransferPhase::Completed);
    assert_eq!(receiving.phase(), TransferPhase::Completed);
    let completed = format!("completed:{}", sent.total_amount);
    assert_eq!(
        sender_listener.events(),
        vec![
            "phase:not_started->connecting",
            "phase:connecting->connected",
            "connected:sender",
            "phase:connected->sending_tokens",
            "phase:sending_tokens->completed",
            completed.as_str(),
        ]
    );
    assert_eq!(receiver_listener.count("connected:receiver"), 1);
    assert_eq!(receiver_listener.count("phase:connected->sending_seed"), 1);
    assert!(!network.is_listening("merchant"));
}

#[tokio::test]
async fn test_payment_over_tcp() {
    let signer = TokenSigner::new(IssuerKeypair::generate());
    let holder = Party::new(&signer.verifier(), &holder_tokens(&signer, "alice"));
    let merchant = Party::new(&signer.verifier(), &[]);

    let mut merchant_transport = TcpTransport::new(TcpTransportConfig::new().with_bind_address("127.0.0.1"));
    let address = merchant_transport.bind().await.unwrap();
    let mut holder_transport = TcpTransport::new(TcpTransportConfig::new());

    let sending = holder.transfer();
    let receiving = merchant.transfer();
    let (sent, received) = tokio::join!(
        sending.send(&mut holder_transport, &address, 20),
        receiving.receive(&mut merchant_transport, SERVICE, None),
    );

    let sent = sent.unwrap();
    assert_eq!(sent.total_amount, 20);
    assert_eq!(ids(&sent.tokens), ids(&received.unwrap().tokens));
    assert_eq!(holder.balance(), 0);
    assert_eq!(merchant.balance(), 20);
}

// ============================================================================
// DOUBLE SPENDING
// ============================================================================

#[tokio::test]
async fn test_replay_to_same_merchant_is_rejected() {
    let signer = TokenSigner::new(IssuerKeypair::generate());
    let tokens = holder_tokens(&signer, "alice");
    let holder = Party::new(&signer.verifier(), &tokens);
    let merchant = Party::new(&signer.verifier(), &[]);

    let (sent, received) = pay(&holder, &merchant, 20).await;
    sent.unwrap();
    received.unwrap();
    assert_eq!(merchant.balance(), 20);

    // a copy of the wallet taken before paying still shows the tokens unspent
    let cheater = Party::new(&signer.verifier(), &tokens);
    let (sent, received) = pay(&cheater, &merchant, 20).await;

    assert!(matches!(
        received,
        Err(TransferError::OfflineDoubleSpendingDetected { .. })
    ));
    match sent {
        Err(TransferError::Rejected { code, .. }) => assert_eq!(code, RejectionCode::OfflineDoubleSpendingDetected),
        other => panic!("expected a rejection, got {:?}", other),
    }
    assert_eq!(cheater.balance(), 20);
    assert_eq!(merchant.balance(), 20);
    assert_eq!(merchant.store.list_unspent().unwrap().len(), 3);
}

#[tokio::test]
async fn test_gossiped_filter_protects_other_merchants() {
    let signer = TokenSigner::new(IssuerKeypair::generate());
    let verifier = signer.verifier();
    let a_tokens = holder_tokens(&signer, "alice");

    let holder_a = Party::new(&verifier, &a_tokens);
    let holder_b = Party::new(&verifier, &holder_tokens(&signer, "bob"));
    let merchant = Party::new(&verifier, &[]);

    // A pays the merchant; nobody has a filter to share yet
    let (sent, _) = pay(&holder_a, &merchant, 20).await;
    assert_eq!(sent.unwrap().filter_outcome, None);

    // B pays the same merchant and picks up its filter along with the seed
    let (sent, received) = pay(&holder_b, &merchant, 5).await;
    assert_eq!(sent.unwrap().filter_outcome, Some(ReconcileOutcome::IncludedReceived));
    assert_eq!(received.unwrap().filter_outcome, None);
    {
        let ledger = holder_b.ledger.lock().await;
        for token in &a_tokens {
            assert!(ledger.is_seen(token.id()));
        }
    }

    // A's stale copy now fails at B as well, though B never met A
    let cheater = Party::new(&verifier, &a_tokens);
    let (sent, received) = pay(&cheater, &holder_b, 20).await;
    assert!(matches!(
        received,
        Err(TransferError::OfflineDoubleSpendingDetected { .. })
    ));
    assert!(sent.is_err());
    assert_eq!(cheater.balance(), 20);
}

#[tokio::test]
async fn test_no_gossip_when_disabled() {
    let signer = TokenSigner::new(IssuerKeypair::generate());
    let verifier = signer.verifier();
    let holder_a = Party::new(&verifier, &holder_tokens(&signer, "alice"));
    let holder_b = Party::new(&verifier, &holder_tokens(&signer, "bob"));
    let merchant = Party::new(&verifier, &[]);
    pay(&holder_a, &merchant, 20).await.0.unwrap();

    let network = MemoryNetwork::new();
    let mut merchant_transport = network.transport("merchant");
    let address = merchant_transport.bind().unwrap();
    let mut holder_transport = network.transport("holder");
    let quiet = TransferConfig::default().with_share_filters(false);

    let sending = OfflineTransfer::new(holder_b.wallet.clone(), quiet.clone());
    let receiving = OfflineTransfer::new(merchant.wallet.clone(), quiet);
    let (sent, _) = tokio::join!(
        sending.send(&mut holder_transport, &address, 5),
        receiving.receive(&mut merchant_transport, SERVICE, None),
    );

    assert_eq!(sent.unwrap().filter_outcome, None);
    assert_eq!(holder_b.ledger.lock().await.received_filters(), 0);
}

// ============================================================================
// STORAGE FAILURES
// ============================================================================

fn assert_storage_rejection(sent: Result<TransferOutcome, TransferError>) {
    match sent {
        Err(TransferError::Rejected { code, .. }) => assert_eq!(code, RejectionCode::Storage),
        other => panic!("expected a storage rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_merchant_save_failure_keeps_nothing() {
    let signer = TokenSigner::new(IssuerKeypair::generate());
    let tokens = holder_tokens(&signer, "alice");
    let holder = Party::new(&signer.verifier(), &tokens);
    let merchant = Party::new(&signer.verifier(), &[]);

    merchant.store.fail_save(2);
    let (sent, received) = pay(&holder, &merchant, 20).await;

    assert!(matches!(received, Err(TransferError::Storage(_))));
    assert_storage_rejection(sent);
    assert_eq!(merchant.balance(), 0);
    assert!(merchant.store.list_spent().unwrap().is_empty());
    assert_eq!(holder.balance(), 20);
    {
        let ledger = merchant.ledger.lock().await;
        assert_eq!(ledger.received_count(), 0);
        assert!(tokens.iter().all(|t| !ledger.is_seen(t.id())));
    }

    // once the disk recovers the same tokens are accepted, not flagged
    merchant.store.heal();
    let (sent, received) = pay(&holder, &merchant, 20).await;
    sent.unwrap();
    received.unwrap();
    assert_eq!(merchant.balance(), 20);
    assert_eq!(holder.balance(), 0);
}

#[tokio::test]
async fn test_merchant_ledger_failure_removes_saved_tokens() {
    let signer = TokenSigner::new(IssuerKeypair::generate());
    let tokens = holder_tokens(&signer, "alice");
    let holder = Party::new(&signer.verifier(), &tokens);
    let merchant = Party::new(&signer.verifier(), &[]);

    merchant.store.fail_save_received(true);
    let (sent, received) = pay(&holder, &merchant, 10).await;

    assert!(matches!(received, Err(TransferError::Storage(_))));
    assert_storage_rejection(sent);
    assert_eq!(merchant.balance(), 0);
    assert!(tokens.iter().all(|t| merchant.store.get(t.id()).unwrap().is_none()));
    assert_eq!(merchant.ledger.lock().await.received_count(), 0);
    assert!(merchant.store.list_received().unwrap().is_empty());
    assert_eq!(holder.balance(), 20);
}

#[tokio::test]
async fn test_holder_mark_spent_failure_spends_nothing() {
    let signer = TokenSigner::new(IssuerKeypair::generate());
    let holder = Party::new(&signer.verifier(), &holder_tokens(&signer, "alice"));
    let merchant = Party::new(&signer.verifier(), &[]);

    holder.store.fail_mark_spent(2);
    let (sent, received) = pay(&holder, &merchant, 20).await;

    assert!(matches!(sent, Err(TransferError::Storage(_))));
    received.unwrap();
    assert_eq!(holder.balance(), 20);
    assert!(holder.store.list_spent().unwrap().is_empty());
}

// ============================================================================
// SETTLEMENT
// ============================================================================

#[tokio::test]
async fn test_both_sides_write_up_the_same_payment() {
    let signer = TokenSigner::new(IssuerKeypair::generate());
    let tokens = holder_tokens(&signer, "alice");
    let holder = Party::new(&signer.verifier(), &tokens);
    let merchant = Party::new(&signer.verifier(), &[]);

    let (sent, received) = pay(&holder, &merchant, 20).await;
    let sent = sent.unwrap();
    let received = received.unwrap();
    assert_eq!(received.peer, PeerAddress::memory("holder"));
    assert_eq!(sent.peer, PeerAddress::memory("merchant"));

    let online = Arc::new(RecordingSubmitter::new());
    let config = SettlerConfig::new().with_retry_delay(Duration::ZERO);
    let mut settler = Settler::new(config, online.clone()).unwrap();

    let merchant_key = IssuerKeypair::generate();
    let receipt = settler.settle_outcome(&received, &merchant_key, "shop").await.unwrap();
    assert_eq!(receipt.amount(), 20);

    let accepted = online.accepted();
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].seed(), received.seed);
    assert_eq!(accepted[0].receiver(), "shop");
    assert_eq!(accepted[0].sender(), "mem://holder");
    let mut settled_ids = accepted[0].token_ids().to_vec();
    settled_ids.sort();
    assert_eq!(settled_ids, ids(&tokens));

    // the holder's write-up of the same tokens is refused online
    let err = settler
        .settle_outcome(&sent, &IssuerKeypair::generate(), "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, SubmissionError::InvalidProposal(_)));
    assert_eq!(settler.stats().settled, 1);
    assert_eq!(settler.stats().failed, 1);
}

// ============================================================================
// MISBEHAVING PEERS
// ============================================================================

#[tokio::test]
async fn test_forged_tokens_are_rejected() {
    let signer = TokenSigner::new(IssuerKeypair::generate());
    let merchant = Party::new(&signer.verifier(), &[]);
    let receiving = merchant.transfer();
    let (ours, mut theirs) = MemoryConnection::pair(MAX_FRAME);

    let forger = async {
        let frame = theirs.receive().await.unwrap();
        assert!(matches!(
            TransferMessage::from_bytes(&frame).unwrap(),
            Some(TransferMessage::Seed { .. })
        ));

        let inflated = vec![signer.issue("mallory", 1, 1).with_amount(1_000)];
        let tokens = TransferMessage::tokens(&inflated, None).unwrap();
        theirs.send(&tokens.to_bytes().unwrap()).await.unwrap();
        theirs.receive().await.unwrap()
    };

    let (received, notice) = tokio::join!(receiving.receive_on(Box::new(ours), None), forger);

    assert!(matches!(received, Err(TransferError::ForgedTokenSignature { .. })));
    match TransferMessage::from_bytes(&notice).unwrap() {
        Some(TransferMessage::Rejected { code, .. }) => assert_eq!(code, RejectionCode::ForgedTokenSignature),
        other => panic!("expected a rejection notice, got {:?}", other),
    }
    assert_eq!(merchant.balance(), 0);
    assert_eq!(merchant.ledger.lock().await.received_count(), 0);
    assert_eq!(receiving.phase(), TransferPhase::Error);
}

#[tokio::test]
async fn test_unknown_and_stale_messages_are_skipped() {
    let signer = TokenSigner::new(IssuerKeypair::generate());
    let holder = Party::new(&signer.verifier(), &holder_tokens(&signer, "alice"));
    let sending = holder.transfer();
    let (ours, mut theirs) = MemoryConnection::pair(MAX_FRAME);

    let merchant = async {
        theirs.send(br#"{"type":"hello","version":2}"#).await.unwrap();
        theirs.send(&TransferMessage::completed().to_bytes().unwrap()).await.unwrap();
        theirs.send(&TransferMessage::seed("m1", None).to_bytes().unwrap()).await.unwrap();

        let frame = theirs.receive().await.unwrap();
        let Some(TransferMessage::Tokens { tokens, .. }) = TransferMessage::from_bytes(&frame).unwrap() else {
            panic!("expected tokens");
        };
        theirs.send(&TransferMessage::completed().to_bytes().unwrap()).await.unwrap();
        TokenCodec::decode_base64(&tokens).unwrap()
    };

    let (sent, handed_over) = tokio::join!(sending.send_on(Box::new(ours), 10), merchant);
    let sent = sent.unwrap();
    assert_eq!(sent.seed, "m1");
    assert_eq!(ids(&sent.tokens), ids(&handed_over));
    assert_eq!(holder.balance(), 20 - sent.total_amount);
}

// ============================================================================
// DISCONNECTS, TIMEOUTS AND STOP
// ============================================================================

#[tokio::test]
async fn test_disconnect_while_sending_tokens() {
    let signer = TokenSigner::new(IssuerKeypair::generate());
    let holder = Party::new(&signer.verifier(), &holder_tokens(&signer, "alice"));
    let listener = Arc::new(Recorder::default());
    let sending = holder.transfer().with_listener(listener.clone());
    let (ours, mut theirs) = MemoryConnection::pair(MAX_FRAME);

    let vanishing_merchant = async {
        theirs.send(&TransferMessage::seed("m1", None).to_bytes().unwrap()).await.unwrap();
        let frame = theirs.receive().await.unwrap();
        theirs.close().await.unwrap();
        frame
    };

    let (sent, frame) = tokio::join!(sending.send_on(Box::new(ours), 10), vanishing_merchant);

    assert!(matches!(
        TransferMessage::from_bytes(&frame).unwrap(),
        Some(TransferMessage::Tokens { .. })
    ));
    assert_eq!(sent, Err(TransferError::TransportFailure(TransportError::Closed)));
    assert_eq!(sending.phase(), TransferPhase::Error);
    assert_eq!(listener.count("connected:"), 1);
    assert_eq!(listener.events().last().map(String::as_str), Some("error:TRANSPORT_FAILURE"));

    // nothing was spent and stopping afterwards is silent
    assert_eq!(holder.balance(), 20);
    let before = listener.events();
    assert!(sending.stop());
    assert!(!sending.stop());
    assert_eq!(listener.events(), before);
    assert_eq!(sending.phase(), TransferPhase::Error);
}

#[tokio::test]
async fn test_silent_peer_times_out_with_notice() {
    let signer = TokenSigner::new(IssuerKeypair::generate());
    let holder = Party::new(&signer.verifier(), &holder_tokens(&signer, "alice"));
    let config = TransferConfig::default().with_response_timeout(Duration::from_millis(100));
    let sending = OfflineTransfer::new(holder.wallet.clone(), config);
    let (ours, mut theirs) = MemoryConnection::pair(MAX_FRAME);

    let (sent, notice) = tokio::join!(sending.send_on(Box::new(ours), 10), theirs.receive());

    assert!(matches!(sent, Err(TransferError::Timeout(_))));
    match TransferMessage::from_bytes(&notice.unwrap()).unwrap() {
        Some(TransferMessage::Rejected { code, .. }) => assert_eq!(code, RejectionCode::Timeout),
        other => panic!("expected a timeout notice, got {:?}", other),
    }
}

#[tokio::test]
async fn test_stop_while_listening() {
    let signer = TokenSigner::new(IssuerKeypair::generate());
    let merchant = Party::new(&signer.verifier(), &[]);
    let listener = Arc::new(Recorder::default());
    let receiving = merchant.transfer().with_listener(listener.clone());
    let stop = receiving.stop_handle();

    let network = MemoryNetwork::new();
    let mut transport = network.transport("merchant");

    let stopper = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(stop.stop());
    };
    let (received, _) = tokio::join!(receiving.receive(&mut transport, SERVICE, None), stopper);

    assert_eq!(received, Err(TransferError::Cancelled));
    assert_eq!(receiving.phase(), TransferPhase::Error);
    assert_eq!(listener.count("error:"), 0);
    assert_eq!(listener.events(), vec!["phase:not_started->connecting"]);
    assert!(!network.is_listening("merchant"));
}

#[tokio::test]
async fn test_stop_before_start() {
    let signer = TokenSigner::new(IssuerKeypair::generate());
    let holder = Party::new(&signer.verifier(), &holder_tokens(&signer, "alice"));
    let listener = Arc::new(Recorder::default());
    let sending = holder.transfer().with_listener(listener.clone());
    let (ours, _theirs) = MemoryConnection::pair(MAX_FRAME);

    assert!(sending.stop());
    assert_eq!(sending.send_on(Box::new(ours), 10).await, Err(TransferError::Cancelled));
    assert!(listener.events().is_empty());
    assert_eq!(holder.balance(), 20);
}

#[tokio::test]
async fn test_invalid_amount_fails_fast() {
    let signer = TokenSigner::new(IssuerKeypair::generate());
    let holder = Party::new(&signer.verifier(), &holder_tokens(&signer, "alice"));
    let (ours, _theirs) = MemoryConnection::pair(MAX_FRAME);

    let sending = holder.transfer();
    assert_eq!(sending.send_on(Box::new(ours), -5).await, Err(TransferError::InvalidAmount(-5)));
    assert_eq!(sending.phase(), TransferPhase::Error);
}

#[tokio::test]
async fn test_watch_phase_reports_completion() {
    let signer = TokenSigner::new(IssuerKeypair::generate());
    let holder = Party::new(&signer.verifier(), &holder_tokens(&signer, "alice"));
    let merchant = Party::new(&signer.verifier(), &[]);
    let (a, b) = MemoryConnection::pair(MAX_FRAME);

    let sending = holder.transfer();
    let receiving = merchant.transfer();
    let mut phases = receiving.watch_phase();
    assert_eq!(*phases.borrow(), TransferPhase::NotStarted);

    let (sent, received) = tokio::join!(sending.send_on(Box::new(a), 5), receiving.receive_on(Box::new(b), None));
    sent.unwrap();
    received.unwrap();

    assert!(phases.has_changed().unwrap());
    assert_eq!(*phases.borrow_and_update(), TransferPhase::Completed);
}
