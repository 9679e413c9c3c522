//! Dispenser over the RPC ledger, against a local JSON-RPC node stub

use axum::{extract::State, routing::post, Json, Router};
use drip_common::types::{Address, Amount};
use drip_faucet::clock::ManualClock;
use drip_faucet::credential::signing_key_from_hex;
use drip_faucet::rpc::{RpcLedger, RpcLedgerOptions};
use drip_faucet::{CallContext, Dispenser, DispenserParams, FaucetDatabase, FaucetError, LedgerError};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const MAX_TOKENS: Amount = 1_000;
const INTERVAL: u64 = 3_600;
const START: u64 = 1_700_000_000;
const TX_HASH: &str = "0x5e1f0000000000000000000000000000000000000000000000000000000000aa";

const ASSET: Address = Address([0xaa; 20]);
const OWNER: Address = Address([0x0e; 20]);
const ALICE: Address = Address([0x01; 20]);

#[derive(Clone, Copy)]
enum Node {
    /// Mines the transaction successfully.
    Confirms,
    /// Mines the transaction with a failed status.
    Reverts,
    /// Accepts the transaction but never reports a receipt.
    NeverMines,
    /// Accepts the transaction, then fails every receipt lookup.
    LosesReceipts,
    /// Refuses the raw transaction.
    RejectsSend,
}

struct NodeState {
    behaviour: Node,
    sent: AtomicUsize,
}

async fn handle(State(node): State<Arc<NodeState>>, Json(request): Json<Value>) -> Json<Value> {
    let id = request["id"].clone();
    let method = request["method"].as_str().unwrap_or_default();
    let outcome: Result<Value, &str> = match (method, node.behaviour) {
        ("eth_call", _) => Ok(json!(format!("0x{}", "00".repeat(32)))),
        ("eth_getTransactionCount", _) => Ok(json!("0x0")),
        ("eth_sendRawTransaction", Node::RejectsSend) => Err("nonce too low"),
        ("eth_sendRawTransaction", _) => {
            node.sent.fetch_add(1, Ordering::SeqCst);
            Ok(json!(TX_HASH))
        }
        ("eth_getTransactionReceipt", Node::Confirms) => Ok(json!({ "status": "0x1" })),
        ("eth_getTransactionReceipt", Node::Reverts) => Ok(json!({ "status": "0x0" })),
        ("eth_getTransactionReceipt", Node::NeverMines) => Ok(Value::Null),
        ("eth_getTransactionReceipt", Node::LosesReceipts) => Err("header not found"),
        _ => Err("method not found"),
    };

    Json(match outcome {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err(message) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32000, "message": message }
        }),
    })
}

async fn spawn_node(behaviour: Node) -> (String, Arc<NodeState>) {
    let node = Arc::new(NodeState {
        behaviour,
        sent: AtomicUsize::new(0),
    });
    let app = Router::new().route("/", post(handle)).with_state(node.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (url, node)
}

async fn dispenser_on(behaviour: Node) -> (Dispenser, Arc<NodeState>) {
    let (url, node) = spawn_node(behaviour).await;
    let key = signing_key_from_hex(&format!("0x{}", "07".repeat(32))).unwrap();
    let options = RpcLedgerOptions {
        chain_id: Some(1337),
        receipt_poll_interval: Duration::from_millis(5),
        receipt_attempts: 3,
        ..RpcLedgerOptions::default()
    };
    let ledger = RpcLedger::new(url, ASSET, key, options);
    let faucet = ledger.signer();

    let dispenser = Dispenser::new(
        DispenserParams::new(ASSET, MAX_TOKENS, INTERVAL).unwrap(),
        OWNER,
        faucet,
        Arc::new(ledger),
        FaucetDatabase::temporary().unwrap(),
    )
    .unwrap()
    .with_clock(Arc::new(ManualClock::new(START)));
    (dispenser, node)
}

#[tokio::test]
async fn test_confirmed_transfer_records_tx_hash() {
    let (dispenser, node) = dispenser_on(Node::Confirms).await;

    let dispensed = dispenser.get_tokens(&CallContext::direct(ALICE)).await.unwrap();

    assert_eq!(dispensed.tx_hash.as_deref(), Some(TX_HASH));
    assert_eq!(node.sent.load(Ordering::SeqCst), 1);
    assert_eq!(dispenser.last_request_at(&ALICE).await.unwrap(), START);
    let history = dispenser.distributions_for(&ALICE).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].tx_hash.as_deref(), Some(TX_HASH));
}

#[tokio::test]
async fn test_unmined_transfer_keeps_request_record() {
    let (dispenser, node) = dispenser_on(Node::NeverMines).await;
    let ctx = CallContext::direct(ALICE);

    let err = dispenser.get_tokens(&ctx).await.unwrap_err();
    assert!(matches!(
        &err,
        FaucetError::Ledger(LedgerError::Unconfirmed { tx_hash, .. }) if tx_hash == TX_HASH
    ));
    assert_eq!(err.code(), "TRANSFER_UNCONFIRMED");

    assert_eq!(dispenser.last_request_at(&ALICE).await.unwrap(), START);
    let history = dispenser.distributions_for(&ALICE).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].tx_hash.as_deref(), Some(TX_HASH));

    // The pending transfer still counts, so no second one is sent.
    assert!(matches!(
        dispenser.get_tokens(&ctx).await,
        Err(FaucetError::TooSoon { retry_after: INTERVAL })
    ));
    assert_eq!(node.sent.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_receipt_lookup_keeps_request_record() {
    let (dispenser, _) = dispenser_on(Node::LosesReceipts).await;

    let err = dispenser.get_tokens(&CallContext::direct(ALICE)).await.unwrap_err();
    assert!(matches!(err, FaucetError::Ledger(LedgerError::Unconfirmed { .. })));
    assert_eq!(dispenser.last_request_at(&ALICE).await.unwrap(), START);
}

#[tokio::test]
async fn test_reverted_transfer_rolls_back() {
    let (dispenser, _) = dispenser_on(Node::Reverts).await;

    let err = dispenser.get_tokens(&CallContext::direct(ALICE)).await.unwrap_err();
    assert!(matches!(err, FaucetError::Ledger(LedgerError::Reverted(_))));
    assert_eq!(dispenser.last_request_at(&ALICE).await.unwrap(), 0);
    assert!(dispenser.distributions_for(&ALICE).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_refused_send_rolls_back() {
    let (dispenser, node) = dispenser_on(Node::RejectsSend).await;

    let err = dispenser.get_tokens(&CallContext::direct(ALICE)).await.unwrap_err();
    assert!(matches!(err, FaucetError::Ledger(LedgerError::Rpc(_))));
    assert_eq!(node.sent.load(Ordering::SeqCst), 0);
    assert_eq!(dispenser.last_request_at(&ALICE).await.unwrap(), 0);
    assert!(dispenser.distributions_for(&ALICE).await.unwrap().is_empty());
}
