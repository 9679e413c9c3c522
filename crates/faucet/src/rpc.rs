//! Token ledger reached over Ethereum JSON-RPC
//!
//! Balances are read with `eth_call`; transfers are legacy EIP-155
//! transactions signed by the dispenser's own key and followed until a
//! receipt arrives.

use crate::credential::address_of;
use crate::ledger::{Ledger, LedgerError, LedgerResult, TxHash};
use async_trait::async_trait;
use drip_common::types::{Address, Amount};
use k256::ecdsa::SigningKey;
use rlp::RlpStream;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// RPC client for interacting with blockchain
pub struct BlockchainRpcClient {
    rpc_url: String,
    client: reqwest::Client,
}

impl BlockchainRpcClient {
    pub fn new(rpc_url: String) -> Self {
        Self {
            rpc_url,
            client: reqwest::Client::new(),
        }
    }

    async fn call(&self, method: &str, params: Value) -> LedgerResult<Value> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let response = self
            .client
            .post(&self.rpc_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| LedgerError::Rpc(format!("Request failed: {}", e)))?;

        let json: Value = response
            .json()
            .await
            .map_err(|e| LedgerError::Rpc(format!("Invalid response: {}", e)))?;

        if let Some(error) = json.get("error") {
            return Err(LedgerError::Rpc(error.to_string()));
        }

        Ok(json.get("result").cloned().unwrap_or(Value::Null))
    }

    pub async fn eth_call(&self, to: &Address, data: &[u8]) -> LedgerResult<Vec<u8>> {
        let result = self
            .call(
                "eth_call",
                json!([{ "to": to.to_hex(), "data": format!("0x{}", hex::encode(data)) }, "latest"]),
            )
            .await?;
        let hex_data = result
            .as_str()
            .ok_or_else(|| LedgerError::Rpc("eth_call returned a non-string result".to_string()))?;
        hex::decode(hex_data.trim_start_matches("0x"))
            .map_err(|e| LedgerError::Rpc(format!("eth_call returned invalid hex: {}", e)))
    }

    pub async fn get_transaction_count(&self, address: &Address) -> LedgerResult<u64> {
        let result = self
            .call("eth_getTransactionCount", json!([address.to_hex(), "pending"]))
            .await?;
        parse_u64(&result)
    }

    pub async fn get_chain_id(&self) -> LedgerResult<u64> {
        let result = self.call("eth_chainId", json!([])).await?;
        parse_u64(&result)
    }

    pub async fn send_raw_transaction(&self, tx: &[u8]) -> LedgerResult<String> {
        let result = self
            .call("eth_sendRawTransaction", json!([format!("0x{}", hex::encode(tx))]))
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| LedgerError::Rpc("eth_sendRawTransaction returned no hash".to_string()))
    }

    /// `Some(true)` once mined successfully, `Some(false)` if reverted,
    /// `None` while pending.
    pub async fn get_receipt_status(&self, tx_hash: &str) -> LedgerResult<Option<bool>> {
        let receipt = self.call("eth_getTransactionReceipt", json!([tx_hash])).await?;
        if receipt.is_null() {
            return Ok(None);
        }
        let status = receipt.get("status").cloned().unwrap_or(Value::Null);
        Ok(Some(parse_quantity(&status)? == 1))
    }
}

/// Parses a `0x`-prefixed JSON-RPC quantity.
fn parse_quantity(value: &Value) -> LedgerResult<u128> {
    let s = value
        .as_str()
        .ok_or_else(|| LedgerError::Rpc(format!("expected hex quantity, got {}", value)))?;
    let digits = s.trim_start_matches("0x");
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16)
        .map_err(|e| LedgerError::Rpc(format!("invalid quantity {}: {}", s, e)))
}

fn parse_u64(value: &Value) -> LedgerResult<u64> {
    let quantity = parse_quantity(value)?;
    u64::try_from(quantity)
        .map_err(|_| LedgerError::Rpc(format!("quantity {} does not fit in 64 bits", quantity)))
}

/// First four bytes of keccak(signature).
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak_hash::keccak(signature.as_bytes());
    let mut out = [0u8; 4];
    out.copy_from_slice(&hash.0[..4]);
    out
}

fn encode_address(address: &Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address.as_bytes());
    word
}

fn encode_amount(amount: Amount) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&amount.to_be_bytes());
    word
}

/// ABI calldata for `signature` with 32-byte word arguments.
pub fn calldata(signature: &str, words: &[[u8; 32]]) -> Vec<u8> {
    let mut data = selector(signature).to_vec();
    for word in words {
        data.extend_from_slice(word);
    }
    data
}

/// Decodes a single `uint256` return value that must fit in an [`Amount`].
fn decode_amount(word: &[u8]) -> LedgerResult<Amount> {
    if word.len() != 32 {
        return Err(LedgerError::Rpc(format!("expected 32-byte word, got {} bytes", word.len())));
    }
    if word[..16].iter().any(|b| *b != 0) {
        return Err(LedgerError::Rpc("balance exceeds 128 bits".to_string()));
    }
    let mut low = [0u8; 16];
    low.copy_from_slice(&word[16..]);
    Ok(Amount::from_be_bytes(low))
}

fn trim_leading_zeros(bytes: &[u8]) -> &[u8] {
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[first..]
}

/// Legacy transaction fields that get signed.
#[derive(Debug, Clone)]
pub struct LegacyTransaction {
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub to: Address,
    pub data: Vec<u8>,
    pub chain_id: u64,
}

impl LegacyTransaction {
    fn append_common(&self, stream: &mut RlpStream) {
        stream.append(&self.nonce);
        stream.append(&self.gas_price);
        stream.append(&self.gas_limit);
        stream.append(&self.to.as_bytes().to_vec());
        stream.append(&0u8); // value
        stream.append(&self.data);
    }

    /// keccak of the EIP-155 signing payload.
    pub fn signing_hash(&self) -> [u8; 32] {
        let mut stream = RlpStream::new();
        stream.begin_list(9);
        self.append_common(&mut stream);
        stream.append(&self.chain_id);
        stream.append(&0u8);
        stream.append(&0u8);
        keccak_hash::keccak(&stream.out()).0
    }

    /// RLP-encoded signed transaction.
    pub fn sign(&self, key: &SigningKey) -> LedgerResult<Vec<u8>> {
        let hash = self.signing_hash();
        let (signature, recovery_id) = key
            .sign_prehash_recoverable(&hash)
            .map_err(|e| LedgerError::Signing(e.to_string()))?;

        let v = self.chain_id * 2 + 35 + u64::from(recovery_id.to_byte());
        let r = signature.r().to_bytes();
        let s = signature.s().to_bytes();

        let mut stream = RlpStream::new();
        stream.begin_list(9);
        self.append_common(&mut stream);
        stream.append(&v);
        stream.append(&trim_leading_zeros(&r).to_vec());
        stream.append(&trim_leading_zeros(&s).to_vec());
        Ok(stream.out().to_vec())
    }
}

/// Gas and receipt settings for [`RpcLedger`].
#[derive(Debug, Clone)]
pub struct RpcLedgerOptions {
    pub chain_id: Option<u64>,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub receipt_poll_interval: Duration,
    pub receipt_attempts: u32,
}

impl Default for RpcLedgerOptions {
    fn default() -> Self {
        Self {
            chain_id: None,
            gas_price: 1_000_000_000, // 1 Gwei
            gas_limit: 100_000,
            receipt_poll_interval: Duration::from_secs(1),
            receipt_attempts: 60,
        }
    }
}

/// ERC-20 style token contract driven through JSON-RPC.
pub struct RpcLedger {
    rpc: BlockchainRpcClient,
    token: Address,
    signing_key: SigningKey,
    signer: Address,
    options: RpcLedgerOptions,
    // One outstanding transaction at a time keeps nonces sequential.
    submit_lock: Mutex<()>,
}

impl RpcLedger {
    pub fn new(rpc_url: String, token: Address, signing_key: SigningKey, options: RpcLedgerOptions) -> Self {
        let signer = address_of(signing_key.verifying_key());
        info!("RPC ledger for token {} signing as {}", token, signer);
        Self {
            rpc: BlockchainRpcClient::new(rpc_url),
            token,
            signing_key,
            signer,
            options,
            submit_lock: Mutex::new(()),
        }
    }

    pub fn signer(&self) -> Address {
        self.signer
    }

    fn ensure_signer(&self, requested: &Address) -> LedgerResult<()> {
        if *requested != self.signer {
            return Err(LedgerError::UnknownSigner {
                signer: self.signer,
                requested: *requested,
            });
        }
        Ok(())
    }

    /// Signs, submits and waits for a call to the token contract.
    async fn execute(&self, data: Vec<u8>) -> LedgerResult<String> {
        let _guard = self.submit_lock.lock().await;

        let chain_id = match self.options.chain_id {
            Some(id) => id,
            None => self.rpc.get_chain_id().await?,
        };
        let tx = LegacyTransaction {
            nonce: self.rpc.get_transaction_count(&self.signer).await?,
            gas_price: self.options.gas_price,
            gas_limit: self.options.gas_limit,
            to: self.token,
            data,
            chain_id,
        };

        let raw = tx.sign(&self.signing_key)?;
        let tx_hash = self.rpc.send_raw_transaction(&raw).await?;
        debug!("Transaction sent: {} (nonce {})", tx_hash, tx.nonce);

        // From here on the transaction may be mined; only a receipt says otherwise.
        for _ in 0..self.options.receipt_attempts {
            match self.rpc.get_receipt_status(&tx_hash).await {
                Ok(Some(true)) => {
                    info!("Transaction confirmed: {}", tx_hash);
                    return Ok(tx_hash);
                }
                Ok(Some(false)) => {
                    warn!("Transaction reverted: {}", tx_hash);
                    return Err(LedgerError::Reverted(tx_hash));
                }
                Ok(None) => tokio::time::sleep(self.options.receipt_poll_interval).await,
                Err(e) => {
                    warn!("Receipt lookup for {} failed: {}", tx_hash, e);
                    return Err(LedgerError::Unconfirmed {
                        tx_hash,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(LedgerError::Unconfirmed {
            reason: format!("no receipt after {} attempts", self.options.receipt_attempts),
            tx_hash,
        })
    }
}

#[async_trait]
impl Ledger for RpcLedger {
    fn asset(&self) -> Address {
        self.token
    }

    async fn balance_of(&self, holder: &Address) -> LedgerResult<Amount> {
        let data = calldata("balanceOf(address)", &[encode_address(holder)]);
        let result = self.rpc.eth_call(&self.token, &data).await?;
        decode_amount(&result)
    }

    async fn transfer(&self, from: &Address, to: &Address, amount: Amount) -> LedgerResult<TxHash> {
        self.ensure_signer(from)?;
        let data = calldata(
            "transfer(address,uint256)",
            &[encode_address(to), encode_amount(amount)],
        );
        self.execute(data).await.map(Some)
    }

    async fn transfer_from(
        &self,
        spender: &Address,
        owner: &Address,
        to: &Address,
        amount: Amount,
    ) -> LedgerResult<TxHash> {
        self.ensure_signer(spender)?;
        let data = calldata(
            "transferFrom(address,address,uint256)",
            &[encode_address(owner), encode_address(to), encode_amount(amount)],
        );
        self.execute(data).await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};

    #[test]
    fn test_erc20_selectors() {
        assert_eq!(hex::encode(selector("transfer(address,uint256)")), "a9059cbb");
        assert_eq!(hex::encode(selector("balanceOf(address)")), "70a08231");
        assert_eq!(
            hex::encode(selector("transferFrom(address,address,uint256)")),
            "23b872dd"
        );
    }

    #[test]
    fn test_transfer_calldata_layout() {
        let to = Address([0x11; 20]);
        let data = calldata("transfer(address,uint256)", &[encode_address(&to), encode_amount(0x0102)]);
        assert_eq!(data.len(), 4 + 64);
        assert_eq!(&data[4..16], &[0u8; 12]);
        assert_eq!(&data[16..36], to.as_bytes());
        assert_eq!(&data[66..], &[0x01, 0x02]);
    }

    #[test]
    fn test_decode_amount() {
        let word = encode_amount(500_000_000_000_000_000);
        assert_eq!(decode_amount(&word).unwrap(), 500_000_000_000_000_000);

        let mut huge = [0u8; 32];
        huge[0] = 1;
        assert!(decode_amount(&huge).is_err());
        assert!(decode_amount(&[0u8; 31]).is_err());
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity(&json!("0x7a69")).unwrap(), 31337);
        assert_eq!(parse_quantity(&json!("0x")).unwrap(), 0);
        assert!(parse_quantity(&json!(12)).is_err());
    }

    #[test]
    fn test_oversized_quantity_is_rejected() {
        assert_eq!(parse_u64(&json!("0xffffffffffffffff")).unwrap(), u64::MAX);
        assert!(matches!(
            parse_u64(&json!("0x10000000000000000")),
            Err(LedgerError::Rpc(_))
        ));
    }

    #[test]
    fn test_signed_transaction_recovers_signer() {
        let key = SigningKey::from_slice(&[3u8; 32]).unwrap();
        let tx = LegacyTransaction {
            nonce: 7,
            gas_price: 1_000_000_000,
            gas_limit: 100_000,
            to: Address([0x22; 20]),
            data: calldata("transfer(address,uint256)", &[encode_address(&Address([0x33; 20])), encode_amount(5)]),
            chain_id: 31337,
        };

        let raw = tx.sign(&key).unwrap();
        let decoded = rlp::Rlp::new(&raw);
        assert_eq!(decoded.item_count().unwrap(), 9);

        let v: u64 = decoded.val_at(6).unwrap();
        let r: Vec<u8> = decoded.val_at(7).unwrap();
        let s: Vec<u8> = decoded.val_at(8).unwrap();
        let recovery = RecoveryId::from_byte((v - 31337 * 2 - 35) as u8).unwrap();

        let mut rs = [0u8; 64];
        rs[32 - r.len()..32].copy_from_slice(&r);
        rs[64 - s.len()..].copy_from_slice(&s);
        let signature = Signature::from_slice(&rs).unwrap();

        let recovered =
            VerifyingKey::recover_from_prehash(&tx.signing_hash(), &signature, recovery).unwrap();
        assert_eq!(address_of(&recovered), address_of(key.verifying_key()));
    }

    #[tokio::test]
    async fn test_foreign_sender_is_refused_before_any_rpc() {
        let key = SigningKey::from_slice(&[3u8; 32]).unwrap();
        let ledger = RpcLedger::new(
            "http://127.0.0.1:9".to_string(),
            Address([0x22; 20]),
            key,
            RpcLedgerOptions::default(),
        );
        let stranger = Address([0x44; 20]);
        let err = ledger.transfer(&stranger, &stranger, 1).await.unwrap_err();
        assert!(matches!(err, LedgerError::UnknownSigner { requested, .. } if requested == stranger));
    }
}
