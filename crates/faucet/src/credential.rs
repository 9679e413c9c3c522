//! secp256k1 request credentials
//!
//! HTTP callers prove who they are by signing a keccak-256 digest of the
//! action they request. The recovered address becomes the caller of the
//! [`CallContext`]; a credential that names a different `on_behalf_of`
//! identity produces a delegated context.

use crate::error::{FaucetError, FaucetResult};
use crate::identity::CallContext;
use drip_common::types::{Address, Timestamp};
use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Operations a credential can authorize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    GetTokens,
    Pause,
    Unpause,
    Deposit,
    TransferOwnership,
    RenounceOwnership,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::GetTokens => "get_tokens",
            Action::Pause => "pause",
            Action::Unpause => "unpause",
            Action::Deposit => "deposit",
            Action::TransferOwnership => "transfer_ownership",
            Action::RenounceOwnership => "renounce_ownership",
        }
    }
}

/// What a credential signs: one action against one dispenser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim<'a> {
    /// Ledger address of the dispenser the request is meant for
    pub dispenser: Address,
    pub action: Action,
    /// Action argument, empty when the action takes none
    pub payload: &'a str,
    pub issued_at: i64,
    /// Client-chosen; distinguishes otherwise identical requests
    pub nonce: u64,
    pub on_behalf_of: Option<Address>,
}

impl Claim<'_> {
    /// keccak-256 over
    /// `drip:<dispenser>:<action>:<issued_at>:<nonce>:<on_behalf_of>:<payload>`.
    ///
    /// Every field before the payload has a fixed alphabet without `:`.
    pub fn digest(&self) -> [u8; 32] {
        let message = format!(
            "drip:{}:{}:{}:{}:{}:{}",
            self.dispenser,
            self.action.as_str(),
            self.issued_at,
            self.nonce,
            self.on_behalf_of.as_ref().map(Address::to_hex).unwrap_or_default(),
            self.payload
        );
        keccak_hash::keccak(message.as_bytes()).0
    }
}

/// Signed statement attached to every mutating request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// SEC1-encoded public key, hex
    pub public_key: String,
    /// 64-byte `r || s` signature, hex
    pub signature: String,
    /// Unix seconds at signing time
    pub issued_at: i64,
    pub nonce: u64,
    /// Identity the signer claims to act for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_behalf_of: Option<Address>,
}

impl Credential {
    pub fn sign(key: &SigningKey, claim: &Claim<'_>) -> FaucetResult<Self> {
        let signature: Signature = key
            .sign_prehash(&claim.digest())
            .map_err(|e| FaucetError::InvalidCredential(format!("signing failed: {}", e)))?;

        Ok(Self {
            public_key: hex::encode(key.verifying_key().to_encoded_point(true).as_bytes()),
            signature: hex::encode(signature.to_bytes()),
            issued_at: claim.issued_at,
            nonce: claim.nonce,
            on_behalf_of: claim.on_behalf_of,
        })
    }

    fn claim<'a>(&self, dispenser: Address, action: Action, payload: &'a str) -> Claim<'a> {
        Claim {
            dispenser,
            action,
            payload,
            issued_at: self.issued_at,
            nonce: self.nonce,
            on_behalf_of: self.on_behalf_of,
        }
    }
}

/// Ethereum-style address: last 20 bytes of keccak(uncompressed point).
pub fn address_of(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let hash = keccak_hash::keccak(&point.as_bytes()[1..]); // Skip first byte
    let mut addr_bytes = [0u8; 20];
    addr_bytes.copy_from_slice(&hash.0[12..]);
    Address(addr_bytes)
}

/// Parses a 32-byte hex private key, with or without `0x`.
pub fn signing_key_from_hex(hex_key: &str) -> FaucetResult<SigningKey> {
    let bytes = hex::decode(strip_0x(hex_key))
        .map_err(|e| FaucetError::ConfigError(format!("Invalid private key: {}", e)))?;
    SigningKey::from_slice(&bytes)
        .map_err(|e| FaucetError::ConfigError(format!("Invalid signing key: {}", e)))
}

fn strip_0x(s: &str) -> &str {
    s.strip_prefix("0x").unwrap_or(s)
}

/// Verifies credentials addressed to one dispenser and rejects replays
/// within the validity window.
pub struct CredentialVerifier {
    dispenser: Address,
    ttl_secs: u64,
    seen: Cache<String, ()>,
}

impl CredentialVerifier {
    pub fn new(dispenser: Address, ttl_secs: u64) -> Self {
        let seen = Cache::builder()
            .max_capacity(100_000)
            .time_to_live(Duration::from_secs(ttl_secs.saturating_mul(2).max(1)))
            .build();
        Self {
            dispenser,
            ttl_secs,
            seen,
        }
    }

    /// Checks `credential` against `action`/`payload` at time `now` and
    /// returns the call context it establishes.
    pub fn verify(
        &self,
        credential: &Credential,
        action: Action,
        payload: &str,
        now: Timestamp,
    ) -> FaucetResult<CallContext> {
        let skew = (now as i64).saturating_sub(credential.issued_at).unsigned_abs();
        if skew > self.ttl_secs {
            return Err(FaucetError::InvalidCredential(format!(
                "issued at {}, more than {}s away from server time",
                credential.issued_at, self.ttl_secs
            )));
        }

        let key_bytes = hex::decode(strip_0x(&credential.public_key))
            .map_err(|e| FaucetError::InvalidCredential(format!("public key: {}", e)))?;
        let key = VerifyingKey::from_sec1_bytes(&key_bytes)
            .map_err(|_| FaucetError::InvalidCredential("public key is not a secp256k1 point".to_string()))?;

        let sig_bytes = hex::decode(strip_0x(&credential.signature))
            .map_err(|e| FaucetError::InvalidCredential(format!("signature: {}", e)))?;
        let signature = Signature::from_slice(&sig_bytes)
            .map_err(|_| FaucetError::InvalidCredential("malformed signature".to_string()))?;

        let digest = credential.claim(self.dispenser, action, payload).digest();
        key.verify_prehash(&digest, &signature)
            .map_err(|_| FaucetError::InvalidCredential("signature does not match request".to_string()))?;

        let caller = address_of(&key);
        // The digest covers the nonce, so only an exact resubmission collides.
        let replay_key = format!("{}:{}", caller, hex::encode(digest));
        if !self.seen.entry(replay_key).or_insert(()).is_fresh() {
            return Err(FaucetError::InvalidCredential("credential already used".to_string()));
        }

        debug!("Verified {} credential for {}", action.as_str(), caller);
        Ok(match credential.on_behalf_of {
            Some(origin) => CallContext::delegated(caller, origin),
            None => CallContext::direct(caller),
        })
    }
}
