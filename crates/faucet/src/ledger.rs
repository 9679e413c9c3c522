//! Asset ledger interface
//!
//! The dispenser never keeps balances itself. It reads and moves funds
//! through a [`Ledger`], which is either a remote token contract
//! ([`crate::rpc::RpcLedger`]) or the in-process [`MemoryLedger`].

use async_trait::async_trait;
use drip_common::types::{Address, Amount};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// Errors surfaced by a ledger. The dispenser propagates them unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("insufficient balance: {holder} holds {balance}, needs {needed}")]
    InsufficientBalance {
        holder: Address,
        balance: Amount,
        needed: Amount,
    },

    #[error("insufficient allowance: {spender} may move {allowance} from {owner}, needs {needed}")]
    InsufficientAllowance {
        owner: Address,
        spender: Address,
        allowance: Amount,
        needed: Amount,
    },

    #[error("invalid receiver: {0}")]
    InvalidReceiver(Address),

    #[error("balance overflow for {0}")]
    Overflow(Address),

    #[error("transaction reverted: {0}")]
    Reverted(String),

    /// The transaction was broadcast but its outcome is not known yet.
    #[error("transaction {tx_hash} sent but not confirmed: {reason}")]
    Unconfirmed { tx_hash: String, reason: String },

    #[error("ledger signer {signer} cannot act for {requested}")]
    UnknownSigner { signer: Address, requested: Address },

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("RPC error: {0}")]
    Rpc(String),
}

impl LedgerError {
    /// Whether the transfer may still take effect on the ledger.
    pub fn may_have_applied(&self) -> bool {
        matches!(self, LedgerError::Unconfirmed { .. })
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Ledger reference for a completed transfer; `None` for in-process ledgers.
pub type TxHash = Option<String>;

/// A transferable-balance store with owner approvals.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Address of the asset this ledger tracks.
    fn asset(&self) -> Address;

    async fn balance_of(&self, holder: &Address) -> LedgerResult<Amount>;

    /// Moves `amount` out of `from`'s own balance. `from` must be an
    /// identity the ledger can act for.
    async fn transfer(&self, from: &Address, to: &Address, amount: Amount) -> LedgerResult<TxHash>;

    /// Moves `amount` from `owner` to `to` on the strength of an allowance
    /// `owner` granted to `spender`.
    async fn transfer_from(
        &self,
        spender: &Address,
        owner: &Address,
        to: &Address,
        amount: Amount,
    ) -> LedgerResult<TxHash>;
}

#[derive(Debug, Default)]
struct Balances {
    balances: HashMap<Address, Amount>,
    allowances: HashMap<(Address, Address), Amount>,
}

impl Balances {
    fn balance(&self, holder: &Address) -> Amount {
        self.balances.get(holder).copied().unwrap_or(0)
    }

    fn credit(&mut self, holder: &Address, amount: Amount) -> LedgerResult<()> {
        let balance = self
            .balance(holder)
            .checked_add(amount)
            .ok_or(LedgerError::Overflow(*holder))?;
        self.balances.insert(*holder, balance);
        Ok(())
    }

    fn move_funds(&mut self, from: &Address, to: &Address, amount: Amount) -> LedgerResult<()> {
        if to.is_zero() {
            return Err(LedgerError::InvalidReceiver(*to));
        }
        let balance = self.balance(from);
        if balance < amount {
            return Err(LedgerError::InsufficientBalance {
                holder: *from,
                balance,
                needed: amount,
            });
        }
        if from == to {
            return Ok(());
        }
        // Credit first so an overflow leaves both balances untouched.
        self.credit(to, amount)?;
        self.balances.insert(*from, balance - amount);
        Ok(())
    }
}

/// In-process ledger used for local development and tests.
///
/// An allowance of `Amount::MAX` is treated as unlimited and never decremented.
#[derive(Debug)]
pub struct MemoryLedger {
    asset: Address,
    state: Mutex<Balances>,
}

impl MemoryLedger {
    pub fn new(asset: Address) -> Self {
        Self {
            asset,
            state: Mutex::new(Balances::default()),
        }
    }

    /// Creates `amount` new units for `to`.
    pub async fn mint(&self, to: &Address, amount: Amount) -> LedgerResult<()> {
        if to.is_zero() {
            return Err(LedgerError::InvalidReceiver(*to));
        }
        self.state.lock().await.credit(to, amount)?;
        debug!("Minted {} to {}", amount, to);
        Ok(())
    }

    /// Lets `spender` move up to `amount` of `owner`'s balance.
    pub async fn approve(&self, owner: &Address, spender: &Address, amount: Amount) {
        self.state
            .lock()
            .await
            .allowances
            .insert((*owner, *spender), amount);
    }

    pub async fn allowance(&self, owner: &Address, spender: &Address) -> Amount {
        self.state
            .lock()
            .await
            .allowances
            .get(&(*owner, *spender))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    fn asset(&self) -> Address {
        self.asset
    }

    async fn balance_of(&self, holder: &Address) -> LedgerResult<Amount> {
        Ok(self.state.lock().await.balance(holder))
    }

    async fn transfer(&self, from: &Address, to: &Address, amount: Amount) -> LedgerResult<TxHash> {
        self.state.lock().await.move_funds(from, to, amount)?;
        Ok(None)
    }

    async fn transfer_from(
        &self,
        spender: &Address,
        owner: &Address,
        to: &Address,
        amount: Amount,
    ) -> LedgerResult<TxHash> {
        let mut state = self.state.lock().await;
        let key = (*owner, *spender);
        let allowance = state.allowances.get(&key).copied().unwrap_or(0);
        if allowance < amount {
            return Err(LedgerError::InsufficientAllowance {
                owner: *owner,
                spender: *spender,
                allowance,
                needed: amount,
            });
        }
        state.move_funds(owner, to, amount)?;
        if allowance != Amount::MAX {
            state.allowances.insert(key, allowance - amount);
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> Address {
        Address([byte; 20])
    }

    #[tokio::test]
    async fn test_transfer_moves_balance() {
        let ledger = MemoryLedger::new(addr(0xaa));
        ledger.mint(&addr(1), 100).await.unwrap();

        assert_eq!(ledger.transfer(&addr(1), &addr(2), 40).await.unwrap(), None);

        assert_eq!(ledger.balance_of(&addr(1)).await.unwrap(), 60);
        assert_eq!(ledger.balance_of(&addr(2)).await.unwrap(), 40);
        assert_eq!(ledger.asset(), addr(0xaa));
    }

    #[tokio::test]
    async fn test_transfer_insufficient_balance_is_rejected() {
        let ledger = MemoryLedger::new(addr(0xaa));
        ledger.mint(&addr(1), 10).await.unwrap();

        let err = ledger.transfer(&addr(1), &addr(2), 11).await.unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientBalance {
                holder: addr(1),
                balance: 10,
                needed: 11
            }
        );
        assert_eq!(ledger.balance_of(&addr(1)).await.unwrap(), 10);
        assert_eq!(ledger.balance_of(&addr(2)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transfer_to_zero_address_is_rejected() {
        let ledger = MemoryLedger::new(addr(0xaa));
        ledger.mint(&addr(1), 10).await.unwrap();
        let err = ledger.transfer(&addr(1), &Address::ZERO, 1).await.unwrap_err();
        assert_eq!(err, LedgerError::InvalidReceiver(Address::ZERO));
    }

    #[tokio::test]
    async fn test_transfer_from_consumes_allowance() {
        let ledger = MemoryLedger::new(addr(0xaa));
        ledger.mint(&addr(1), 100).await.unwrap();
        ledger.approve(&addr(1), &addr(9), 50).await;

        ledger
            .transfer_from(&addr(9), &addr(1), &addr(9), 30)
            .await
            .unwrap();
        assert_eq!(ledger.allowance(&addr(1), &addr(9)).await, 20);
        assert_eq!(ledger.balance_of(&addr(9)).await.unwrap(), 30);

        let err = ledger
            .transfer_from(&addr(9), &addr(1), &addr(9), 21)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientAllowance { allowance: 20, .. }));
    }

    #[tokio::test]
    async fn test_unlimited_allowance_is_not_decremented() {
        let ledger = MemoryLedger::new(addr(0xaa));
        ledger.mint(&addr(1), 100).await.unwrap();
        ledger.approve(&addr(1), &addr(9), Amount::MAX).await;

        ledger
            .transfer_from(&addr(9), &addr(1), &addr(9), 100)
            .await
            .unwrap();
        assert_eq!(ledger.allowance(&addr(1), &addr(9)).await, Amount::MAX);
    }

    #[tokio::test]
    async fn test_mint_overflow_is_rejected() {
        let ledger = MemoryLedger::new(addr(0xaa));
        ledger.mint(&addr(1), Amount::MAX).await.unwrap();
        assert_eq!(
            ledger.mint(&addr(1), 1).await.unwrap_err(),
            LedgerError::Overflow(addr(1))
        );
    }
}
