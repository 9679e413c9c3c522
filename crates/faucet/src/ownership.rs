//! Single-owner authorization for administrative operations

use crate::error::{FaucetError, FaucetResult};
use drip_common::types::Address;

/// Tracks the privileged identity of a dispenser.
///
/// A renounced guard holds the zero address and authorizes nobody.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipGuard {
    owner: Address,
}

impl OwnershipGuard {
    pub fn new(owner: Address) -> Self {
        Self { owner }
    }

    pub fn owner(&self) -> Address {
        self.owner
    }

    pub fn is_renounced(&self) -> bool {
        self.owner.is_zero()
    }

    /// Fails with `Unauthorized(caller)` unless `caller` is the owner.
    pub fn ensure_owner(&self, caller: &Address) -> FaucetResult<()> {
        if self.is_renounced() || *caller != self.owner {
            return Err(FaucetError::Unauthorized(*caller));
        }
        Ok(())
    }

    /// Hands ownership to `new_owner`, returning the previous owner.
    pub fn transfer(&mut self, caller: &Address, new_owner: Address) -> FaucetResult<Address> {
        self.ensure_owner(caller)?;
        if new_owner.is_zero() {
            return Err(FaucetError::InvalidOwner(new_owner));
        }
        Ok(std::mem::replace(&mut self.owner, new_owner))
    }

    /// Leaves the guard without an owner, returning the previous owner.
    pub fn renounce(&mut self, caller: &Address) -> FaucetResult<Address> {
        self.ensure_owner(caller)?;
        Ok(std::mem::replace(&mut self.owner, Address::ZERO))
    }
}
