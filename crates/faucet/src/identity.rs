//! Direct vs. delegated caller classification

use crate::error::{FaucetError, FaucetResult};
use drip_common::types::Address;
use std::collections::HashSet;

/// Who is calling, and on whose behalf.
///
/// `caller` is the identity that submitted the call; `origin` is the
/// identity that started the call chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallContext {
    pub caller: Address,
    pub origin: Address,
}

impl CallContext {
    /// A call submitted by the identity that initiated it.
    pub fn direct(identity: Address) -> Self {
        Self {
            caller: identity,
            origin: identity,
        }
    }

    /// A call forwarded by `intermediary` for `origin`.
    pub fn delegated(intermediary: Address, origin: Address) -> Self {
        Self {
            caller: intermediary,
            origin,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerKind {
    Direct,
    Delegated,
}

/// Classifies callers; only direct callers may request tokens.
#[derive(Debug, Clone, Default)]
pub struct IdentityGate {
    programmatic: HashSet<Address>,
}

impl IdentityGate {
    /// `programmatic` lists identities known to be automated actors
    /// (contracts, relayers, the dispenser itself).
    pub fn new(programmatic: impl IntoIterator<Item = Address>) -> Self {
        Self {
            programmatic: programmatic.into_iter().collect(),
        }
    }

    pub fn add_programmatic(&mut self, identity: Address) {
        self.programmatic.insert(identity);
    }

    pub fn is_programmatic(&self, identity: &Address) -> bool {
        self.programmatic.contains(identity)
    }

    pub fn classify(&self, ctx: &CallContext) -> CallerKind {
        if ctx.caller != ctx.origin || self.is_programmatic(&ctx.caller) {
            CallerKind::Delegated
        } else {
            CallerKind::Direct
        }
    }

    /// Returns the accountable identity of a direct call.
    pub fn ensure_direct(&self, ctx: &CallContext) -> FaucetResult<Address> {
        match self.classify(ctx) {
            CallerKind::Direct => Ok(ctx.caller),
            CallerKind::Delegated => Err(FaucetError::NotDirectCaller),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER: Address = Address([1; 20]);
    const RELAYER: Address = Address([2; 20]);

    #[test]
    fn test_direct_call_passes() {
        let gate = IdentityGate::default();
        assert_eq!(gate.classify(&CallContext::direct(USER)), CallerKind::Direct);
        assert_eq!(gate.ensure_direct(&CallContext::direct(USER)).unwrap(), USER);
    }

    #[test]
    fn test_forwarded_call_is_delegated() {
        let gate = IdentityGate::default();
        let ctx = CallContext::delegated(RELAYER, USER);
        assert_eq!(gate.classify(&ctx), CallerKind::Delegated);
        assert!(matches!(gate.ensure_direct(&ctx), Err(FaucetError::NotDirectCaller)));
    }

    #[test]
    fn test_programmatic_identity_is_delegated_even_when_self_originated() {
        let mut gate = IdentityGate::new([RELAYER]);
        assert_eq!(gate.classify(&CallContext::direct(RELAYER)), CallerKind::Delegated);

        gate.add_programmatic(USER);
        assert!(gate.is_programmatic(&USER));
        assert!(gate.ensure_direct(&CallContext::direct(USER)).is_err());
    }
}
