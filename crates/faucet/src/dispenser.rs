//! Dispenser core
//!
//! Every operation takes the single state lock for its whole duration,
//! ledger calls included, and reads the clock only after acquiring it.
//! Operations therefore apply one at a time and each one sees the state
//! left by the previous one.

use crate::clock::{Clock, SystemClock};
use crate::database::{DistributionRecord, FaucetDatabase, FaucetStatistics};
use crate::error::{FaucetError, FaucetResult};
use crate::events::{EventPublisher, EventSubscriber, FaucetEvent};
use crate::identity::{CallContext, IdentityGate};
use crate::ledger::{Ledger, LedgerError};
use crate::metrics::FaucetMetrics;
use crate::ownership::OwnershipGuard;
use crate::pause::PauseGuard;
use drip_common::types::{amount_string, Address, Amount, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Creation parameters; fixed for the lifetime of a dispenser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispenserParams {
    /// Ledger the dispenser draws from
    pub asset: Address,
    /// Amount handed out per successful request
    #[serde(with = "amount_string")]
    pub max_tokens: Amount,
    /// Minimum seconds between successful requests by one identity
    pub interval: u64,
}

impl DispenserParams {
    pub fn new(asset: Address, max_tokens: Amount, interval: u64) -> FaucetResult<Self> {
        if asset.is_zero() {
            return Err(FaucetError::InvalidAddress("asset must not be the zero address".to_string()));
        }
        if max_tokens == 0 {
            return Err(FaucetError::InvalidAmount("max_tokens must be greater than zero".to_string()));
        }
        Ok(Self {
            asset,
            max_tokens,
            interval,
        })
    }
}

/// Outcome of a successful `get_tokens`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dispensed {
    pub recipient: Address,
    #[serde(with = "amount_string")]
    pub amount: Amount,
    pub timestamp: Timestamp,
    /// Ledger transaction hash; `None` for in-process ledgers
    pub tx_hash: Option<String>,
}

/// Faucet status
#[derive(Debug, Clone, Serialize)]
pub struct FaucetStatus {
    pub address: Address,
    pub asset: Address,
    #[serde(with = "amount_string")]
    pub max_tokens: Amount,
    pub interval: u64,
    pub owner: Address,
    pub paused: bool,
    #[serde(with = "amount_string")]
    pub inventory: Amount,
    pub statistics: FaucetStatistics,
}

struct DispenserState {
    ownership: OwnershipGuard,
    pause: PauseGuard,
    database: FaucetDatabase,
}

/// Rate-limited, pausable token dispenser.
pub struct Dispenser {
    params: DispenserParams,
    address: Address,
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    identity_gate: IdentityGate,
    events: EventPublisher,
    metrics: Option<Arc<FaucetMetrics>>,
    state: Mutex<DispenserState>,
}

impl Dispenser {
    /// Creates a dispenser, or reopens the one persisted in `database`.
    ///
    /// `address` is the dispenser's own ledger identity. `creator` becomes
    /// the owner unless the database already records one.
    pub fn new(
        params: DispenserParams,
        creator: Address,
        address: Address,
        ledger: Arc<dyn Ledger>,
        database: FaucetDatabase,
    ) -> FaucetResult<Self> {
        if ledger.asset() != params.asset {
            return Err(FaucetError::ConfigError(format!(
                "ledger tracks asset {}, dispenser configured for {}",
                ledger.asset(),
                params.asset
            )));
        }
        if address.is_zero() {
            return Err(FaucetError::InvalidAddress("dispenser address must not be zero".to_string()));
        }

        database.ensure_params(&params)?;

        let owner = match database.load_owner()? {
            Some(owner) => owner,
            None => {
                if creator.is_zero() {
                    return Err(FaucetError::InvalidOwner(creator));
                }
                database.store_owner(&creator)?;
                creator
            }
        };
        let paused = database.load_paused()?.unwrap_or(false);

        info!(
            "Dispenser {} ready: owner={}, paused={}, max_tokens={}, interval={}s",
            address, owner, paused, params.max_tokens, params.interval
        );

        Ok(Self {
            params,
            address,
            ledger,
            clock: Arc::new(SystemClock),
            identity_gate: IdentityGate::new([address]),
            events: EventPublisher::default(),
            metrics: None,
            state: Mutex::new(DispenserState {
                ownership: OwnershipGuard::new(owner),
                pause: PauseGuard::new(paused),
                database,
            }),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Marks identities as automated actors that may never request tokens.
    pub fn with_programmatic_identities(mut self, identities: impl IntoIterator<Item = Address>) -> Self {
        for identity in identities {
            self.identity_gate.add_programmatic(identity);
        }
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<FaucetMetrics>) -> Self {
        metrics.set_paused(self.state.get_mut().pause.is_paused());
        self.metrics = Some(metrics);
        self
    }

    /// Transfers `max_tokens` to the direct caller.
    ///
    /// Checks run in order: direct caller, not paused, interval elapsed,
    /// caller balance below `max_tokens`. A refusal changes nothing.
    pub async fn get_tokens(&self, ctx: &CallContext) -> FaucetResult<Dispensed> {
        let result = self.dispense(ctx).await;
        if let (Ok(_), Some(metrics)) = (&result, &self.metrics) {
            metrics.requests_total.inc();
        }
        self.observe(result)
    }

    async fn dispense(&self, ctx: &CallContext) -> FaucetResult<Dispensed> {
        let state = self.state.lock().await;
        let now = self.clock.now();

        let recipient = match self.identity_gate.ensure_direct(ctx) {
            Ok(recipient) => recipient,
            Err(e) => {
                warn!("Rejected delegated request: caller {} for origin {}", ctx.caller, ctx.origin);
                return Err(e);
            }
        };

        state.pause.ensure_active()?;

        if let Some(last) = state.database.get_last_request_time(&recipient)? {
            let eligible_at = last.saturating_add(self.params.interval);
            if now < eligible_at {
                let retry_after = eligible_at - now;
                warn!("Address {} requested too soon. Remaining: {}s", recipient, retry_after);
                return Err(FaucetError::TooSoon { retry_after });
            }
        }

        let balance = self.ledger.balance_of(&recipient).await?;
        if balance >= self.params.max_tokens {
            warn!(
                "Address {} already funded. Balance: {}, limit: {}",
                recipient, balance, self.params.max_tokens
            );
            return Err(FaucetError::AlreadyFunded { balance });
        }
        debug!("Checks passed for {}", recipient);

        let amount = self.params.max_tokens;
        let staged = state
            .database
            .record_request(&DistributionRecord::new(recipient, amount, now))?;

        let outcome = match state.database.flush() {
            Ok(()) => self
                .ledger
                .transfer(&self.address, &recipient, amount)
                .await
                .map_err(FaucetError::from),
            Err(e) => Err(e),
        };

        let tx_hash = match outcome {
            Ok(tx_hash) => tx_hash,
            Err(FaucetError::Ledger(e)) if e.may_have_applied() => {
                // The transfer may still land, so the request stays on record.
                warn!("Transfer to {} not confirmed, keeping request record: {}", recipient, e);
                if let LedgerError::Unconfirmed { tx_hash, .. } = &e {
                    if let Err(store_err) = state.database.set_tx_hash(&staged, tx_hash) {
                        error!("Failed to store tx hash for {}: {}", recipient, store_err);
                    }
                }
                return Err(FaucetError::Ledger(e));
            }
            Err(e) => {
                warn!("Dispense to {} failed, rolling back: {}", recipient, e);
                if let Err(revert_err) = state.database.revert_request(&staged) {
                    error!("Failed to roll back request record for {}: {}", recipient, revert_err);
                }
                return Err(e);
            }
        };

        if let Some(hash) = &tx_hash {
            if let Err(e) = state.database.set_tx_hash(&staged, hash) {
                error!("Failed to store tx hash for {}: {}", recipient, e);
            }
        }

        self.events.publish(FaucetEvent::Requested {
            recipient,
            amount,
            timestamp: now,
        });
        info!("Successfully dispensed {} to {}", amount, recipient);

        Ok(Dispensed {
            recipient,
            amount,
            timestamp: now,
            tx_hash,
        })
    }

    pub async fn pause(&self, ctx: &CallContext) -> FaucetResult<()> {
        let result = self.set_paused(ctx, true).await;
        self.observe(result)
    }

    pub async fn unpause(&self, ctx: &CallContext) -> FaucetResult<()> {
        let result = self.set_paused(ctx, false).await;
        self.observe(result)
    }

    async fn set_paused(&self, ctx: &CallContext, paused: bool) -> FaucetResult<()> {
        let mut state = self.state.lock().await;
        state.ownership.ensure_owner(&ctx.caller)?;

        let mut guard = state.pause.clone();
        if paused {
            guard.pause()?;
        } else {
            guard.unpause()?;
        }
        state.database.store_paused(paused)?;
        state.pause = guard;

        if let Some(metrics) = &self.metrics {
            metrics.set_paused(paused);
        }
        let event = if paused {
            FaucetEvent::Paused { account: ctx.caller }
        } else {
            FaucetEvent::Unpaused { account: ctx.caller }
        };
        self.events.publish(event);
        info!("Dispenser {} by {}", if paused { "paused" } else { "unpaused" }, ctx.caller);
        Ok(())
    }

    /// Pulls `amount` from the owner into the dispenser's inventory.
    ///
    /// The owner must have approved the dispenser on the ledger beforehand.
    pub async fn deposit(&self, ctx: &CallContext, amount: Amount) -> FaucetResult<()> {
        let result = self.pull_deposit(ctx, amount).await;
        if let (Ok(()), Some(metrics)) = (&result, &self.metrics) {
            metrics.deposits_total.inc();
        }
        self.observe(result)
    }

    async fn pull_deposit(&self, ctx: &CallContext, amount: Amount) -> FaucetResult<()> {
        let state = self.state.lock().await;
        state.ownership.ensure_owner(&ctx.caller)?;
        if amount == 0 {
            return Err(FaucetError::InvalidAmount("deposit must be greater than zero".to_string()));
        }

        let tx_hash = self
            .ledger
            .transfer_from(&self.address, &ctx.caller, &self.address, amount)
            .await?;

        info!("Deposited {} from {} (tx {:?})", amount, ctx.caller, tx_hash);
        Ok(())
    }

    pub async fn transfer_ownership(&self, ctx: &CallContext, new_owner: Address) -> FaucetResult<()> {
        let result = self.change_owner(ctx, Some(new_owner)).await;
        self.observe(result)
    }

    /// Gives up ownership for good; administrative operations fail afterwards.
    pub async fn renounce_ownership(&self, ctx: &CallContext) -> FaucetResult<()> {
        let result = self.change_owner(ctx, None).await;
        self.observe(result)
    }

    async fn change_owner(&self, ctx: &CallContext, new_owner: Option<Address>) -> FaucetResult<()> {
        let mut state = self.state.lock().await;

        let mut guard = state.ownership.clone();
        let previous_owner = match new_owner {
            Some(new_owner) => guard.transfer(&ctx.caller, new_owner)?,
            None => guard.renounce(&ctx.caller)?,
        };
        state.database.store_owner(&guard.owner())?;
        state.ownership = guard;

        let new_owner = state.ownership.owner();
        self.events.publish(FaucetEvent::OwnershipTransferred {
            previous_owner,
            new_owner,
        });
        info!("Ownership transferred from {} to {}", previous_owner, new_owner);
        Ok(())
    }

    fn observe<T>(&self, result: FaucetResult<T>) -> FaucetResult<T> {
        if let (Err(e), Some(metrics)) = (&result, &self.metrics) {
            metrics.record_rejection(e.code());
        }
        result
    }

    // --- Views ---

    pub fn params(&self) -> &DispenserParams {
        &self.params
    }

    pub fn faucet_token(&self) -> Address {
        self.params.asset
    }

    pub fn max_tokens(&self) -> Amount {
        self.params.max_tokens
    }

    pub fn interval(&self) -> u64 {
        self.params.interval
    }

    /// The dispenser's own ledger identity.
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn subscribe(&self) -> EventSubscriber {
        self.events.subscribe()
    }

    pub async fn owner(&self) -> Address {
        self.state.lock().await.ownership.owner()
    }

    pub async fn paused(&self) -> bool {
        self.state.lock().await.pause.is_paused()
    }

    /// Timestamp of the last successful request by `identity`, 0 if none.
    pub async fn last_request_at(&self, identity: &Address) -> FaucetResult<Timestamp> {
        let state = self.state.lock().await;
        Ok(state.database.get_last_request_time(identity)?.unwrap_or(0))
    }

    /// Earliest time `identity` passes the interval check, `None` if it
    /// has never been served.
    pub async fn next_eligible_at(&self, identity: &Address) -> FaucetResult<Option<Timestamp>> {
        let state = self.state.lock().await;
        Ok(state
            .database
            .get_last_request_time(identity)?
            .map(|last| last.saturating_add(self.params.interval)))
    }

    /// The dispenser's own balance on the ledger.
    pub async fn inventory(&self) -> FaucetResult<Amount> {
        let _state = self.state.lock().await;
        Ok(self.ledger.balance_of(&self.address).await?)
    }

    pub async fn distributions_for(&self, identity: &Address) -> FaucetResult<Vec<DistributionRecord>> {
        let state = self.state.lock().await;
        state.database.get_distributions_for_address(identity)
    }

    pub async fn statistics(&self) -> FaucetResult<FaucetStatistics> {
        let state = self.state.lock().await;
        state.database.get_statistics()
    }

    /// Get faucet status
    pub async fn status(&self) -> FaucetResult<FaucetStatus> {
        let state = self.state.lock().await;
        let inventory = self.ledger.balance_of(&self.address).await?;
        let statistics = state.database.get_statistics()?;

        Ok(FaucetStatus {
            address: self.address,
            asset: self.params.asset,
            max_tokens: self.params.max_tokens,
            interval: self.params.interval,
            owner: state.ownership.owner(),
            paused: state.pause.is_paused(),
            inventory,
            statistics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ledger::MemoryLedger;

    const ASSET: Address = Address([0xee; 20]);
    const FAUCET: Address = Address([0xfa; 20]);
    const OWNER: Address = Address([0x01; 20]);
    const USER: Address = Address([0x02; 20]);

    async fn setup(interval: u64) -> (Dispenser, Arc<MemoryLedger>, Arc<ManualClock>) {
        let ledger = Arc::new(MemoryLedger::new(ASSET));
        ledger.mint(&FAUCET, 1_000).await.unwrap();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let params = DispenserParams::new(ASSET, 10, interval).unwrap();
        let dispenser = Dispenser::new(
            params,
            OWNER,
            FAUCET,
            ledger.clone(),
            FaucetDatabase::temporary().unwrap(),
        )
        .unwrap()
        .with_clock(clock.clone());
        (dispenser, ledger, clock)
    }

    #[test]
    fn test_params_validation() {
        assert!(matches!(
            DispenserParams::new(ASSET, 0, 10),
            Err(FaucetError::InvalidAmount(_))
        ));
        assert!(matches!(
            DispenserParams::new(Address::ZERO, 1, 10),
            Err(FaucetError::InvalidAddress(_))
        ));
        assert!(DispenserParams::new(ASSET, 1, 0).is_ok());
    }

    #[tokio::test]
    async fn test_ledger_asset_must_match() {
        let ledger = Arc::new(MemoryLedger::new(Address([0x99; 20])));
        let params = DispenserParams::new(ASSET, 10, 10).unwrap();
        let result = Dispenser::new(params, OWNER, FAUCET, ledger, FaucetDatabase::temporary().unwrap());
        assert!(matches!(result, Err(FaucetError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_dispenser_cannot_serve_itself() {
        let (dispenser, _, _) = setup(10).await;
        assert!(matches!(
            dispenser.get_tokens(&CallContext::direct(FAUCET)).await,
            Err(FaucetError::NotDirectCaller)
        ));
    }

    #[tokio::test]
    async fn test_zero_interval_still_keeps_history_monotonic() {
        let (dispenser, ledger, clock) = setup(0).await;
        let ctx = CallContext::direct(USER);

        dispenser.get_tokens(&ctx).await.unwrap();
        ledger.transfer(&USER, &OWNER, 10).await.unwrap();
        dispenser.get_tokens(&ctx).await.unwrap();
        assert_eq!(dispenser.last_request_at(&USER).await.unwrap(), 1_000_000);

        // A clock that steps backwards cannot move the record backwards.
        ledger.transfer(&USER, &OWNER, 10).await.unwrap();
        clock.set(999_990);
        assert!(matches!(
            dispenser.get_tokens(&ctx).await,
            Err(FaucetError::TooSoon { retry_after: 10 })
        ));
        assert_eq!(dispenser.last_request_at(&USER).await.unwrap(), 1_000_000);
    }

    #[tokio::test]
    async fn test_metrics_count_outcomes() {
        let (dispenser, _, _) = setup(100).await;
        let metrics = Arc::new(FaucetMetrics::new().unwrap());
        let dispenser = dispenser.with_metrics(metrics.clone());
        let ctx = CallContext::direct(USER);

        dispenser.get_tokens(&ctx).await.unwrap();
        let _ = dispenser.get_tokens(&ctx).await;
        dispenser.pause(&CallContext::direct(OWNER)).await.unwrap();

        assert_eq!(metrics.requests_total.get(), 1);
        assert_eq!(metrics.rejections_total.with_label_values(&["TOO_SOON"]).get(), 1);
        assert_eq!(metrics.paused.get(), 1);
    }

    #[tokio::test]
    async fn test_metrics_attached_to_paused_dispenser_report_paused() {
        let (dispenser, _, _) = setup(100).await;
        dispenser.pause(&CallContext::direct(OWNER)).await.unwrap();

        let metrics = Arc::new(FaucetMetrics::new().unwrap());
        let dispenser = dispenser.with_metrics(metrics.clone());
        assert_eq!(metrics.paused.get(), 1);

        dispenser.unpause(&CallContext::direct(OWNER)).await.unwrap();
        assert_eq!(metrics.paused.get(), 0);
    }

    #[tokio::test]
    async fn test_status_reports_everything() {
        let (dispenser, _, _) = setup(100).await;
        dispenser.get_tokens(&CallContext::direct(USER)).await.unwrap();

        let status = dispenser.status().await.unwrap();
        assert_eq!(status.address, FAUCET);
        assert_eq!(status.asset, ASSET);
        assert_eq!(status.owner, OWNER);
        assert_eq!(status.inventory, 990);
        assert!(!status.paused);
        assert_eq!(status.statistics.total_distributions, 1);
        assert_eq!(
            dispenser.next_eligible_at(&USER).await.unwrap(),
            Some(1_000_100)
        );
        assert_eq!(dispenser.next_eligible_at(&OWNER).await.unwrap(), None);
    }
}
