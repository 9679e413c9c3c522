//! Faucet database for dispenser state and distribution history

use crate::dispenser::DispenserParams;
use crate::error::{FaucetError, FaucetResult};
use drip_common::types::{amount_string, Address, Amount, Timestamp};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionResult, TransactionError};
use sled::{Db, Transactional, Tree};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

const PARAMS_KEY: &[u8] = b"params";
const OWNER_KEY: &[u8] = b"owner";
const PAUSED_KEY: &[u8] = b"paused";

/// Distribution record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionRecord {
    /// Recipient address
    pub address: Address,
    /// Amount dispensed (smallest unit)
    #[serde(with = "amount_string")]
    pub amount: Amount,
    /// Timestamp
    pub timestamp: Timestamp,
    /// Ledger transaction hash, once the transfer was sent
    pub tx_hash: Option<String>,
}

impl DistributionRecord {
    pub fn new(address: Address, amount: Amount, timestamp: Timestamp) -> Self {
        Self {
            address,
            amount,
            timestamp,
            tx_hash: None,
        }
    }
}

/// Handle to a request staged by [`FaucetDatabase::record_request`].
#[derive(Debug, Clone)]
pub struct StagedRequest {
    address: Address,
    previous: Option<Timestamp>,
    distribution_key: Vec<u8>,
}

impl StagedRequest {
    pub fn previous(&self) -> Option<Timestamp> {
        self.previous
    }
}

/// Faucet database
pub struct FaucetDatabase {
    db: Db,
    /// Tree for immutable creation parameters
    meta: Tree,
    /// Tree for owner and pause flag
    state: Tree,
    /// Tree for address tracking (last request time)
    last_request: Tree,
    /// Tree for distribution records
    distributions: Tree,
}

impl FaucetDatabase {
    /// Create or open faucet database
    pub fn new<P: AsRef<Path>>(path: P) -> FaucetResult<Self> {
        info!("Opening faucet database at: {}", path.as_ref().display());

        let db = sled::Config::default()
            .path(path)
            .cache_capacity(64 * 1024 * 1024) // 64MB cache
            .open()?;

        Self::from_db(db)
    }

    /// Database that disappears when dropped.
    pub fn temporary() -> FaucetResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> FaucetResult<Self> {
        let meta = db.open_tree("meta")?;
        let state = db.open_tree("state")?;
        let last_request = db.open_tree("last_request")?;
        let distributions = db.open_tree("distributions")?;

        Ok(Self {
            db,
            meta,
            state,
            last_request,
            distributions,
        })
    }

    /// Stores `params` on first use; afterwards refuses any different set.
    pub fn ensure_params(&self, params: &DispenserParams) -> FaucetResult<()> {
        let encoded = encode(params)?;
        match self
            .meta
            .compare_and_swap(PARAMS_KEY, None as Option<&[u8]>, Some(encoded))?
        {
            Ok(()) => {
                info!(
                    "Initialized dispenser parameters: asset={}, max_tokens={}, interval={}s",
                    params.asset, params.max_tokens, params.interval
                );
                Ok(())
            }
            Err(cas) => {
                let stored: DispenserParams = match cas.current {
                    Some(bytes) => decode(&bytes)?,
                    None => return Err(FaucetError::InternalError("parameter slot vanished".to_string())),
                };
                if stored != *params {
                    return Err(FaucetError::ConfigError(format!(
                        "database was created with {:?}, refusing to reopen with {:?}",
                        stored, params
                    )));
                }
                Ok(())
            }
        }
    }

    pub fn load_owner(&self) -> FaucetResult<Option<Address>> {
        match self.state.get(OWNER_KEY)? {
            Some(bytes) => Ok(Some(Address::from_slice(&bytes).map_err(|e| {
                FaucetError::InternalError(format!("Invalid stored owner: {}", e))
            })?)),
            None => Ok(None),
        }
    }

    pub fn store_owner(&self, owner: &Address) -> FaucetResult<()> {
        self.state.insert(OWNER_KEY, owner.as_bytes())?;
        self.state.flush()?;
        Ok(())
    }

    pub fn load_paused(&self) -> FaucetResult<Option<bool>> {
        Ok(self
            .state
            .get(PAUSED_KEY)?
            .map(|bytes| bytes.as_ref() == [1u8].as_slice()))
    }

    pub fn store_paused(&self, paused: bool) -> FaucetResult<()> {
        self.state.insert(PAUSED_KEY, vec![paused as u8])?;
        self.state.flush()?;
        Ok(())
    }

    /// Get last request timestamp for an address
    pub fn get_last_request_time(&self, address: &Address) -> FaucetResult<Option<Timestamp>> {
        match self.last_request.get(address.as_bytes())? {
            Some(bytes) => Ok(Some(decode_timestamp(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Writes the request timestamp and its distribution record in one
    /// transaction. The returned handle undoes both via [`Self::revert_request`].
    pub fn record_request(&self, record: &DistributionRecord) -> FaucetResult<StagedRequest> {
        let value = encode(record)?;
        let distribution_key = format!(
            "{}:{:020}:{:020}",
            record.address,
            record.timestamp,
            self.db.generate_id()?
        )
        .into_bytes();
        let stamp = record.timestamp.to_be_bytes().to_vec();

        let previous = (&self.last_request, &self.distributions)
            .transaction(
                |(last, dist)| -> ConflictableTransactionResult<Option<sled::IVec>, ()> {
                    let previous = last.insert(record.address.as_bytes(), stamp.clone())?;
                    dist.insert(distribution_key.clone(), value.clone())?;
                    Ok(previous)
                },
            )
            .map_err(transaction_error)?;

        let previous = previous.map(|bytes| decode_timestamp(&bytes)).transpose()?;
        debug!("Recorded distribution for address: {}", record.address);

        Ok(StagedRequest {
            address: record.address,
            previous,
            distribution_key,
        })
    }

    /// Restores the state from before `staged` was recorded.
    pub fn revert_request(&self, staged: &StagedRequest) -> FaucetResult<()> {
        (&self.last_request, &self.distributions)
            .transaction(|(last, dist)| -> ConflictableTransactionResult<(), ()> {
                match staged.previous {
                    Some(previous) => {
                        last.insert(staged.address.as_bytes(), previous.to_be_bytes().to_vec())?;
                    }
                    None => {
                        last.remove(staged.address.as_bytes())?;
                    }
                }
                dist.remove(staged.distribution_key.clone())?;
                Ok(())
            })
            .map_err(transaction_error)?;

        debug!("Reverted staged request for address: {}", staged.address);
        Ok(())
    }

    /// Attaches the ledger transaction hash to a staged distribution record.
    pub fn set_tx_hash(&self, staged: &StagedRequest, tx_hash: &str) -> FaucetResult<()> {
        let bytes = self
            .distributions
            .get(&staged.distribution_key)?
            .ok_or_else(|| FaucetError::InternalError("staged distribution vanished".to_string()))?;
        let mut record: DistributionRecord = decode(&bytes)?;
        record.tx_hash = Some(tx_hash.to_string());
        self.distributions
            .insert(staged.distribution_key.clone(), encode(&record)?)?;
        self.distributions.flush()?;
        debug!("Stored tx hash {} for address: {}", tx_hash, staged.address);
        Ok(())
    }

    /// Makes recorded requests durable.
    pub fn flush(&self) -> FaucetResult<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Get all distributions for an address, newest first
    pub fn get_distributions_for_address(
        &self,
        address: &Address,
    ) -> FaucetResult<Vec<DistributionRecord>> {
        let mut records = Vec::new();

        for item in self.distributions.scan_prefix(format!("{}:", address)) {
            let (_, value) = item?;
            records.push(decode::<DistributionRecord>(&value)?);
        }

        records.reverse();
        Ok(records)
    }

    /// Get statistics
    pub fn get_statistics(&self) -> FaucetResult<FaucetStatistics> {
        let mut total_amount: Amount = 0;
        let mut unique_addresses = HashSet::new();
        let mut total_distributions = 0;

        for item in self.distributions.iter() {
            let (_, value) = item?;
            let record: DistributionRecord = decode(&value)?;

            total_distributions += 1;
            total_amount = total_amount.saturating_add(record.amount);
            unique_addresses.insert(record.address);
        }

        Ok(FaucetStatistics {
            total_distributions,
            total_amount,
            unique_addresses: unique_addresses.len() as u64,
        })
    }
}

/// Faucet statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaucetStatistics {
    pub total_distributions: usize,
    #[serde(with = "amount_string")]
    pub total_amount: Amount,
    pub unique_addresses: u64,
}

fn encode<T: Serialize>(value: &T) -> FaucetResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| FaucetError::InternalError(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> FaucetResult<T> {
    bincode::deserialize(bytes).map_err(|e| FaucetError::InternalError(e.to_string()))
}

fn decode_timestamp(bytes: &[u8]) -> FaucetResult<Timestamp> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| FaucetError::InternalError("Invalid timestamp format".to_string()))?;
    Ok(Timestamp::from_be_bytes(arr))
}

fn transaction_error(err: TransactionError<()>) -> FaucetError {
    match err {
        TransactionError::Abort(()) => FaucetError::InternalError("transaction aborted".to_string()),
        TransactionError::Storage(e) => FaucetError::DatabaseError(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ALICE: Address = Address([0xa1; 20]);
    const BOB: Address = Address([0xb0; 20]);

    fn params() -> DispenserParams {
        DispenserParams {
            asset: Address([0x55; 20]),
            max_tokens: 500,
            interval: 86_400,
        }
    }

    #[test]
    fn test_record_and_revert_request() -> FaucetResult<()> {
        let db = FaucetDatabase::temporary()?;
        assert_eq!(db.get_last_request_time(&ALICE)?, None);

        let first = db.record_request(&DistributionRecord::new(ALICE, 500, 100))?;
        assert_eq!(first.previous(), None);
        assert_eq!(db.get_last_request_time(&ALICE)?, Some(100));

        let second = db.record_request(&DistributionRecord::new(ALICE, 500, 200))?;
        assert_eq!(second.previous(), Some(100));
        assert_eq!(db.get_distributions_for_address(&ALICE)?.len(), 2);

        db.revert_request(&second)?;
        assert_eq!(db.get_last_request_time(&ALICE)?, Some(100));
        let history = db.get_distributions_for_address(&ALICE)?;
        assert_eq!(history, vec![DistributionRecord::new(ALICE, 500, 100)]);

        db.revert_request(&first)?;
        assert_eq!(db.get_last_request_time(&ALICE)?, None);
        assert!(db.get_distributions_for_address(&ALICE)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_same_second_requests_do_not_collide() -> FaucetResult<()> {
        let db = FaucetDatabase::temporary()?;
        db.record_request(&DistributionRecord::new(ALICE, 1, 100))?;
        let second = db.record_request(&DistributionRecord::new(ALICE, 1, 100))?;
        assert_eq!(db.get_distributions_for_address(&ALICE)?.len(), 2);

        db.revert_request(&second)?;
        assert_eq!(db.get_distributions_for_address(&ALICE)?.len(), 1);
        assert_eq!(db.get_last_request_time(&ALICE)?, Some(100));
        Ok(())
    }

    #[test]
    fn test_tx_hash_is_attached_to_staged_record() -> FaucetResult<()> {
        let db = FaucetDatabase::temporary()?;
        db.record_request(&DistributionRecord::new(ALICE, 5, 100))?;
        let staged = db.record_request(&DistributionRecord::new(ALICE, 5, 200))?;
        db.set_tx_hash(&staged, "0xfeed")?;

        let history = db.get_distributions_for_address(&ALICE)?;
        assert_eq!(history[0].tx_hash.as_deref(), Some("0xfeed"));
        assert_eq!(history[1].tx_hash, None);
        Ok(())
    }

    #[test]
    fn test_history_is_newest_first_and_per_address() -> FaucetResult<()> {
        let db = FaucetDatabase::temporary()?;
        db.record_request(&DistributionRecord::new(ALICE, 5, 100))?;
        db.record_request(&DistributionRecord::new(BOB, 5, 150))?;
        db.record_request(&DistributionRecord::new(ALICE, 5, 1_000))?;

        let history = db.get_distributions_for_address(&ALICE)?;
        assert_eq!(
            history.iter().map(|r| r.timestamp).collect::<Vec<_>>(),
            vec![1_000, 100]
        );

        let stats = db.get_statistics()?;
        assert_eq!(stats.total_distributions, 3);
        assert_eq!(stats.total_amount, 15);
        assert_eq!(stats.unique_addresses, 2);
        Ok(())
    }

    #[test]
    fn test_params_are_immutable() -> FaucetResult<()> {
        let db = FaucetDatabase::temporary()?;
        db.ensure_params(&params())?;
        db.ensure_params(&params())?;

        let changed = DispenserParams {
            max_tokens: 1,
            ..params()
        };
        assert!(matches!(
            db.ensure_params(&changed),
            Err(FaucetError::ConfigError(_))
        ));
        Ok(())
    }

    #[test]
    fn test_state_survives_reopen() -> FaucetResult<()> {
        let dir = TempDir::new().map_err(|e| FaucetError::InternalError(e.to_string()))?;
        let path = dir.path().join("faucet_db");

        {
            let db = FaucetDatabase::new(&path)?;
            db.ensure_params(&params())?;
            db.store_owner(&ALICE)?;
            db.store_paused(true)?;
            db.record_request(&DistributionRecord::new(BOB, 500, 42))?;
            db.flush()?;
        }

        let db = FaucetDatabase::new(&path)?;
        db.ensure_params(&params())?;
        assert_eq!(db.load_owner()?, Some(ALICE));
        assert_eq!(db.load_paused()?, Some(true));
        assert_eq!(db.get_last_request_time(&BOB)?, Some(42));
        Ok(())
    }
}
