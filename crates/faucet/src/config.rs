//! Faucet configuration

use crate::credential::signing_key_from_hex;
use crate::error::{FaucetError, FaucetResult};
use drip_common::types::{Address, Amount};
use drip_common::utils::config::load_config;
use drip_common::utils::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Publicly known key; only good for the in-process ledger.
const DEV_PRIVATE_KEY: &str = "0x0000000000000000000000000000000000000000000000000000000000000001";

/// Where token balances live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerMode {
    /// In-process ledger, seeded at startup
    Memory,
    /// ERC-20 style token contract behind a JSON-RPC endpoint
    Rpc,
}

/// Faucet service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FaucetConfig {
    /// Server address
    pub server_addr: String,

    /// Token the faucet hands out
    pub asset: String,

    /// Amount dispensed per request (base units)
    pub max_tokens: String,

    /// Seconds between successful requests by one identity
    pub interval_secs: u64,

    /// Owner recorded on first start
    pub owner: String,

    /// Faucet account private key; its address is the dispenser identity
    pub private_key: String,

    pub ledger: LedgerMode,

    /// RPC endpoint for blockchain
    pub rpc_url: String,

    /// Chain id for transaction signing; queried from the node when unset
    pub chain_id: Option<u64>,

    /// Gas price to use (in wei)
    pub gas_price: String,

    /// Gas limit for token transactions
    pub gas_limit: u64,

    /// Inventory minted to the faucet in memory mode
    pub memory_initial_inventory: String,

    /// Balance minted to the owner in memory mode, approved for deposits
    pub memory_owner_balance: String,

    /// Automated identities that may never request tokens
    pub programmatic_identities: Vec<String>,

    /// Accepted clock skew for request credentials (seconds)
    pub credential_ttl_secs: u64,

    /// Rate limit: maximum requests per client IP per window
    pub max_requests_per_window: u32,

    /// Rate limit: time window in seconds
    pub rate_limit_window_secs: u64,

    /// Database path
    pub db_path: String,

    /// Enable metrics
    pub metrics_enabled: bool,

    /// Enable CORS
    pub cors_enabled: bool,

    pub logging: LoggingConfig,
}

impl Default for FaucetConfig {
    fn default() -> Self {
        Self {
            server_addr: "0.0.0.0:3000".to_string(),
            asset: "0x5fbdb2315678afecb367f032d93f642f64180aa3".to_string(),
            max_tokens: "500000000000000000".to_string(), // 0.5 token at 18 decimals
            interval_secs: 86400, // 24 hours
            owner: "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266".to_string(),
            private_key: std::env::var("DRIP_PRIVATE_KEY")
                .unwrap_or_else(|_| DEV_PRIVATE_KEY.to_string()),
            ledger: LedgerMode::Memory,
            rpc_url: "http://localhost:8545".to_string(),
            chain_id: None,
            gas_price: "1000000000".to_string(), // 1 Gwei
            gas_limit: 100_000,
            memory_initial_inventory: "100000000000000000000".to_string(), // 100 tokens
            memory_owner_balance: "1000000000000000000000".to_string(), // 1000 tokens
            programmatic_identities: Vec::new(),
            credential_ttl_secs: 300,
            max_requests_per_window: 10,
            rate_limit_window_secs: 3600, // 1 hour
            db_path: "./drip_data".to_string(),
            metrics_enabled: true,
            cors_enabled: true,
            logging: LoggingConfig::default(),
        }
    }
}

impl FaucetConfig {
    /// Load from environment variables with defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("DRIP_SERVER_ADDR") {
            config.server_addr = addr;
        }

        if let Ok(asset) = std::env::var("DRIP_ASSET") {
            config.asset = asset;
        }

        if let Ok(amount) = std::env::var("DRIP_MAX_TOKENS") {
            config.max_tokens = amount;
        }

        if let Ok(interval) = std::env::var("DRIP_INTERVAL_SECS") {
            config.interval_secs = interval.parse().unwrap_or(config.interval_secs);
        }

        if let Ok(owner) = std::env::var("DRIP_OWNER") {
            config.owner = owner;
        }

        if let Ok(mode) = std::env::var("DRIP_LEDGER") {
            match mode.to_lowercase().as_str() {
                "rpc" => config.ledger = LedgerMode::Rpc,
                "memory" => config.ledger = LedgerMode::Memory,
                _ => {}
            }
        }

        if let Ok(rpc_url) = std::env::var("DRIP_RPC_URL") {
            config.rpc_url = rpc_url;
        }

        if let Ok(chain_id) = std::env::var("DRIP_CHAIN_ID") {
            config.chain_id = chain_id.parse().ok();
        }

        if let Ok(max_req) = std::env::var("DRIP_MAX_REQUESTS") {
            config.max_requests_per_window = max_req.parse().unwrap_or(config.max_requests_per_window);
        }

        if let Ok(window) = std::env::var("DRIP_RATE_LIMIT_WINDOW") {
            config.rate_limit_window_secs = window.parse().unwrap_or(config.rate_limit_window_secs);
        }

        if let Ok(db_path) = std::env::var("DRIP_DB_PATH") {
            config.db_path = db_path;
        }

        config
    }

    /// Load from a config file; `DRIP_*` variables override file values.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        load_config(path, "DRIP")
    }

    pub fn asset_address(&self) -> FaucetResult<Address> {
        parse_address("asset", &self.asset)
    }

    pub fn owner_address(&self) -> FaucetResult<Address> {
        parse_address("owner", &self.owner)
    }

    pub fn max_tokens_amount(&self) -> FaucetResult<Amount> {
        parse_amount("max_tokens", &self.max_tokens)
    }

    pub fn gas_price_amount(&self) -> FaucetResult<Amount> {
        parse_amount("gas_price", &self.gas_price)
    }

    pub fn memory_initial_inventory_amount(&self) -> FaucetResult<Amount> {
        parse_amount("memory_initial_inventory", &self.memory_initial_inventory)
    }

    pub fn memory_owner_balance_amount(&self) -> FaucetResult<Amount> {
        parse_amount("memory_owner_balance", &self.memory_owner_balance)
    }

    pub fn programmatic_addresses(&self) -> FaucetResult<Vec<Address>> {
        self.programmatic_identities
            .iter()
            .map(|s| parse_address("programmatic_identities", s))
            .collect()
    }

    /// Get rate limit duration
    pub fn rate_limit_duration(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    /// Checks every derived value once, before anything is started.
    pub fn validate(&self) -> FaucetResult<()> {
        if self.asset_address()?.is_zero() {
            return Err(FaucetError::ConfigError("asset must not be the zero address".to_string()));
        }
        if self.owner_address()?.is_zero() {
            return Err(FaucetError::ConfigError("owner must not be the zero address".to_string()));
        }
        if self.max_tokens_amount()? == 0 {
            return Err(FaucetError::ConfigError("max_tokens must be greater than zero".to_string()));
        }
        self.gas_price_amount()?;
        self.memory_initial_inventory_amount()?;
        self.memory_owner_balance_amount()?;
        self.programmatic_addresses()?;

        if self.max_requests_per_window == 0 || self.rate_limit_window_secs == 0 {
            return Err(FaucetError::ConfigError(
                "rate limit window and request count must be non-zero".to_string(),
            ));
        }
        if self.credential_ttl_secs == 0 {
            return Err(FaucetError::ConfigError("credential_ttl_secs must be non-zero".to_string()));
        }
        let signing_key = signing_key_from_hex(&self.private_key)?;
        if self.ledger == LedgerMode::Rpc {
            if self.rpc_url.is_empty() {
                return Err(FaucetError::ConfigError("rpc ledger requires rpc_url".to_string()));
            }
            if signing_key.to_bytes() == signing_key_from_hex(DEV_PRIVATE_KEY)?.to_bytes() {
                return Err(FaucetError::ConfigError(
                    "rpc ledger requires a private_key other than the development key".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn parse_address(field: &str, value: &str) -> FaucetResult<Address> {
    value
        .parse()
        .map_err(|e| FaucetError::ConfigError(format!("{}: {}", field, e)))
}

fn parse_amount(field: &str, value: &str) -> FaucetResult<Amount> {
    value
        .trim()
        .parse()
        .map_err(|e| FaucetError::ConfigError(format!("{}: invalid amount {:?}: {}", field, value, e)))
}
