//! Application Configuration
//!
//! Loaded once at startup from environment variables (with `.env` support via
//! dotenvy). All knobs recognized by the engine live here.

use rust_decimal::Decimal;
use serde::Deserialize;

fn default_environment() -> String {
    "development".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_flush_interval_ms() -> u64 {
    10_000
}

fn default_batch_size() -> usize {
    500
}

fn default_fee_rate() -> Decimal {
    Decimal::ZERO
}

fn default_market_buy_margin() -> Decimal {
    Decimal::ZERO
}

fn default_supported_symbols() -> String {
    "BTCUSDT,ETHUSDT".to_string()
}

fn default_event_queue_depth() -> usize {
    1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub database_url: String,

    /// How often the durable-store sync worker drains the write queues.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Max entries drained per flush tick per queue.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Proportional fee rate applied to trade notional, charged in quote.
    #[serde(default = "default_fee_rate")]
    pub default_fee_rate: Decimal,

    /// Safety multiplier (>= 0) on the worst-case notional frozen for a
    /// market buy.
    #[serde(default = "default_market_buy_margin")]
    pub market_buy_collateral_margin: Decimal,

    /// Account exempt from self-trade prevention (seeded liquidity).
    #[serde(default)]
    pub market_maker_user_id: Option<i64>,

    /// Comma-separated symbols the engine initialises on boot.
    #[serde(default = "default_supported_symbols")]
    pub supported_symbols: String,

    /// Capacity of each event-publisher broadcast channel.
    #[serde(default = "default_event_queue_depth")]
    pub event_queue_depth: usize,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;
        let app: AppConfig = cfg.try_deserialize()?;

        if app.market_buy_collateral_margin < Decimal::ZERO {
            anyhow::bail!("market_buy_collateral_margin must be >= 0");
        }
        if app.default_fee_rate < Decimal::ZERO || app.default_fee_rate >= Decimal::ONE {
            anyhow::bail!("default_fee_rate must be in [0, 1)");
        }
        Ok(app)
    }

    /// Symbols the engine should initialise on boot.
    pub fn get_supported_symbols(&self) -> Vec<String> {
        self.supported_symbols
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn supports_symbol(&self, symbol: &str) -> bool {
        self.get_supported_symbols().iter().any(|s| s == symbol)
    }
}
