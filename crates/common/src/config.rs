use std::str::FromStr;
use std::time::Duration;

use crate::{ApprovalThresholds, Error, Result, TradingMode};

/// What the process does after startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Monitor the regime and trade approved strategies.
    Live,
    /// Run one approval pass over candidate strategies, then exit.
    Backtest,
}

/// Order fill simulation parameters shared by the backtester and paper backend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillSettings {
    pub slippage_bps: f64,
    /// Bars between a signal and its execution in backtests.
    pub latency_bars: usize,
    /// Maximum fraction of a bar's volume one order may take.
    pub max_participation: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    pub window_bars: usize,
    /// Consecutive identical classifications required before a change.
    pub confirmations: usize,
    pub fetch_timeout: Duration,
}

/// Pre-trade limits applied to every order before it reaches a backend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskSettings {
    /// Largest notional one order may carry, as a fraction of equity.
    pub max_position_fraction: f64,
    /// Drawdown from peak equity at which new exposure is refused.
    pub max_drawdown_halt: f64,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            max_position_fraction: 0.25,
            max_drawdown_halt: 0.20,
        }
    }
}

/// Where inflation figures for the classifier come from.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MacroSettings {
    /// Base URL of the CPI endpoint. Unset disables the HTTP feed.
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub country: String,
    /// Fixed year-over-year rate; takes precedence over `api_url`.
    pub static_inflation: Option<f64>,
}

/// Minutes in one bar of a Binance-style interval ("15m", "4h", "1d", "1w").
pub fn interval_minutes(interval: &str) -> Option<u64> {
    let unit = interval.chars().last()?;
    let count: u64 = interval[..interval.len() - unit.len_utf8()].parse().ok()?;
    let per_unit = match unit {
        'm' => 1,
        'h' => 60,
        'd' => 24 * 60,
        'w' => 7 * 24 * 60,
        _ => return None,
    };
    (count > 0).then_some(count * per_unit)
}

/// Bars of `interval` in a 365-day year, for annualizing per-bar returns.
pub fn periods_per_year(interval: &str) -> Option<f64> {
    interval_minutes(interval).map(|m| 365.0 * 24.0 * 60.0 / m as f64)
}

/// All configuration loaded from environment variables at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub trading_mode: TradingMode,
    pub run_mode: RunMode,
    pub symbol: String,
    /// Bar interval shared by regime classification, backtests and the live
    /// kline stream.
    pub bar_interval: String,

    // Exchange credentials, required in live mode only
    pub binance_api_key: Option<String>,
    pub binance_secret: Option<String>,

    // Database
    pub database_url: String,

    // Strategy config file path
    pub strategy_config_path: String,

    pub monitor: MonitorSettings,
    pub thresholds: ApprovalThresholds,
    pub fills: FillSettings,
    pub risk: RiskSettings,
    pub macro_data: MacroSettings,

    pub backtest_days: i64,
    pub backtest_timeout: Duration,
    pub paper_balance_usd: f64,
    /// Equity the risk gate starts from; defaults to the paper balance.
    pub risk_capital_usd: f64,
}

impl Config {
    /// Load all configuration from environment variables.
    /// Loads `.env` if present. Panics on any missing or malformed variable.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv(); // ignore error if .env not present
        Self::from_lookup(|key| std::env::var(key).ok())
            .unwrap_or_else(|e| panic!("ERROR: {e}. Check your .env file."))
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let trading_mode = match lookup("TRADING_MODE")
            .unwrap_or_else(|| "paper".into())
            .to_lowercase()
            .as_str()
        {
            "paper" => TradingMode::Paper,
            "live" => TradingMode::Live,
            other => {
                return Err(Error::Config(format!(
                    "TRADING_MODE must be 'paper' or 'live', got: '{other}'"
                )))
            }
        };

        let run_mode = match lookup("RUN_MODE")
            .unwrap_or_else(|| "live".into())
            .to_lowercase()
            .as_str()
        {
            "live" => RunMode::Live,
            "backtest" => RunMode::Backtest,
            other => {
                return Err(Error::Config(format!(
                    "RUN_MODE must be 'live' or 'backtest', got: '{other}'"
                )))
            }
        };

        let binance_api_key = lookup("BINANCE_API_KEY");
        let binance_secret = lookup("BINANCE_SECRET");
        if trading_mode == TradingMode::Live
            && (binance_api_key.is_none() || binance_secret.is_none())
        {
            return Err(Error::Config(
                "BINANCE_API_KEY and BINANCE_SECRET are required when TRADING_MODE=live".into(),
            ));
        }

        let defaults = ApprovalThresholds::default();
        let thresholds = ApprovalThresholds {
            min_sharpe: parsed(&lookup, "MIN_SHARPE", defaults.min_sharpe)?,
            max_drawdown: parsed(&lookup, "MAX_DRAWDOWN", defaults.max_drawdown)?,
            min_win_rate: parsed(&lookup, "MIN_WIN_RATE", defaults.min_win_rate)?,
            min_trades: parsed(&lookup, "MIN_TRADES", defaults.min_trades)?,
        };

        let confirmations: usize = parsed(&lookup, "REGIME_CONFIRMATIONS", 2)?;
        if confirmations == 0 {
            return Err(Error::Config("REGIME_CONFIRMATIONS must be at least 1".into()));
        }

        let max_participation: f64 = parsed(&lookup, "MAX_PARTICIPATION", 0.1)?;
        if !(max_participation > 0.0 && max_participation <= 1.0) {
            return Err(Error::Config(format!(
                "MAX_PARTICIPATION must be in (0, 1], got {max_participation}"
            )));
        }

        let bar_interval = lookup("BAR_INTERVAL").unwrap_or_else(|| "1d".into());
        if interval_minutes(&bar_interval).is_none() {
            return Err(Error::Config(format!(
                "BAR_INTERVAL must look like 15m, 4h, 1d or 1w, got: '{bar_interval}'"
            )));
        }

        let risk_defaults = RiskSettings::default();
        let risk = RiskSettings {
            max_position_fraction: parsed(&lookup, "MAX_POSITION_FRACTION", risk_defaults.max_position_fraction)?,
            max_drawdown_halt: parsed(&lookup, "MAX_DRAWDOWN_HALT", risk_defaults.max_drawdown_halt)?,
        };
        for (key, value) in [
            ("MAX_POSITION_FRACTION", risk.max_position_fraction),
            ("MAX_DRAWDOWN_HALT", risk.max_drawdown_halt),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(Error::Config(format!("{key} must be in (0, 1], got {value}")));
            }
        }

        let static_inflation = match lookup("INFLATION_RATE") {
            Some(_) => Some(parsed(&lookup, "INFLATION_RATE", 0.0)?),
            None => None,
        };
        let macro_data = MacroSettings {
            api_url: lookup("MACRO_API_URL"),
            api_key: lookup("MACRO_API_KEY"),
            country: lookup("MACRO_COUNTRY").unwrap_or_else(|| "US".into()),
            static_inflation,
        };

        let paper_balance_usd: f64 = parsed(&lookup, "PAPER_BALANCE_USD", 10_000.0)?;

        Ok(Config {
            trading_mode,
            run_mode,
            symbol: lookup("SYMBOL").unwrap_or_else(|| "BTCUSDT".into()),
            bar_interval,
            binance_api_key,
            binance_secret,
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://regimebot.db".into()),
            strategy_config_path: lookup("STRATEGY_CONFIG_PATH")
                .unwrap_or_else(|| "config/strategies.toml".into()),
            monitor: MonitorSettings {
                poll_interval: Duration::from_secs(parsed(&lookup, "REGIME_POLL_SECS", 3600)?),
                window_bars: parsed(&lookup, "REGIME_WINDOW_BARS", 250)?,
                confirmations,
                fetch_timeout: Duration::from_secs(parsed(&lookup, "FETCH_TIMEOUT_SECS", 30)?),
            },
            thresholds,
            fills: FillSettings {
                slippage_bps: parsed(&lookup, "SLIPPAGE_BPS", 10.0)?,
                latency_bars: parsed(&lookup, "LATENCY_BARS", 1)?,
                max_participation,
            },
            risk,
            macro_data,
            backtest_days: parsed(&lookup, "BACKTEST_DAYS", 365)?,
            backtest_timeout: Duration::from_secs(parsed(&lookup, "BACKTEST_TIMEOUT_SECS", 120)?),
            paper_balance_usd,
            risk_capital_usd: parsed(&lookup, "RISK_CAPITAL_USD", paper_balance_usd)?,
        })
    }
}

fn parsed<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{key} has an invalid value: '{raw}'"))),
    }
}
