pub mod atr;
pub mod ema;
pub mod rsi;
pub mod sma;

pub use atr::atr;
pub use ema::{ema_series, Cross, EmaCross};
pub use rsi::{RsiIndicator, RsiZone};
pub use sma::{sma, sma_series};
