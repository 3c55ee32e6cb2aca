//! Market symbols.
//!
//! Bitvavo names markets `BASE-QUOTE` (e.g. `BTC-EUR`).

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Validated `BASE-QUOTE` market symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Market {
    symbol: String,
    split: usize,
}

impl Market {
    pub fn as_str(&self) -> &str {
        &self.symbol
    }

    pub fn base(&self) -> &str {
        &self.symbol[..self.split]
    }

    pub fn quote(&self) -> &str {
        &self.symbol[self.split + 1..]
    }
}

impl FromStr for Market {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let symbol = s.trim().to_ascii_uppercase();
        let Some((base, quote)) = symbol.split_once('-') else {
            return Err(CoreError::InvalidMarket(s.to_string()));
        };
        let valid = |part: &str| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric());
        if !valid(base) || !valid(quote) {
            return Err(CoreError::InvalidMarket(s.to_string()));
        }
        let split = base.len();
        Ok(Self { symbol, split })
    }
}

impl TryFrom<String> for Market {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Market> for String {
    fn from(market: Market) -> Self {
        market.symbol
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.symbol)
    }
}

impl AsRef<str> for Market {
    fn as_ref(&self) -> &str {
        &self.symbol
    }
}
