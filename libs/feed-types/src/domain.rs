//! Message domains

use serde::{Deserialize, Serialize};
use std::fmt;

/// Domain of a stream's content.
///
/// Login, Source (directory) and Dictionary are administrative domains and
/// never carry posts or aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DomainType {
    Login,
    Source,
    Dictionary,
    MarketPrice,
    MarketByOrder,
    MarketByPrice,
    MarketMaker,
    SymbolList,
    /// Any other domain number
    Custom(u8),
}

impl DomainType {
    /// Numeric domain value used on the wire
    pub fn value(&self) -> u8 {
        match self {
            DomainType::Login => 1,
            DomainType::Source => 4,
            DomainType::Dictionary => 5,
            DomainType::MarketPrice => 6,
            DomainType::MarketByOrder => 7,
            DomainType::MarketByPrice => 8,
            DomainType::MarketMaker => 9,
            DomainType::SymbolList => 10,
            DomainType::Custom(v) => *v,
        }
    }

    /// Map a wire value back to a domain
    pub fn from_value(value: u8) -> Self {
        match value {
            1 => DomainType::Login,
            4 => DomainType::Source,
            5 => DomainType::Dictionary,
            6 => DomainType::MarketPrice,
            7 => DomainType::MarketByOrder,
            8 => DomainType::MarketByPrice,
            9 => DomainType::MarketMaker,
            10 => DomainType::SymbolList,
            other => DomainType::Custom(other),
        }
    }

    /// Login, directory and dictionary streams are administrative.
    pub fn is_administrative(&self) -> bool {
        matches!(
            self,
            DomainType::Login | DomainType::Source | DomainType::Dictionary
        )
    }
}

impl fmt::Display for DomainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainType::Custom(v) => write!(f, "Custom({})", v),
            other => write!(f, "{:?}", other),
        }
    }
}
