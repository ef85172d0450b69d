//! Domain primitives: TimeMs, ParticipantId, Currency, ProductKind, Generation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Time in milliseconds since Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeMs(pub i64);

impl TimeMs {
    /// Create a TimeMs from milliseconds.
    pub fn new(ms: i64) -> Self {
        TimeMs(ms)
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        TimeMs(chrono::Utc::now().timestamp_millis())
    }

    /// Get the underlying milliseconds value.
    pub fn as_ms(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for TimeMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque participant identifier supplied by the host identity store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        ParticipantId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Settlement currency. Commissions never convert between currencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Ngn,
    Usdt,
}

impl Currency {
    /// Fractional digits kept on commission amounts.
    pub fn scale(&self) -> u32 {
        match self {
            Currency::Ngn => 2,
            Currency::Usdt => 8,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Ngn => "NGN",
            Currency::Usdt => "USDT",
        }
    }
}

impl FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NGN" => Ok(Currency::Ngn),
            "USDT" => Ok(Currency::Usdt),
            other => Err(format!("unknown currency: {}", other)),
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What was purchased. Carried as metadata; it does not affect the rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductKind {
    Share,
    Cofounder,
}

impl ProductKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductKind::Share => "share",
            ProductKind::Cofounder => "cofounder",
        }
    }
}

impl FromStr for ProductKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "share" => Ok(ProductKind::Share),
            "cofounder" | "co-founder" | "co_founder" => Ok(ProductKind::Cofounder),
            other => Err(format!("unknown product kind: {}", other)),
        }
    }
}

impl fmt::Display for ProductKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Distance from the purchaser up the referrer chain (1..=3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Generation(u8);

impl Generation {
    pub const MAX: u8 = 3;
    pub const FIRST: Generation = Generation(1);

    /// Returns `None` outside 1..=3.
    pub fn new(g: u8) -> Option<Self> {
        (1..=Self::MAX).contains(&g).then_some(Generation(g))
    }

    pub fn get(&self) -> u8 {
        self.0
    }

    /// Zero-based index into per-generation arrays.
    pub fn index(&self) -> usize {
        usize::from(self.0 - 1)
    }

    /// All generations in ascending order.
    pub fn all() -> [Generation; 3] {
        [Generation(1), Generation(2), Generation(3)]
    }

    pub fn next(&self) -> Option<Generation> {
        Generation::new(self.0 + 1)
    }
}

impl TryFrom<u8> for Generation {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Generation::new(value).ok_or_else(|| format!("generation out of range: {}", value))
    }
}

impl TryFrom<i64> for Generation {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u8::try_from(value)
            .ok()
            .and_then(Generation::new)
            .ok_or_else(|| format!("generation out of range: {}", value))
    }
}

impl From<Generation> for u8 {
    fn from(g: Generation) -> u8 {
        g.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
