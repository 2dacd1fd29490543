//! Feed identifiers and price feed payloads.
//!
//! `FeedId` is the canonical registry key: hex ids are normalized (leading
//! `0x` stripped, lowercased) so that differently spelled inputs compare
//! equal. Normalization is permissive; ids that do not look like hex are
//! still accepted verbatim after case folding.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Case-normalized price feed identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct FeedId(String);

impl FeedId {
    /// Normalizes a raw id: strips a leading `0x`/`0X` prefix and lowercases.
    pub fn new(raw: impl AsRef<str>) -> Self {
        let raw = raw.as_ref().trim();
        let stripped = raw
            .strip_prefix("0x")
            .or_else(|| raw.strip_prefix("0X"))
            .unwrap_or(raw);
        Self(stripped.to_ascii_lowercase())
    }

    /// Returns the normalized id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FeedId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for FeedId {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

impl<'de> Deserialize<'de> for FeedId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::new(raw))
    }
}

/// Price with confidence interval at a point in time.
///
/// Prices are string-encoded fixed-point values scaled by `expo`, exactly as
/// the service serializes them.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct PriceData {
    /// Price value as a decimal string.
    pub price: String,
    /// Confidence interval as a decimal string.
    pub conf: String,
    /// Power-of-ten exponent applied to `price` and `conf`.
    pub expo: i32,
    /// Unix timestamp of the price, in seconds.
    pub publish_time: i64,
}

/// Parsed price feed update payload.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct PriceFeed {
    /// Normalized feed identifier.
    pub id: FeedId,
    /// Latest aggregate price.
    pub price: PriceData,
    /// Exponentially weighted moving average price.
    pub ema_price: PriceData,
    /// Verbose metadata echoed by the server when requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl PriceFeed {
    /// Parses a raw `price_feed` payload from an update frame.
    pub fn from_json(value: Value) -> Result<Self, FeedParseError> {
        serde_json::from_value(value).map_err(FeedParseError)
    }
}

/// A `price_feed` payload did not match the expected schema.
#[derive(Debug, Error)]
#[error("malformed price feed payload: {0}")]
pub struct FeedParseError(#[source] pub serde_json::Error);
