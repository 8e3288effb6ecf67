//! Mirrored record types and the dataset descriptors that bind them to a
//! namespace, a key extractor and a freshness comparator.

use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::freshness::Freshness;

/// Anything that can be stored in a mirrored namespace.
pub trait MirrorRecord: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> MirrorRecord for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Describes one mirrored dataset: where it lives, how its records are keyed
/// and how remote freshness is judged.
pub struct Dataset<R> {
    pub namespace: &'static str,
    pub freshness: Freshness,
    key: fn(&R) -> String,
}

impl<R> Dataset<R> {
    pub const fn new(namespace: &'static str, freshness: Freshness, key: fn(&R) -> String) -> Self {
        Self {
            namespace,
            freshness,
            key,
        }
    }

    pub fn key_of(&self, record: &R) -> String {
        (self.key)(record)
    }
}

impl<R> Clone for Dataset<R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R> Copy for Dataset<R> {}

impl<R> fmt::Debug for Dataset<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dataset")
            .field("namespace", &self.namespace)
            .field("freshness", &self.freshness)
            .finish()
    }
}

pub const ITEMS_NAMESPACE: &str = "items";
pub const STOCK_NAMESPACE: &str = "stock";

/// Item catalog, keyed by barcode. The catalog service publishes an upload
/// date that must match exactly.
pub const CATALOG: Dataset<CatalogItem> =
    Dataset::new(ITEMS_NAMESPACE, Freshness::Exact, CatalogItem::natural_key);

/// Stock levels, keyed by style/color/size. The stock service publishes a
/// numeric timestamp; only a newer one triggers a refetch.
pub const STOCK: Dataset<StockLevel> =
    Dataset::new(STOCK_NAMESPACE, Freshness::Newer, StockLevel::natural_key);

/// The mirrored datasets addressable by namespace from the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    Catalog,
    Stock,
}

impl DatasetKind {
    pub const ALL: [DatasetKind; 2] = [DatasetKind::Catalog, DatasetKind::Stock];

    pub fn from_namespace(namespace: &str) -> Option<Self> {
        match namespace.trim().to_ascii_lowercase().as_str() {
            ITEMS_NAMESPACE | "catalog" => Some(Self::Catalog),
            STOCK_NAMESPACE => Some(Self::Stock),
            _ => None,
        }
    }

    pub fn namespace(self) -> &'static str {
        match self {
            Self::Catalog => CATALOG.namespace,
            Self::Stock => STOCK.namespace,
        }
    }
}

// ---------------------------------------------------------------------------
// Record types
// ---------------------------------------------------------------------------

/// One row of the master item catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    #[serde(alias = "Barcode", deserialize_with = "string_or_number")]
    pub barcode: String,
    #[serde(
        default,
        alias = "Style",
        alias = "styleNo",
        alias = "style_no",
        deserialize_with = "opt_string_or_number"
    )]
    pub style: Option<String>,
    #[serde(
        default,
        alias = "Color",
        alias = "colour",
        deserialize_with = "opt_string_or_number"
    )]
    pub color: Option<String>,
    #[serde(default, alias = "Size", deserialize_with = "opt_string_or_number")]
    pub size: Option<String>,
    #[serde(
        default,
        alias = "Description",
        alias = "itemName",
        alias = "item_name",
        deserialize_with = "opt_string_or_number"
    )]
    pub description: Option<String>,
    #[serde(default, alias = "MRP", alias = "mrp", deserialize_with = "opt_number")]
    pub price: Option<f64>,
    /// Remaining columns, passed through to the UI untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CatalogItem {
    pub fn natural_key(&self) -> String {
        self.barcode.trim().to_string()
    }
}

/// Stock on hand for one style/color/size combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockLevel {
    #[serde(
        alias = "Style",
        alias = "styleNo",
        alias = "style_no",
        deserialize_with = "string_or_number"
    )]
    pub style: String,
    #[serde(alias = "Color", alias = "colour", deserialize_with = "string_or_number")]
    pub color: String,
    #[serde(alias = "Size", deserialize_with = "string_or_number")]
    pub size: String,
    #[serde(
        default,
        alias = "Quantity",
        alias = "qty",
        alias = "stock",
        deserialize_with = "opt_number"
    )]
    pub quantity: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StockLevel {
    pub fn natural_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.style.trim(),
            self.color.trim(),
            self.size.trim()
        )
    }
}

// ---------------------------------------------------------------------------
// Spreadsheet-tolerant field readers
// ---------------------------------------------------------------------------

/// Spreadsheet exports send numeric-looking cells (barcodes, sizes) as numbers.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

fn opt_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(n.as_f64()),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| de::Error::custom(format!("not a number: {s}"))),
        other => Err(de::Error::custom(format!("expected number, got {other}"))),
    }
}
