//! Universe configuration: the list of symbols to keep in sync.
//!
//! The universe is stored as a TOML file with a quote asset, the symbol list
//! (base assets or full pairs) and the optional earliest-available instant of
//! each symbol:
//!
//! ```toml
//! quote = "USDT"
//! symbols = ["btc", "eth", "SOLUSDT"]
//!
//! [first_available]
//! BTCUSDT = "2017-08-17T00:00:00Z"
//! ```
//!
//! Symbols are canonicalized once, here; everything downstream sees only
//! canonical names.

use crate::domain::{canonical_symbol, parse_utc, SymbolDescriptor, ValidationError, DEFAULT_QUOTE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// On-disk shape of the universe file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UniverseFile {
    #[serde(default = "default_quote")]
    quote: String,
    #[serde(default)]
    symbols: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    first_available: BTreeMap<String, String>,
}

fn default_quote() -> String {
    DEFAULT_QUOTE.to_string()
}

/// A validated universe: canonical, unique, non-empty.
#[derive(Debug, Clone, PartialEq)]
pub struct Universe {
    quote: String,
    symbols: Vec<String>,
    first_available: BTreeMap<String, DateTime<Utc>>,
}

impl Universe {
    /// Load a universe from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ValidationError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ValidationError::Unreadable(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Parse a universe from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ValidationError> {
        let file: UniverseFile =
            toml::from_str(content).map_err(|e| ValidationError::Unparseable(e.to_string()))?;

        let mut universe = Self::from_symbols(&file.symbols, &file.quote)?;
        for (raw, value) in &file.first_available {
            let symbol = canonical_symbol(raw, &universe.quote)?;
            if !universe.contains(&symbol) {
                tracing::warn!(symbol, "first_available entry for a symbol not in the universe");
                continue;
            }
            universe.first_available.insert(symbol, parse_utc(value)?);
        }
        Ok(universe)
    }

    /// Build a universe from raw symbol names.
    pub fn from_symbols<S: AsRef<str>>(raw: &[S], quote: &str) -> Result<Self, ValidationError> {
        let quote = quote.trim().to_ascii_uppercase();
        let mut seen = HashSet::new();
        let mut symbols = Vec::with_capacity(raw.len());

        for r in raw {
            let symbol = canonical_symbol(r.as_ref(), &quote)?;
            if !seen.insert(symbol.clone()) {
                return Err(ValidationError::DuplicateSymbol(symbol));
            }
            symbols.push(symbol);
        }

        if symbols.is_empty() {
            return Err(ValidationError::EmptyUniverse);
        }

        Ok(Self {
            quote,
            symbols,
            first_available: BTreeMap::new(),
        })
    }

    pub fn quote(&self) -> &str {
        &self.quote
    }

    /// Canonical symbols in file order.
    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols.iter().any(|s| s == symbol)
    }

    pub fn first_available(&self, symbol: &str) -> Option<DateTime<Utc>> {
        self.first_available.get(symbol).copied()
    }

    /// Symbols whose first-available date is still unknown.
    pub fn missing_first_available(&self) -> Vec<&str> {
        self.symbols
            .iter()
            .filter(|s| !self.first_available.contains_key(s.as_str()))
            .map(|s| s.as_str())
            .collect()
    }

    /// Record the earliest-available instant of a universe symbol.
    pub fn set_first_available(
        &mut self,
        symbol: &str,
        first: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        if !self.contains(symbol) {
            return Err(ValidationError::InvalidSymbol(symbol.to_string()));
        }
        self.first_available.insert(symbol.to_string(), first);
        Ok(())
    }

    /// Descriptors handed to the synchronization engine.
    pub fn descriptors(&self) -> Vec<SymbolDescriptor> {
        self.symbols
            .iter()
            .map(|s| SymbolDescriptor {
                symbol: s.clone(),
                first_available: self.first_available(s),
            })
            .collect()
    }

    /// Serialize the universe to TOML. Symbols are written in canonical form.
    pub fn to_toml(&self) -> Result<String, ValidationError> {
        let file = UniverseFile {
            quote: self.quote.clone(),
            symbols: self.symbols.clone(),
            first_available: self
                .first_available
                .iter()
                .map(|(s, t)| (s.clone(), t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)))
                .collect(),
        };
        toml::to_string_pretty(&file).map_err(|e| ValidationError::Unwritable(e.to_string()))
    }

    /// Write the universe back to a TOML file (`.tmp` + rename).
    pub fn save(&self, path: &Path) -> Result<(), ValidationError> {
        let content = self.to_toml()?;
        let tmp_path = path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, content)
            .map_err(|e| ValidationError::Unwritable(format!("{}: {e}", tmp_path.display())))?;
        std::fs::rename(&tmp_path, path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp_path);
            ValidationError::Unwritable(format!("{}: {e}", path.display()))
        })
    }
}
