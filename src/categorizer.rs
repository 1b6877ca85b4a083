//! Merchant category code (MCC) to semantic category lookup.

use crate::types::transaction::Category;
use std::collections::HashMap;

/// Fixed MCC table. Codes not listed here resolve to [`Category::Unknown`].
pub const MCC_TABLE: &[(&str, Category)] = &[
    ("5411", Category::Grocery),
    ("5651", Category::Clothing),
    ("5541", Category::Gas),
    ("5732", Category::Electronics),
    ("5812", Category::Dining),
];

/// Deterministic MCC categorizer. The table is built once and never mutated.
pub struct MerchantCategorizer {
    table: HashMap<&'static str, Category>,
}

impl MerchantCategorizer {
    pub fn new() -> Self {
        Self {
            table: MCC_TABLE.iter().copied().collect(),
        }
    }

    /// Total over all inputs: unmapped codes are UNKNOWN, never an error
    pub fn categorize(&self, mcc: &str) -> Category {
        self.table.get(mcc).copied().unwrap_or(Category::Unknown)
    }

    /// Number of mapped codes
    pub fn mapped_codes(&self) -> usize {
        self.table.len()
    }
}

impl Default for MerchantCategorizer {
    fn default() -> Self {
        Self::new()
    }
}
