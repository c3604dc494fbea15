//! Price Resolution
//!
//! The price book is an immutable configuration snapshot handed into each
//! billing run: admin uuid to identity and contracted rate. Descendant
//! admins always bill at their root's rate; their own book entries are
//! ignored by design (sub-admins sell at the parent's contracted rate).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// System default rate applied when neither the book nor the ledger knows
/// an admin's price.
pub const DEFAULT_PRICE_PER_GB: i64 = 1400;

/// Identity and rate configuration for one billing root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountEntry {
    /// Operator-facing messaging id
    pub telegram_id: i64,
    /// Display/reference code
    pub fa_number: String,
    /// Contracted rate, toman per GB
    pub price_per_gb: i64,
}

/// Immutable price/identity configuration snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriceBook {
    accounts: HashMap<Uuid, AccountEntry>,
}

impl PriceBook {
    /// Empty book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an entry.
    pub fn insert(&mut self, uuid: Uuid, entry: AccountEntry) {
        self.accounts.insert(uuid, entry);
    }

    /// Look up an entry.
    pub fn get(&self, uuid: &Uuid) -> Option<&AccountEntry> {
        self.accounts.get(uuid)
    }

    /// Whether the book knows this admin.
    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.accounts.contains_key(uuid)
    }

    /// Configured uuids, in no particular order.
    pub fn uuids(&self) -> impl Iterator<Item = &Uuid> {
        self.accounts.keys()
    }

    /// Configured entries.
    pub fn iter(&self) -> impl Iterator<Item = (&Uuid, &AccountEntry)> {
        self.accounts.iter()
    }

    /// Number of configured roots.
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    /// Whether the book is empty.
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

/// Resolve the rate every descendant of `root_uuid` bills at.
///
/// Fallback chain: the root's book entry, then the rate persisted on the
/// root's ledger account (`stored_price`), then the system default. Never
/// fails.
pub fn resolve_price(root_uuid: &Uuid, book: &PriceBook, stored_price: Option<i64>) -> i64 {
    book.get(root_uuid)
        .map(|entry| entry.price_per_gb)
        .or(stored_price)
        .unwrap_or(DEFAULT_PRICE_PER_GB)
}
