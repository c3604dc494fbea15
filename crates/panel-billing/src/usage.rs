//! Usage Aggregation
//!
//! Filters a snapshot's end-user accounts down to one admin's billable
//! provisioning inside a billing window and sums the GB quotas. Quotas are
//! whole GB and summed with exact integer arithmetic.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use panel_common::{AdminRecord, EndUserAccount};

/// Half-open-ish billing window: `start < date <= end`.
///
/// The asymmetry is intentional: an account created exactly on a previous
/// cutoff belongs to the previous invoice and must not be billed twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingWindow {
    /// Exclusive lower bound
    pub start: NaiveDate,
    /// Inclusive upper bound
    pub end: NaiveDate,
}

impl BillingWindow {
    /// Default window: the last 30 days up to yesterday.
    pub fn ending_yesterday(today: NaiveDate) -> Self {
        Self {
            start: today - Duration::days(30),
            end: today - Duration::days(1),
        }
    }

    /// Whether a provisioning date falls inside the window.
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start < date && date <= self.end
    }
}

/// One billable end-user line inside an admin's aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLine {
    /// Account identifier
    pub user_uuid: Uuid,
    /// Account display name
    pub user_name: String,
    /// Provisioning date
    pub start_date: NaiveDate,
    /// Billable quota in GB
    pub usage_gb: i64,
}

/// Aggregated usage for one admin within a window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminUsage {
    /// The admin the usage belongs to
    pub admin_uuid: Uuid,
    /// Admin display name
    pub admin_name: String,
    /// Exact sum of billable quotas; zero when nothing matched
    pub total_gb: i64,
    /// The matched accounts, in snapshot order
    pub lines: Vec<UsageLine>,
}

/// Aggregate usage per descendant admin.
///
/// Every admin in `descendants` gets an entry, zero-usage ones included.
/// An account counts toward an admin when it was provisioned by that admin,
/// has a parseable `start_date` inside the window, and does not carry the
/// free-tier quota sentinel.
pub fn aggregate_usage(
    descendants: &[AdminRecord],
    users: &[EndUserAccount],
    window: &BillingWindow,
) -> Vec<AdminUsage> {
    descendants
        .iter()
        .map(|admin| {
            let lines: Vec<UsageLine> = users
                .iter()
                .filter(|user| user.added_by_uuid == Some(admin.uuid))
                .filter(|user| !user.is_free_tier())
                .filter_map(|user| {
                    let start_date = user.start_date?;
                    window.contains(start_date).then(|| UsageLine {
                        user_uuid: user.uuid,
                        user_name: user.name.clone(),
                        start_date,
                        usage_gb: user.usage_limit_gb,
                    })
                })
                .collect();

            let total_gb = lines.iter().map(|l| l.usage_gb).sum();
            AdminUsage {
                admin_uuid: admin.uuid,
                admin_name: admin.name.clone(),
                total_gb,
                lines,
            }
        })
        .collect()
}
