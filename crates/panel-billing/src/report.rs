//! Billing Reports
//!
//! Presentation-ready output of a billing run: one report per billing
//! root plus a run summary. Amounts are stored in toman but displayed in
//! thousands, so the format/parse helpers here scale by 1000 in each
//! direction.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::invoicing::AdminLine;
use crate::usage::{AdminUsage, BillingWindow};

/// A run whose grand total crosses this is flagged for operator review.
pub const SELL_ALERT_THRESHOLD: i64 = 10_000_000;

/// Finished invoice report for one billing root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootInvoiceReport {
    /// The billing root
    pub root_uuid: Uuid,
    /// Root display name
    pub root_name: String,
    /// Panel the root's snapshot came from
    pub panel_number: u32,
    /// The billed window
    pub window: BillingWindow,
    /// Per-admin priced breakdown, root first
    pub lines: Vec<AdminLine>,
    /// Per-admin account detail behind the lines
    pub detail: Vec<AdminUsage>,
    /// Sum of line amounts for this window
    pub current_total: i64,
    /// Unpaid remainder carried from earlier periods
    pub unpaid_remainder: i64,
    /// `current_total + unpaid_remainder`
    pub payable_total: i64,
}

impl RootInvoiceReport {
    /// Total billable GB across the subtree.
    pub fn total_gb(&self) -> i64 {
        self.lines.iter().map(|l| l.usage_gb).sum()
    }
}

/// Summary of one billing run across every processed root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BillingRun {
    /// One report per billing root, in processing order
    pub reports: Vec<RootInvoiceReport>,
    /// Sum of `current_total` across reports
    pub total_amount: i64,
    /// Sum of billable GB across reports
    pub total_usage_gb: i64,
}

impl BillingRun {
    /// Whether the run's grand total warrants operator review.
    pub fn over_threshold(&self) -> bool {
        self.total_amount > SELL_ALERT_THRESHOLD
    }
}

/// Display an amount in thousands with comma separators: 2_500_000
/// becomes "2,500". Rounds to the nearest thousand.
pub fn format_amount(amount: i64) -> String {
    let thousands = if amount >= 0 {
        (amount + 500) / 1000
    } else {
        (amount - 500) / 1000
    };
    let negative = thousands < 0;
    let digits = thousands.unsigned_abs().to_string();

    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if negative {
        format!("-{grouped}")
    } else {
        grouped
    }
}

/// Parse operator input in thousands back to an amount: "2,500" becomes
/// 2_500_000. Unparseable input is treated as zero.
pub fn parse_amount(text: &str) -> i64 {
    let cleaned: String = text.chars().filter(|c| *c != ',' && *c != ' ').collect();
    cleaned.parse::<i64>().map(|v| v * 1000).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_amount_groups_thousands() {
        assert_eq!(format_amount(0), "0");
        assert_eq!(format_amount(2_500_000), "2,500");
        assert_eq!(format_amount(1_234_567_000), "1,234,567");
        assert_eq!(format_amount(999), "1"); // rounds up
        assert_eq!(format_amount(499), "0");
        assert_eq!(format_amount(-2_500_000), "-2,500");
    }

    #[test]
    fn test_parse_amount_scales_and_tolerates_garbage() {
        assert_eq!(parse_amount("2,500"), 2_500_000);
        assert_eq!(parse_amount(" 1,234,567 "), 1_234_567_000);
        assert_eq!(parse_amount("42"), 42_000);
        assert_eq!(parse_amount("not a number"), 0);
        assert_eq!(parse_amount(""), 0);
    }

    #[test]
    fn test_format_parse_agree_on_round_amounts() {
        for amount in [0, 1_000, 2_500_000, 987_654_000] {
            assert_eq!(parse_amount(&format_amount(amount)), amount);
        }
    }

    #[test]
    fn test_run_threshold() {
        let mut run = BillingRun::default();
        run.total_amount = SELL_ALERT_THRESHOLD;
        assert!(!run.over_threshold());
        run.total_amount = SELL_ALERT_THRESHOLD + 1;
        assert!(run.over_threshold());
    }
}
