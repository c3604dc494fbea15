//! Panel Billing Core
//!
//! Usage-based billing for a fleet of proxy panels: parses panel export
//! snapshots, walks each billable admin's subtree, aggregates provisioned
//! usage inside a billing window, prices it at the root's rate, and
//! reconciles invoices against payments in a SQLite-backed ledger.
//!
//! ```text
//!                     +----------------------+
//!   panel snapshots   |    BillingEngine     |   reports
//!   ----------------> |                      | ----------->
//!   price book        |  hierarchy  usage    |
//!   ----------------> |  pricing    invoicing|
//!                     |        ledger        |
//!                     +----------+-----------+
//!                                |
//!                           SQLite ledger
//!                    (invoice additions, payments,
//!                     running totals per root)
//! ```
//!
//! Money is integer toman throughout; usage is whole GB. Paid/unpaid
//! status is derived FIFO from the ledger, never stored.

#![warn(missing_docs)]

pub mod accounts;
pub mod invoicing;
pub mod ledger;
pub mod pricing;
pub mod report;
pub mod usage;

use std::collections::HashSet;
use std::path::Path;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use panel_common::{billable_roots, resolve_descendants, PanelSnapshot, SnapshotError};

pub use crate::accounts::SyncOutcome;
pub use crate::invoicing::{calculate_invoice, AdminLine, InvoiceCalculation};
pub use crate::ledger::{
    AccountStatus, AdminAccount, BalanceSnapshot, DashboardStats, InvoiceDeletion, InvoiceEntry,
    LedgerError, LedgerResult, LedgerStore, PaymentRecord, PaymentReduction,
};
pub use crate::pricing::{resolve_price, AccountEntry, PriceBook, DEFAULT_PRICE_PER_GB};
pub use crate::report::{
    format_amount, parse_amount, BillingRun, RootInvoiceReport, SELL_ALERT_THRESHOLD,
};
pub use crate::usage::{aggregate_usage, AdminUsage, BillingWindow, UsageLine};

/// Billing engine error type
#[derive(Error, Debug)]
pub enum BillingError {
    /// Ledger storage failure
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// Snapshot parse failure
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Whether a billing run writes to the ledger or only reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Compute and report without touching the ledger
    Preview,
    /// Compute, report, and record invoices in the ledger
    Commit,
}

/// Facade over the billing pipeline: snapshots in, reports out, ledger
/// effects recorded per root when committing.
pub struct BillingEngine {
    ledger: LedgerStore,
}

impl BillingEngine {
    /// Engine backed by a ledger database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, BillingError> {
        Ok(Self {
            ledger: LedgerStore::open(path)?,
        })
    }

    /// Engine backed by an in-memory ledger, for tests and previews.
    pub fn in_memory() -> Result<Self, BillingError> {
        Ok(Self {
            ledger: LedgerStore::open_in_memory()?,
        })
    }

    /// Direct access to the underlying ledger store.
    pub fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }

    /// Run billing over a set of panel snapshots.
    ///
    /// Every billable root across all snapshots is processed exactly once:
    /// an admin already covered by an earlier root's subtree (or seen on an
    /// earlier panel) is skipped. `window` defaults to the last 30 days
    /// ending yesterday. In [`RunMode::Commit`] each root's invoice total
    /// and per-admin usage rows are recorded; roots without a ledger
    /// account are reported but not recorded.
    pub fn run_billing(
        &self,
        snapshots: &[PanelSnapshot],
        book: &PriceBook,
        window: Option<BillingWindow>,
        mode: RunMode,
    ) -> Result<BillingRun, BillingError> {
        let window =
            window.unwrap_or_else(|| BillingWindow::ending_yesterday(Utc::now().date_naive()));
        let mut processed: HashSet<Uuid> = HashSet::new();
        let mut run = BillingRun::default();

        for snapshot in snapshots {
            let observed: Vec<(Uuid, &str)> = snapshot
                .admin_users
                .iter()
                .map(|a| (a.uuid, a.name.as_str()))
                .collect();
            self.ledger.refresh_names(observed)?;

            for root in billable_roots(&snapshot.admin_users) {
                if processed.contains(&root.uuid) {
                    debug!(root = %root.uuid, "already covered by an earlier subtree, skipping");
                    continue;
                }
                let descendants = resolve_descendants(root, &snapshot.admin_users);
                for admin in &descendants {
                    processed.insert(admin.uuid);
                }

                let usages = aggregate_usage(&descendants, &snapshot.users, &window);
                let stored = self.ledger.stored_price(root.uuid)?;
                let price = resolve_price(&root.uuid, book, stored);

                // Prior balance must be read before any write of this run,
                // otherwise the fresh invoice counts as its own remainder.
                let prior = self.ledger.balance(root.uuid)?;
                let calc = calculate_invoice(root.uuid, &usages, price, &prior);

                if mode == RunMode::Commit {
                    self.commit_root(root.uuid, snapshot.panel_number, &calc, &window)?;
                }

                let report = RootInvoiceReport {
                    root_uuid: root.uuid,
                    root_name: root.name.clone(),
                    panel_number: snapshot.panel_number,
                    window,
                    lines: calc.lines,
                    detail: usages,
                    current_total: calc.current_total,
                    unpaid_remainder: calc.carried_balance,
                    payable_total: calc.payable_total,
                };
                run.total_amount += report.current_total;
                run.total_usage_gb += report.total_gb();
                run.reports.push(report);
            }
        }

        if run.over_threshold() {
            warn!(
                total_amount = run.total_amount,
                "run total crossed the review threshold"
            );
        }
        info!(
            roots = run.reports.len(),
            total_amount = run.total_amount,
            total_usage_gb = run.total_usage_gb,
            "billing run finished"
        );
        Ok(run)
    }

    fn commit_root(
        &self,
        root_uuid: Uuid,
        panel_number: u32,
        calc: &InvoiceCalculation,
        window: &BillingWindow,
    ) -> Result<(), BillingError> {
        if self.ledger.account(root_uuid)?.is_none() {
            warn!(root = %root_uuid, "root has no ledger account, invoice not recorded");
            return Ok(());
        }
        self.ledger
            .set_panel_number(root_uuid, panel_number as i64)?;
        for line in calc.lines.iter().filter(|l| l.usage_gb > 0) {
            self.ledger
                .record_usage_invoice(line.admin_uuid, window.end, line.usage_gb, line.amount)?;
        }
        if calc.current_total > 0 {
            self.ledger
                .add_invoice(root_uuid, calc.current_total, window)?;
        }
        Ok(())
    }
}
