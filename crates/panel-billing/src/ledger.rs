//! Ledger Store
//!
//! Append-only log of invoice additions and payments per billing root,
//! persisted in SQLite, plus the running totals kept on the account row.
//! Single-operator model: one long-lived connection, no concurrent
//! writers.
//!
//! Two invariants rule this module:
//! - `total_earned` / `total_paid` always equal the sum of currently-live
//!   invoice-addition / payment rows. Every row mutation and its paired
//!   running-total adjustment happen inside one transaction.
//! - Paid/unpaid status of an invoice is never stored. It is derived on
//!   read by a FIFO cumulative-sum comparison (oldest invoices are paid
//!   first by oldest payments), via one pure function shared by display
//!   and deletion-impact paths.

use chrono::{Duration, NaiveDate, NaiveDateTime, Utc};
use indoc::indoc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::usage::BillingWindow;

const DATE_FMT: &str = "%Y-%m-%d";
const DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

const SCHEMA: &str = indoc! {"
    CREATE TABLE IF NOT EXISTS admin_accounts (
        uuid TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        telegram_id INTEGER,
        panel_number INTEGER,
        fa_number TEXT,
        price_per_gb INTEGER NOT NULL DEFAULT 1400,
        total_earned INTEGER NOT NULL DEFAULT 0,
        total_paid INTEGER NOT NULL DEFAULT 0,
        last_payment_date TEXT,
        last_invoice_date TEXT,
        status TEXT NOT NULL DEFAULT 'active'
    );

    CREATE TABLE IF NOT EXISTS payments (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        admin_uuid TEXT NOT NULL REFERENCES admin_accounts (uuid),
        amount INTEGER NOT NULL,
        payment_date TEXT NOT NULL,
        method TEXT,
        reference TEXT,
        notes TEXT
    );

    CREATE TABLE IF NOT EXISTS invoices (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        admin_uuid TEXT NOT NULL REFERENCES admin_accounts (uuid),
        invoice_date TEXT NOT NULL,
        usage_gb INTEGER NOT NULL,
        amount INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'unpaid'
    );

    CREATE TABLE IF NOT EXISTS invoice_additions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        admin_uuid TEXT NOT NULL REFERENCES admin_accounts (uuid),
        amount INTEGER NOT NULL,
        addition_date TEXT NOT NULL,
        invoice_period_start TEXT NOT NULL,
        invoice_period_end TEXT NOT NULL
    );
"};

/// Ledger error type
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Underlying SQLite failure (including transaction failures)
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    /// A row id that no longer exists; callers treat this as a no-op
    #[error("{entity} {id} not found")]
    NotFound {
        /// Which table the id was looked up in
        entity: &'static str,
        /// The missing row id
        id: i64,
    },
    /// The billing root has no account row
    #[error("admin account {0} not found")]
    AdminNotFound(Uuid),
    /// Ledger amounts are never negative
    #[error("amount cannot be negative")]
    NegativeAmount,
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Account status lifecycle: active until removed from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountStatus {
    /// Billable and shown in listings
    Active,
    /// Removed from configuration but kept for its financial history
    Inactive,
}

impl AccountStatus {
    fn as_str(self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Inactive => "inactive",
        }
    }

    fn from_db(text: &str) -> Self {
        match text {
            "inactive" => AccountStatus::Inactive,
            _ => AccountStatus::Active,
        }
    }
}

/// Persisted account row for one billing root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminAccount {
    /// Billing root identifier
    pub uuid: Uuid,
    /// Display name, refreshed from snapshots
    pub name: String,
    /// Operator-facing messaging id
    pub telegram_id: Option<i64>,
    /// Panel the admin was last seen on
    pub panel_number: Option<i64>,
    /// Display/reference code
    pub fa_number: Option<String>,
    /// Persisted rate, the pricing fallback
    pub price_per_gb: i64,
    /// Running sum of live invoice additions
    pub total_earned: i64,
    /// Running sum of live payments
    pub total_paid: i64,
    /// Date of the most recent payment
    pub last_payment_date: Option<NaiveDate>,
    /// Date of the most recent invoice addition
    pub last_invoice_date: Option<NaiveDate>,
    /// Active/inactive lifecycle state
    pub status: AccountStatus,
}

/// Earned/paid totals read in one shot, before any write of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    /// `total_earned` at read time
    pub earned: i64,
    /// `total_paid` at read time
    pub paid: i64,
}

impl BalanceSnapshot {
    /// Unpaid remainder carried into the next invoice; an admin in credit
    /// carries zero, never a negative balance.
    pub fn carried(&self) -> i64 {
        (self.earned - self.paid).max(0)
    }
}

/// One live invoice-addition row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceAddition {
    /// Row id
    pub id: i64,
    /// Billing root
    pub admin_uuid: Uuid,
    /// Invoiced amount
    pub amount: i64,
    /// Wall-clock creation time, audit display only
    pub addition_date: NaiveDateTime,
    /// Start of the billing window this addition covers
    pub period_start: NaiveDate,
    /// End of the billing window this addition covers
    pub period_end: NaiveDate,
}

/// Invoice-addition row with its derived FIFO paid status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceEntry {
    /// The underlying row
    pub addition: InvoiceAddition,
    /// Derived, never stored
    pub paid: bool,
}

/// One live payment row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    /// Row id
    pub id: i64,
    /// Billing root
    pub admin_uuid: Uuid,
    /// Paid amount
    pub amount: i64,
    /// Date the payment was made
    pub payment_date: NaiveDate,
}

/// Per-admin usage audit row written during a committed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageInvoice {
    /// Row id
    pub id: i64,
    /// The admin whose usage this row records
    pub admin_uuid: Uuid,
    /// End of the billed window
    pub invoice_date: NaiveDate,
    /// Billed GB
    pub usage_gb: i64,
    /// Billed amount
    pub amount: i64,
    /// Display status, independent of the FIFO derivation
    pub status: String,
}

/// How much one payment was reduced while unwinding a deleted invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentReduction {
    /// The payment that funded the deleted invoice
    pub payment_id: i64,
    /// Its payment date, for operator display
    pub payment_date: NaiveDate,
    /// Amount taken back from this payment
    pub amount: i64,
    /// Whether the reduction drove the payment to zero and removed it
    pub deleted: bool,
}

/// Outcome of deleting an invoice addition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceDeletion {
    /// Amount of the deleted invoice
    pub invoice_amount: i64,
    /// Payments reduced to unwind the FIFO allocation
    pub reductions: Vec<PaymentReduction>,
    /// Sum of applied reductions (`total_paid` decreased by this much)
    pub total_reduced: i64,
    /// Planned-but-unapplied reduction after clamping; non-zero marks a
    /// partial reallocation
    pub shortfall: i64,
}

/// Dashboard overview totals.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DashboardStats {
    /// Accounts currently active
    pub active_admins: i64,
    /// Sum of `total_earned` across all accounts
    pub total_earned: i64,
    /// Sum of `total_paid` across all accounts
    pub total_paid: i64,
    /// `total_earned - total_paid`
    pub total_balance: i64,
    /// Payments recorded in the trailing 30 days
    pub recent_payment_count: i64,
    /// Amount paid in the trailing 30 days
    pub recent_payment_amount: i64,
}

/// Ids of invoices fully covered by cumulative payments, FIFO.
///
/// `invoices_fifo` must be ordered oldest-first (period start, then
/// addition time, then id). An invoice is paid iff the cumulative sum of
/// invoice amounts up to and including it does not exceed the payment
/// total. Pure; shared by display and deletion-impact computation.
pub fn paid_invoice_ids(invoices_fifo: &[(i64, i64)], total_payments: i64) -> Vec<i64> {
    let mut cumulative = 0;
    let mut paid = Vec::new();
    for &(id, amount) in invoices_fifo {
        cumulative += amount;
        if cumulative <= total_payments {
            paid.push(id);
        }
    }
    paid
}

/// Which payments funded `invoice_id`, and by how much, under FIFO
/// allocation.
///
/// Both inputs are `(id, amount)` ordered oldest-first. The invoice
/// occupies the interval `[preceding, preceding + amount)` on the
/// cumulative-invoice axis; each payment occupies an interval on the
/// cumulative-payment axis; a payment's attributable portion is the
/// overlap of the two. An unfunded (fully unpaid) invoice yields no
/// reductions.
pub fn payment_reductions_for(
    invoices_fifo: &[(i64, i64)],
    payments_fifo: &[(i64, i64)],
    invoice_id: i64,
) -> Vec<(i64, i64)> {
    let mut preceding = 0;
    let mut target_amount = None;
    for &(id, amount) in invoices_fifo {
        if id == invoice_id {
            target_amount = Some(amount);
            break;
        }
        preceding += amount;
    }
    let Some(target_amount) = target_amount else {
        return Vec::new();
    };

    let target_lo = preceding;
    let target_hi = preceding + target_amount;
    let mut reductions = Vec::new();
    let mut cursor = 0;
    for &(payment_id, payment_amount) in payments_fifo {
        let lo = cursor.max(target_lo);
        let hi = (cursor + payment_amount).min(target_hi);
        if hi > lo {
            reductions.push((payment_id, hi - lo));
        }
        cursor += payment_amount;
        if cursor >= target_hi {
            break;
        }
    }
    reductions
}

/// SQLite-backed ledger store. One long-lived connection for the process
/// lifetime; every mutation runs inside a transaction that covers both the
/// row change and the running-total adjustment.
pub struct LedgerStore {
    pub(crate) conn: Mutex<Connection>,
}

impl LedgerStore {
    /// Open or create the ledger database at `path`.
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> LedgerResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory ledger for tests.
    pub fn open_in_memory() -> LedgerResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> LedgerResult<Self> {
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        info!("ledger store initialized");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Append an invoice addition and increment `total_earned`.
    pub fn add_invoice(
        &self,
        admin_uuid: Uuid,
        amount: i64,
        period: &BillingWindow,
    ) -> LedgerResult<i64> {
        if amount < 0 {
            return Err(LedgerError::NegativeAmount);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        ensure_account(&tx, admin_uuid)?;

        let now = Utc::now().naive_utc();
        tx.execute(
            indoc! {"
                INSERT INTO invoice_additions
                    (admin_uuid, amount, addition_date, invoice_period_start, invoice_period_end)
                VALUES (?1, ?2, ?3, ?4, ?5)
            "},
            params![
                admin_uuid.to_string(),
                amount,
                now.format(DATETIME_FMT).to_string(),
                period.start.format(DATE_FMT).to_string(),
                period.end.format(DATE_FMT).to_string(),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE admin_accounts SET total_earned = total_earned + ?1, last_invoice_date = ?2 WHERE uuid = ?3",
            params![
                amount,
                now.date().format(DATE_FMT).to_string(),
                admin_uuid.to_string()
            ],
        )?;
        tx.commit()?;
        debug!(%admin_uuid, amount, id, "invoice addition recorded");
        Ok(id)
    }

    /// Append a payment and increment `total_paid`.
    pub fn add_payment(
        &self,
        admin_uuid: Uuid,
        amount: i64,
        payment_date: NaiveDate,
    ) -> LedgerResult<i64> {
        if amount < 0 {
            return Err(LedgerError::NegativeAmount);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        ensure_account(&tx, admin_uuid)?;

        tx.execute(
            "INSERT INTO payments (admin_uuid, amount, payment_date) VALUES (?1, ?2, ?3)",
            params![
                admin_uuid.to_string(),
                amount,
                payment_date.format(DATE_FMT).to_string()
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE admin_accounts SET total_paid = total_paid + ?1, last_payment_date = ?2 WHERE uuid = ?3",
            params![
                amount,
                payment_date.format(DATE_FMT).to_string(),
                admin_uuid.to_string()
            ],
        )?;
        tx.commit()?;
        debug!(%admin_uuid, amount, id, "payment recorded");
        Ok(id)
    }

    /// Change an invoice addition's amount in place, adjusting
    /// `total_earned` by the delta. Payment allocation is not rewritten;
    /// paid status is re-derived on the next read. Returns the delta.
    pub fn edit_invoice(&self, id: i64, new_amount: i64) -> LedgerResult<i64> {
        if new_amount < 0 {
            return Err(LedgerError::NegativeAmount);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let row: Option<(String, i64)> = tx
            .query_row(
                "SELECT admin_uuid, amount FROM invoice_additions WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((admin_uuid, old_amount)) = row else {
            return Err(LedgerError::NotFound {
                entity: "invoice addition",
                id,
            });
        };

        let delta = new_amount - old_amount;
        tx.execute(
            "UPDATE invoice_additions SET amount = ?1 WHERE id = ?2",
            params![new_amount, id],
        )?;
        tx.execute(
            "UPDATE admin_accounts SET total_earned = total_earned + ?1 WHERE uuid = ?2",
            params![delta, admin_uuid],
        )?;
        tx.commit()?;
        debug!(id, old_amount, new_amount, "invoice addition edited");
        Ok(delta)
    }

    /// Delete an invoice addition, unwinding its FIFO payment allocation.
    ///
    /// The portion of the invoice already funded by payments is taken back
    /// from those payments oldest-first; a payment driven to zero is
    /// removed. Reductions are clamped to each payment's live amount, and
    /// any clamped remainder is reported as a partial reallocation instead
    /// of ever producing a negative payment.
    pub fn delete_invoice(&self, id: i64) -> LedgerResult<InvoiceDeletion> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let row: Option<(String, i64)> = tx
            .query_row(
                "SELECT admin_uuid, amount FROM invoice_additions WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((admin_text, amount)) = row else {
            return Err(LedgerError::NotFound {
                entity: "invoice addition",
                id,
            });
        };

        let invoices = invoices_fifo(&tx, &admin_text)?;
        let payments = payments_fifo(&tx, &admin_text)?;
        let fifo_amounts: Vec<(i64, i64)> = payments.iter().map(|p| (p.0, p.1)).collect();
        let planned = payment_reductions_for(&invoices, &fifo_amounts, id);

        tx.execute("DELETE FROM invoice_additions WHERE id = ?1", params![id])?;
        tx.execute(
            "UPDATE admin_accounts SET total_earned = total_earned - ?1 WHERE uuid = ?2",
            params![amount, admin_text],
        )?;

        let mut reductions = Vec::with_capacity(planned.len());
        let mut total_reduced = 0;
        let mut shortfall = 0;
        for (payment_id, planned_amount) in planned {
            let (live_amount, payment_date) = payments
                .iter()
                .find(|p| p.0 == payment_id)
                .map(|p| (p.1, p.2))
                .unwrap_or((0, NaiveDate::MIN));

            let applied = planned_amount.min(live_amount);
            shortfall += planned_amount - applied;
            if applied == 0 {
                continue;
            }

            let deleted = live_amount - applied <= 0;
            if deleted {
                tx.execute("DELETE FROM payments WHERE id = ?1", params![payment_id])?;
            } else {
                tx.execute(
                    "UPDATE payments SET amount = amount - ?1 WHERE id = ?2",
                    params![applied, payment_id],
                )?;
            }
            total_reduced += applied;
            reductions.push(PaymentReduction {
                payment_id,
                payment_date,
                amount: applied,
                deleted,
            });
        }

        if total_reduced > 0 {
            tx.execute(
                "UPDATE admin_accounts SET total_paid = total_paid - ?1 WHERE uuid = ?2",
                params![total_reduced, admin_text],
            )?;
        }
        tx.commit()?;

        if shortfall > 0 {
            warn!(id, shortfall, "partial payment reallocation while deleting invoice");
        }
        info!(id, amount, total_reduced, "invoice addition deleted");
        Ok(InvoiceDeletion {
            invoice_amount: amount,
            reductions,
            total_reduced,
            shortfall,
        })
    }

    /// Delete a payment and decrement `total_paid`. Invoice rows are left
    /// untouched; their paid status simply shifts on the next read.
    pub fn delete_payment(&self, id: i64) -> LedgerResult<i64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let row: Option<(String, i64)> = tx
            .query_row(
                "SELECT admin_uuid, amount FROM payments WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((admin_uuid, amount)) = row else {
            return Err(LedgerError::NotFound {
                entity: "payment",
                id,
            });
        };

        tx.execute("DELETE FROM payments WHERE id = ?1", params![id])?;
        tx.execute(
            "UPDATE admin_accounts SET total_paid = total_paid - ?1 WHERE uuid = ?2",
            params![amount, admin_uuid],
        )?;
        tx.commit()?;
        info!(id, amount, "payment deleted");
        Ok(amount)
    }

    /// Earned/paid totals for a root; zero for an unknown account.
    pub fn balance(&self, admin_uuid: Uuid) -> LedgerResult<BalanceSnapshot> {
        let conn = self.conn.lock();
        let snapshot = conn
            .query_row(
                "SELECT total_earned, total_paid FROM admin_accounts WHERE uuid = ?1",
                params![admin_uuid.to_string()],
                |row| {
                    Ok(BalanceSnapshot {
                        earned: row.get(0)?,
                        paid: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(snapshot.unwrap_or_default())
    }

    /// Persisted rate for a root, the pricing fallback.
    pub fn stored_price(&self, admin_uuid: Uuid) -> LedgerResult<Option<i64>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT price_per_gb FROM admin_accounts WHERE uuid = ?1",
                params![admin_uuid.to_string()],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// One account row.
    pub fn account(&self, admin_uuid: Uuid) -> LedgerResult<Option<AdminAccount>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                indoc! {"
                    SELECT uuid, name, telegram_id, panel_number, fa_number, price_per_gb,
                           total_earned, total_paid, last_payment_date, last_invoice_date, status
                    FROM admin_accounts WHERE uuid = ?1
                "},
                params![admin_uuid.to_string()],
                account_from_row,
            )
            .optional()?)
    }

    /// All account rows, by name.
    pub fn accounts(&self) -> LedgerResult<Vec<AdminAccount>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(indoc! {"
            SELECT uuid, name, telegram_id, panel_number, fa_number, price_per_gb,
                   total_earned, total_paid, last_payment_date, last_invoice_date, status
            FROM admin_accounts ORDER BY name
        "})?;
        let rows = stmt.query_map([], account_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Invoice additions newest-first, each with its derived paid status.
    pub fn invoice_history(
        &self,
        admin_uuid: Uuid,
        limit: Option<usize>,
    ) -> LedgerResult<Vec<InvoiceEntry>> {
        let conn = self.conn.lock();
        let admin_text = admin_uuid.to_string();

        let mut stmt = conn.prepare(indoc! {"
            SELECT id, admin_uuid, amount, addition_date, invoice_period_start, invoice_period_end
            FROM invoice_additions WHERE admin_uuid = ?1
            ORDER BY invoice_period_start ASC, addition_date ASC, id ASC
        "})?;
        let additions = stmt
            .query_map(params![admin_text], addition_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let total_payments = total_payments(&conn, &admin_text)?;
        let fifo: Vec<(i64, i64)> = additions.iter().map(|a| (a.id, a.amount)).collect();
        let paid = paid_invoice_ids(&fifo, total_payments);

        let mut entries: Vec<InvoiceEntry> = additions
            .into_iter()
            .map(|addition| InvoiceEntry {
                paid: paid.contains(&addition.id),
                addition,
            })
            .collect();
        entries.reverse();
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    /// Payments newest-first.
    pub fn payment_history(
        &self,
        admin_uuid: Uuid,
        limit: Option<usize>,
    ) -> LedgerResult<Vec<PaymentRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(indoc! {"
            SELECT id, admin_uuid, amount, payment_date
            FROM payments WHERE admin_uuid = ?1
            ORDER BY payment_date DESC, id DESC
            LIMIT ?2
        "})?;
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt.query_map(params![admin_uuid.to_string(), limit], |row| {
            Ok(PaymentRecord {
                id: row.get(0)?,
                admin_uuid: col_uuid(row, 1)?,
                amount: row.get(2)?,
                payment_date: col_date(row, 3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Write a per-admin usage audit row for a committed run. Skipped (and
    /// reported `false`) for admins without an account row: descendants
    /// are billed under their root, not tracked individually.
    pub fn record_usage_invoice(
        &self,
        admin_uuid: Uuid,
        invoice_date: NaiveDate,
        usage_gb: i64,
        amount: i64,
    ) -> LedgerResult<bool> {
        let conn = self.conn.lock();
        let admin_text = admin_uuid.to_string();
        let known: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM admin_accounts WHERE uuid = ?1",
                params![admin_text],
                |row| row.get(0),
            )
            .optional()?;
        if known.is_none() {
            return Ok(false);
        }
        conn.execute(
            indoc! {"
                INSERT INTO invoices (admin_uuid, invoice_date, usage_gb, amount, status)
                VALUES (?1, ?2, ?3, ?4, 'unpaid')
            "},
            params![
                admin_text,
                invoice_date.format(DATE_FMT).to_string(),
                usage_gb,
                amount
            ],
        )?;
        Ok(true)
    }

    /// Flip a usage audit row to paid.
    pub fn mark_usage_invoice_paid(&self, id: i64) -> LedgerResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE invoices SET status = 'paid' WHERE id = ?1",
            params![id],
        )?;
        if changed == 0 {
            return Err(LedgerError::NotFound {
                entity: "invoice",
                id,
            });
        }
        Ok(())
    }

    /// Usage audit rows newest-first.
    pub fn usage_invoice_history(
        &self,
        admin_uuid: Uuid,
        limit: Option<usize>,
    ) -> LedgerResult<Vec<UsageInvoice>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(indoc! {"
            SELECT id, admin_uuid, invoice_date, usage_gb, amount, status
            FROM invoices WHERE admin_uuid = ?1
            ORDER BY invoice_date DESC, id DESC
            LIMIT ?2
        "})?;
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt.query_map(params![admin_uuid.to_string(), limit], |row| {
            Ok(UsageInvoice {
                id: row.get(0)?,
                admin_uuid: col_uuid(row, 1)?,
                invoice_date: col_date(row, 2)?,
                usage_gb: row.get(3)?,
                amount: row.get(4)?,
                status: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Overview totals for the dashboard.
    pub fn dashboard_stats(&self, today: NaiveDate) -> LedgerResult<DashboardStats> {
        let conn = self.conn.lock();
        let (active_admins, total_earned, total_paid) = conn.query_row(
            indoc! {"
                SELECT
                    (SELECT COUNT(*) FROM admin_accounts WHERE status = 'active'),
                    COALESCE(SUM(total_earned), 0),
                    COALESCE(SUM(total_paid), 0)
                FROM admin_accounts
            "},
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let cutoff = today - Duration::days(30);
        let (recent_payment_count, recent_payment_amount) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(amount), 0) FROM payments WHERE payment_date >= ?1",
            params![cutoff.format(DATE_FMT).to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(DashboardStats {
            active_admins,
            total_earned,
            total_paid,
            total_balance: total_earned - total_paid,
            recent_payment_count,
            recent_payment_amount,
        })
    }
}

fn ensure_account(conn: &Connection, admin_uuid: Uuid) -> LedgerResult<()> {
    let known: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM admin_accounts WHERE uuid = ?1",
            params![admin_uuid.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    if known.is_none() {
        return Err(LedgerError::AdminNotFound(admin_uuid));
    }
    Ok(())
}

fn invoices_fifo(conn: &Connection, admin_text: &str) -> rusqlite::Result<Vec<(i64, i64)>> {
    let mut stmt = conn.prepare(indoc! {"
        SELECT id, amount FROM invoice_additions WHERE admin_uuid = ?1
        ORDER BY invoice_period_start ASC, addition_date ASC, id ASC
    "})?;
    let rows = stmt.query_map(params![admin_text], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

fn payments_fifo(
    conn: &Connection,
    admin_text: &str,
) -> rusqlite::Result<Vec<(i64, i64, NaiveDate)>> {
    let mut stmt = conn.prepare(indoc! {"
        SELECT id, amount, payment_date FROM payments WHERE admin_uuid = ?1
        ORDER BY payment_date ASC, id ASC
    "})?;
    let rows = stmt.query_map(params![admin_text], |row| {
        Ok((row.get(0)?, row.get(1)?, col_date(row, 2)?))
    })?;
    rows.collect()
}

fn total_payments(conn: &Connection, admin_text: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COALESCE(SUM(amount), 0) FROM payments WHERE admin_uuid = ?1",
        params![admin_text],
        |row| row.get(0),
    )
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<AdminAccount> {
    let status: String = row.get(10)?;
    Ok(AdminAccount {
        uuid: col_uuid(row, 0)?,
        name: row.get(1)?,
        telegram_id: row.get(2)?,
        panel_number: row.get(3)?,
        fa_number: row.get(4)?,
        price_per_gb: row.get(5)?,
        total_earned: row.get(6)?,
        total_paid: row.get(7)?,
        last_payment_date: col_date_opt(row, 8)?,
        last_invoice_date: col_date_opt(row, 9)?,
        status: AccountStatus::from_db(&status),
    })
}

fn addition_from_row(row: &Row<'_>) -> rusqlite::Result<InvoiceAddition> {
    Ok(InvoiceAddition {
        id: row.get(0)?,
        admin_uuid: col_uuid(row, 1)?,
        amount: row.get(2)?,
        addition_date: col_datetime(row, 3)?,
        period_start: col_date(row, 4)?,
        period_end: col_date(row, 5)?,
    })
}

fn col_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let text: String = row.get(idx)?;
    Uuid::parse_str(&text).map_err(|e| conversion_error(idx, e))
}

fn col_date(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let text: String = row.get(idx)?;
    NaiveDate::parse_from_str(&text, DATE_FMT).map_err(|e| conversion_error(idx, e))
}

fn col_date_opt(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| NaiveDate::parse_from_str(&t, DATE_FMT).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn col_datetime(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDateTime> {
    let text: String = row.get(idx)?;
    NaiveDateTime::parse_from_str(&text, DATETIME_FMT).map_err(|e| conversion_error(idx, e))
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    // Distinct period starts so FIFO order matches insertion order.
    fn period(index: i64) -> BillingWindow {
        let start = date(2024, 1, 1) + Duration::days(index * 30);
        BillingWindow {
            start,
            end: start + Duration::days(29),
        }
    }

    fn store_with_admin() -> (LedgerStore, Uuid) {
        let store = LedgerStore::open_in_memory().unwrap();
        let uuid = Uuid::new_v4();
        store
            .add_admin(uuid, "root", Some(1), Some(1), Some("F-1"), 1400)
            .unwrap();
        (store, uuid)
    }

    fn row_sums(store: &LedgerStore, uuid: Uuid) -> (i64, i64) {
        let conn = store.conn.lock();
        let earned: i64 = conn
            .query_row(
                "SELECT COALESCE(SUM(amount), 0) FROM invoice_additions WHERE admin_uuid = ?1",
                params![uuid.to_string()],
                |row| row.get(0),
            )
            .unwrap();
        let paid: i64 = conn
            .query_row(
                "SELECT COALESCE(SUM(amount), 0) FROM payments WHERE admin_uuid = ?1",
                params![uuid.to_string()],
                |row| row.get(0),
            )
            .unwrap();
        (earned, paid)
    }

    fn assert_totals_match_rows(store: &LedgerStore, uuid: Uuid) {
        let balance = store.balance(uuid).unwrap();
        let (earned, paid) = row_sums(store, uuid);
        assert_eq!(balance.earned, earned);
        assert_eq!(balance.paid, paid);
        for payment in store.payment_history(uuid, None).unwrap() {
            assert!(payment.amount > 0);
        }
    }

    #[test]
    fn test_add_invoice_and_payment_update_totals() {
        let (store, uuid) = store_with_admin();
        store.add_invoice(uuid, 5000, &period(0)).unwrap();
        store.add_payment(uuid, 1500, date(2024, 2, 1)).unwrap();

        let balance = store.balance(uuid).unwrap();
        assert_eq!(balance.earned, 5000);
        assert_eq!(balance.paid, 1500);
        assert_eq!(balance.carried(), 3500);
        assert_totals_match_rows(&store, uuid);

        let account = store.account(uuid).unwrap().unwrap();
        assert_eq!(account.last_payment_date, Some(date(2024, 2, 1)));
        assert!(account.last_invoice_date.is_some());
    }

    #[test]
    fn test_unknown_admin_balance_is_zero() {
        let store = LedgerStore::open_in_memory().unwrap();
        let balance = store.balance(Uuid::new_v4()).unwrap();
        assert_eq!(balance, BalanceSnapshot::default());
        assert_eq!(balance.carried(), 0);
    }

    #[test]
    fn test_writes_to_unknown_admin_rejected() {
        let store = LedgerStore::open_in_memory().unwrap();
        let uuid = Uuid::new_v4();
        assert!(matches!(
            store.add_invoice(uuid, 100, &period(0)),
            Err(LedgerError::AdminNotFound(_))
        ));
        assert!(matches!(
            store.add_payment(uuid, 100, date(2024, 1, 1)),
            Err(LedgerError::AdminNotFound(_))
        ));
    }

    #[test]
    fn test_negative_amounts_rejected() {
        let (store, uuid) = store_with_admin();
        assert!(matches!(
            store.add_invoice(uuid, -1, &period(0)),
            Err(LedgerError::NegativeAmount)
        ));
        assert!(matches!(
            store.add_payment(uuid, -1, date(2024, 1, 1)),
            Err(LedgerError::NegativeAmount)
        ));
        let id = store.add_invoice(uuid, 100, &period(0)).unwrap();
        assert!(matches!(
            store.edit_invoice(id, -5),
            Err(LedgerError::NegativeAmount)
        ));
    }

    #[test]
    fn test_paid_status_derived_fifo() {
        let (store, uuid) = store_with_admin();
        let first = store.add_invoice(uuid, 1000, &period(0)).unwrap();
        let second = store.add_invoice(uuid, 2000, &period(1)).unwrap();
        store.add_payment(uuid, 1000, date(2024, 3, 1)).unwrap();

        let history = store.invoice_history(uuid, None).unwrap();
        assert_eq!(history.len(), 2);
        // newest first
        assert_eq!(history[0].addition.id, second);
        assert!(!history[0].paid);
        assert_eq!(history[1].addition.id, first);
        assert!(history[1].paid);

        // a partially covered invoice stays unpaid
        store.add_payment(uuid, 500, date(2024, 3, 2)).unwrap();
        let history = store.invoice_history(uuid, None).unwrap();
        assert!(!history[0].paid);
    }

    #[test]
    fn test_invoice_history_limit() {
        let (store, uuid) = store_with_admin();
        for i in 0..5 {
            store.add_invoice(uuid, 100 * (i + 1), &period(i)).unwrap();
        }
        let history = store.invoice_history(uuid, Some(2)).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].addition.amount, 500);
        assert_eq!(history[1].addition.amount, 400);
    }

    #[test]
    fn test_delete_invoice_reallocates_payment() {
        // Invoices of 1000 and 2000, one payment of 2500. Deleting the
        // first invoice returns its 1000 to the payer: the payment shrinks
        // to 1500 and both running totals follow.
        let (store, uuid) = store_with_admin();
        let first = store.add_invoice(uuid, 1000, &period(0)).unwrap();
        store.add_invoice(uuid, 2000, &period(1)).unwrap();
        store.add_payment(uuid, 2500, date(2024, 3, 1)).unwrap();

        let deletion = store.delete_invoice(first).unwrap();
        assert_eq!(deletion.invoice_amount, 1000);
        assert_eq!(deletion.total_reduced, 1000);
        assert_eq!(deletion.shortfall, 0);
        assert_eq!(deletion.reductions.len(), 1);
        assert!(!deletion.reductions[0].deleted);

        let balance = store.balance(uuid).unwrap();
        assert_eq!(balance.earned, 2000);
        assert_eq!(balance.paid, 1500);
        let payments = store.payment_history(uuid, None).unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].amount, 1500);
        assert_totals_match_rows(&store, uuid);
    }

    #[test]
    fn test_delete_partially_funded_invoice() {
        let (store, uuid) = store_with_admin();
        store.add_invoice(uuid, 1000, &period(0)).unwrap();
        let second = store.add_invoice(uuid, 2000, &period(1)).unwrap();
        store.add_payment(uuid, 2500, date(2024, 3, 1)).unwrap();

        // the second invoice is funded for 1500 of its 2000
        let deletion = store.delete_invoice(second).unwrap();
        assert_eq!(deletion.total_reduced, 1500);
        assert_eq!(deletion.shortfall, 0);

        let balance = store.balance(uuid).unwrap();
        assert_eq!(balance.earned, 1000);
        assert_eq!(balance.paid, 1000);
        assert_totals_match_rows(&store, uuid);
    }

    #[test]
    fn test_delete_invoice_funded_by_multiple_payments() {
        let (store, uuid) = store_with_admin();
        let id = store.add_invoice(uuid, 1000, &period(0)).unwrap();
        store.add_payment(uuid, 400, date(2024, 2, 1)).unwrap();
        store.add_payment(uuid, 600, date(2024, 2, 2)).unwrap();

        let deletion = store.delete_invoice(id).unwrap();
        assert_eq!(deletion.total_reduced, 1000);
        assert_eq!(deletion.reductions.len(), 2);
        assert!(deletion.reductions.iter().all(|r| r.deleted));

        let balance = store.balance(uuid).unwrap();
        assert_eq!(balance.earned, 0);
        assert_eq!(balance.paid, 0);
        assert!(store.payment_history(uuid, None).unwrap().is_empty());
        assert_totals_match_rows(&store, uuid);
    }

    #[test]
    fn test_delete_unfunded_invoice_touches_no_payments() {
        let (store, uuid) = store_with_admin();
        store.add_invoice(uuid, 1000, &period(0)).unwrap();
        let second = store.add_invoice(uuid, 500, &period(1)).unwrap();
        store.add_payment(uuid, 800, date(2024, 3, 1)).unwrap();

        let deletion = store.delete_invoice(second).unwrap();
        assert!(deletion.reductions.is_empty());
        assert_eq!(deletion.total_reduced, 0);

        let balance = store.balance(uuid).unwrap();
        assert_eq!(balance.paid, 800);
        assert_totals_match_rows(&store, uuid);
    }

    #[test]
    fn test_edit_invoice_applies_delta() {
        let (store, uuid) = store_with_admin();
        let id = store.add_invoice(uuid, 1000, &period(0)).unwrap();
        let delta = store.edit_invoice(id, 1600).unwrap();
        assert_eq!(delta, 600);
        assert_eq!(store.balance(uuid).unwrap().earned, 1600);

        let delta = store.edit_invoice(id, 400).unwrap();
        assert_eq!(delta, -1200);
        assert_eq!(store.balance(uuid).unwrap().earned, 400);
        assert_totals_match_rows(&store, uuid);
    }

    #[test]
    fn test_delete_payment_shifts_paid_status() {
        let (store, uuid) = store_with_admin();
        store.add_invoice(uuid, 1000, &period(0)).unwrap();
        let payment = store.add_payment(uuid, 1000, date(2024, 2, 1)).unwrap();
        assert!(store.invoice_history(uuid, None).unwrap()[0].paid);

        let removed = store.delete_payment(payment).unwrap();
        assert_eq!(removed, 1000);
        assert!(!store.invoice_history(uuid, None).unwrap()[0].paid);
        assert_eq!(store.balance(uuid).unwrap().paid, 0);
        assert_totals_match_rows(&store, uuid);
    }

    #[test]
    fn test_missing_rows_are_not_found() {
        let (store, _) = store_with_admin();
        assert!(matches!(
            store.edit_invoice(99, 100),
            Err(LedgerError::NotFound { entity: "invoice addition", id: 99 })
        ));
        assert!(matches!(
            store.delete_invoice(99),
            Err(LedgerError::NotFound { .. })
        ));
        assert!(matches!(
            store.delete_payment(99),
            Err(LedgerError::NotFound { entity: "payment", id: 99 })
        ));
        assert!(matches!(
            store.mark_usage_invoice_paid(99),
            Err(LedgerError::NotFound { entity: "invoice", id: 99 })
        ));
    }

    #[test]
    fn test_usage_invoice_skipped_for_unknown_admin() {
        let (store, uuid) = store_with_admin();
        let stranger = Uuid::new_v4();
        assert!(!store
            .record_usage_invoice(stranger, date(2024, 1, 31), 10, 14000)
            .unwrap());
        assert!(store
            .record_usage_invoice(uuid, date(2024, 1, 31), 10, 14000)
            .unwrap());

        let history = store.usage_invoice_history(uuid, None).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, "unpaid");
        assert_eq!(history[0].usage_gb, 10);

        store.mark_usage_invoice_paid(history[0].id).unwrap();
        let history = store.usage_invoice_history(uuid, None).unwrap();
        assert_eq!(history[0].status, "paid");
    }

    #[test]
    fn test_dashboard_stats() {
        let (store, uuid) = store_with_admin();
        let other = Uuid::new_v4();
        store
            .add_admin(other, "other", None, None, None, 1400)
            .unwrap();
        store.deactivate(other).unwrap();

        store.add_invoice(uuid, 5000, &period(0)).unwrap();
        store.add_payment(uuid, 2000, date(2024, 2, 10)).unwrap();
        store.add_payment(uuid, 300, date(2023, 1, 1)).unwrap(); // outside the window

        let stats = store.dashboard_stats(date(2024, 2, 20)).unwrap();
        assert_eq!(stats.active_admins, 1);
        assert_eq!(stats.total_earned, 5000);
        assert_eq!(stats.total_paid, 2300);
        assert_eq!(stats.total_balance, 2700);
        assert_eq!(stats.recent_payment_count, 1);
        assert_eq!(stats.recent_payment_amount, 2000);
    }

    #[test]
    fn test_paid_invoice_ids_cumulative() {
        let invoices = vec![(1, 1000), (2, 2000), (3, 500)];
        assert_eq!(paid_invoice_ids(&invoices, 0), Vec::<i64>::new());
        assert_eq!(paid_invoice_ids(&invoices, 999), Vec::<i64>::new());
        assert_eq!(paid_invoice_ids(&invoices, 1000), vec![1]);
        assert_eq!(paid_invoice_ids(&invoices, 2999), vec![1]);
        assert_eq!(paid_invoice_ids(&invoices, 3000), vec![1, 2]);
        assert_eq!(paid_invoice_ids(&invoices, 9999), vec![1, 2, 3]);
    }

    #[test]
    fn test_payment_reductions_interval_overlap() {
        let invoices = vec![(1, 1000), (2, 2000)];
        let payments = vec![(10, 2500)];
        assert_eq!(payment_reductions_for(&invoices, &payments, 1), vec![(10, 1000)]);
        assert_eq!(payment_reductions_for(&invoices, &payments, 2), vec![(10, 1500)]);

        let split = vec![(10, 400), (11, 600), (12, 1500)];
        assert_eq!(
            payment_reductions_for(&invoices, &split, 2),
            vec![(12, 1500)]
        );
        assert_eq!(
            payment_reductions_for(&invoices, &split, 1),
            vec![(10, 400), (11, 600)]
        );

        // unknown invoice or no funding
        assert_eq!(payment_reductions_for(&invoices, &payments, 99), vec![]);
        assert_eq!(payment_reductions_for(&invoices, &[], 1), vec![]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Invoice(i64),
        Payment(i64),
        EditInvoice(usize, i64),
        DeleteInvoice(usize),
        DeletePayment(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0i64..10_000).prop_map(Op::Invoice),
            (0i64..10_000).prop_map(Op::Payment),
            (any::<usize>(), 0i64..10_000).prop_map(|(s, a)| Op::EditInvoice(s, a)),
            any::<usize>().prop_map(Op::DeleteInvoice),
            any::<usize>().prop_map(Op::DeletePayment),
        ]
    }

    fn pick(ids: &[i64], selector: usize) -> Option<i64> {
        if ids.is_empty() {
            None
        } else {
            Some(ids[selector % ids.len()])
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        // Running totals always equal the sum of live rows, no matter the
        // sequence of additions, edits, deletions, and reallocations.
        #[test]
        fn test_totals_always_track_live_rows(ops in proptest::collection::vec(op_strategy(), 1..40)) {
            let (store, uuid) = store_with_admin();
            for (i, op) in ops.into_iter().enumerate() {
                let day = date(2024, 1, 1) + Duration::days(i as i64);
                match op {
                    Op::Invoice(amount) => {
                        store.add_invoice(uuid, amount, &period(i as i64)).unwrap();
                    }
                    Op::Payment(amount) => {
                        if amount > 0 {
                            store.add_payment(uuid, amount, day).unwrap();
                        }
                    }
                    Op::EditInvoice(selector, amount) => {
                        let ids: Vec<i64> = store
                            .invoice_history(uuid, None)
                            .unwrap()
                            .iter()
                            .map(|e| e.addition.id)
                            .collect();
                        if let Some(id) = pick(&ids, selector) {
                            store.edit_invoice(id, amount).unwrap();
                        }
                    }
                    Op::DeleteInvoice(selector) => {
                        let ids: Vec<i64> = store
                            .invoice_history(uuid, None)
                            .unwrap()
                            .iter()
                            .map(|e| e.addition.id)
                            .collect();
                        if let Some(id) = pick(&ids, selector) {
                            store.delete_invoice(id).unwrap();
                        }
                    }
                    Op::DeletePayment(selector) => {
                        let ids: Vec<i64> = store
                            .payment_history(uuid, None)
                            .unwrap()
                            .iter()
                            .map(|p| p.id)
                            .collect();
                        if let Some(id) = pick(&ids, selector) {
                            store.delete_payment(id).unwrap();
                        }
                    }
                }
                assert_totals_match_rows(&store, uuid);
                prop_assert!(store.balance(uuid).unwrap().carried() >= 0);
            }
        }
    }
}
