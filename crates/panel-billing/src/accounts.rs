//! Account Registry
//!
//! Keeps the persisted `admin_accounts` table in step with the configured
//! price book and the names observed in panel snapshots. Removal is
//! conservative: an account with any financial history is deactivated, not
//! deleted, so its ledger rows stay auditable.

use rusqlite::{params, OptionalExtension};
use tracing::{debug, info};
use uuid::Uuid;

use crate::ledger::{LedgerError, LedgerResult, LedgerStore};
use crate::pricing::PriceBook;

/// What a registry sync changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Roots newly inserted from the book, with placeholder names
    pub added: Vec<Uuid>,
    /// Roots no longer in the book but kept for their financial history
    pub deactivated: Vec<Uuid>,
    /// Roots no longer in the book and deleted outright (no history)
    pub removed: Vec<Uuid>,
}

impl LedgerStore {
    /// Insert an account row for a billing root.
    pub fn add_admin(
        &self,
        uuid: Uuid,
        name: &str,
        telegram_id: Option<i64>,
        panel_number: Option<i64>,
        fa_number: Option<&str>,
        price_per_gb: i64,
    ) -> LedgerResult<()> {
        if price_per_gb < 0 {
            return Err(LedgerError::NegativeAmount);
        }
        let conn = self.conn.lock();
        conn.execute(
            indoc::indoc! {"
                INSERT INTO admin_accounts
                    (uuid, name, telegram_id, panel_number, fa_number, price_per_gb, status)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'active')
            "},
            params![
                uuid.to_string(),
                name,
                telegram_id,
                panel_number,
                fa_number,
                price_per_gb
            ],
        )?;
        debug!(%uuid, name, "admin account added");
        Ok(())
    }

    /// Update a root's persisted rate. Historical invoices are untouched.
    pub fn set_price(&self, uuid: Uuid, price_per_gb: i64) -> LedgerResult<()> {
        if price_per_gb < 0 {
            return Err(LedgerError::NegativeAmount);
        }
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE admin_accounts SET price_per_gb = ?1 WHERE uuid = ?2",
            params![price_per_gb, uuid.to_string()],
        )?;
        if changed == 0 {
            return Err(LedgerError::AdminNotFound(uuid));
        }
        Ok(())
    }

    /// Mark an account inactive without touching its ledger rows.
    pub fn deactivate(&self, uuid: Uuid) -> LedgerResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE admin_accounts SET status = 'inactive' WHERE uuid = ?1",
            params![uuid.to_string()],
        )?;
        if changed == 0 {
            return Err(LedgerError::AdminNotFound(uuid));
        }
        Ok(())
    }

    /// Reconcile the registry against the configured price book.
    ///
    /// Book entries without an account row are inserted with a placeholder
    /// name (`Admin_<uuid8>`) until a snapshot supplies the real one.
    /// Account rows absent from the book are deactivated when they carry
    /// any financial history and deleted otherwise.
    pub fn sync_with_price_book(&self, book: &PriceBook) -> LedgerResult<SyncOutcome> {
        let mut outcome = SyncOutcome::default();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        {
            let mut stmt =
                tx.prepare("SELECT uuid, total_earned, total_paid, status FROM admin_accounts")?;
            let existing = stmt
                .query_map([], |row| {
                    let text: String = row.get(0)?;
                    Ok((
                        text,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            for (text, earned, paid, status) in existing {
                let Ok(uuid) = Uuid::parse_str(&text) else {
                    continue;
                };
                if book.contains(&uuid) {
                    continue;
                }
                let has_rows: Option<i64> = tx
                    .query_row(
                        indoc::indoc! {"
                            SELECT 1 WHERE EXISTS (SELECT 1 FROM payments WHERE admin_uuid = ?1)
                                OR EXISTS (SELECT 1 FROM invoice_additions WHERE admin_uuid = ?1)
                        "},
                        params![text],
                        |row| row.get(0),
                    )
                    .optional()?;
                if earned != 0 || paid != 0 || has_rows.is_some() {
                    if status != "inactive" {
                        tx.execute(
                            "UPDATE admin_accounts SET status = 'inactive' WHERE uuid = ?1",
                            params![text],
                        )?;
                        outcome.deactivated.push(uuid);
                    }
                } else {
                    tx.execute("DELETE FROM admin_accounts WHERE uuid = ?1", params![text])?;
                    outcome.removed.push(uuid);
                }
            }

            for (uuid, entry) in book.iter() {
                let known: Option<i64> = tx
                    .query_row(
                        "SELECT 1 FROM admin_accounts WHERE uuid = ?1",
                        params![uuid.to_string()],
                        |row| row.get(0),
                    )
                    .optional()?;
                if known.is_some() {
                    tx.execute(
                        indoc::indoc! {"
                            UPDATE admin_accounts
                            SET telegram_id = ?1, fa_number = ?2, price_per_gb = ?3, status = 'active'
                            WHERE uuid = ?4
                        "},
                        params![
                            entry.telegram_id,
                            entry.fa_number,
                            entry.price_per_gb,
                            uuid.to_string()
                        ],
                    )?;
                } else {
                    let placeholder = placeholder_name(uuid);
                    tx.execute(
                        indoc::indoc! {"
                            INSERT INTO admin_accounts
                                (uuid, name, telegram_id, fa_number, price_per_gb, status)
                            VALUES (?1, ?2, ?3, ?4, ?5, 'active')
                        "},
                        params![
                            uuid.to_string(),
                            placeholder,
                            entry.telegram_id,
                            entry.fa_number,
                            entry.price_per_gb
                        ],
                    )?;
                    outcome.added.push(*uuid);
                }
            }
        }

        tx.commit()?;
        info!(
            added = outcome.added.len(),
            deactivated = outcome.deactivated.len(),
            removed = outcome.removed.len(),
            "account registry synced"
        );
        Ok(outcome)
    }

    /// Replace placeholder names with real ones observed in snapshots.
    /// Only placeholder rows are touched; operator renames are preserved.
    pub fn refresh_names<'a, I>(&self, observed: I) -> LedgerResult<usize>
    where
        I: IntoIterator<Item = (Uuid, &'a str)>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut updated = 0;
        for (uuid, name) in observed {
            updated += tx.execute(
                "UPDATE admin_accounts SET name = ?1 WHERE uuid = ?2 AND name LIKE 'Admin\\_%' ESCAPE '\\'",
                params![name, uuid.to_string()],
            )?;
        }
        tx.commit()?;
        if updated > 0 {
            debug!(updated, "placeholder names refreshed from snapshots");
        }
        Ok(updated)
    }

    /// Stamp the panel a root was last observed on.
    pub fn set_panel_number(&self, uuid: Uuid, panel_number: i64) -> LedgerResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE admin_accounts SET panel_number = ?1 WHERE uuid = ?2",
            params![panel_number, uuid.to_string()],
        )?;
        if changed == 0 {
            return Err(LedgerError::AdminNotFound(uuid));
        }
        Ok(())
    }
}

fn placeholder_name(uuid: &Uuid) -> String {
    let text = uuid.to_string();
    format!("Admin_{}", &text[..8])
}
