//! Parsed panel export snapshots
//!
//! Each panel instance periodically exports a JSON document with the flat
//! list of admin accounts it knows about and the end-user accounts those
//! admins provisioned. Snapshots are point-in-time inputs: they are parsed,
//! consumed by one aggregation pass and discarded. Only derived ledger
//! effects persist.
//!
//! Parsing is deliberately lenient. A record with an unparseable or absent
//! `start_date` stays in the list with `start_date == None` and is simply
//! excluded from aggregation; a single bad record must never abort billing
//! for everyone else.

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::SnapshotResult;

/// Admin name reserved for the panel owner, never billable.
pub const OWNER_NAME: &str = "Owner";

/// Comment sentinel marking an admin as not independently billable.
pub const NON_BILLABLE_COMMENT: &str = "-";

/// Quota sentinel marking a free/trial account, excluded from billing.
pub const FREE_TIER_QUOTA_GB: i64 = 1;

/// One entry in a panel's flat admin list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminRecord {
    /// Stable identifier, unique within one panel snapshot
    pub uuid: Uuid,
    /// Display name
    pub name: String,
    /// Back-reference to the provisioning admin; `None` for roots
    #[serde(default)]
    pub parent_admin_uuid: Option<Uuid>,
    /// Free-form marker field; `"-"` means "not independently billable"
    #[serde(default)]
    pub comment: Option<String>,
    /// Which panel snapshot this record came from (stamped at load time)
    #[serde(default)]
    pub panel_number: u32,
}

impl AdminRecord {
    /// Whether this admin is a billing root: not the panel owner and not
    /// marked with the non-billable comment sentinel.
    pub fn is_billable_root(&self) -> bool {
        self.name != OWNER_NAME && self.comment.as_deref() != Some(NON_BILLABLE_COMMENT)
    }
}

/// Usage-bearing end-user account provisioned by an admin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndUserAccount {
    /// Stable identifier
    pub uuid: Uuid,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// The admin that provisioned this account
    #[serde(default)]
    pub added_by_uuid: Option<Uuid>,
    /// Provisioning date; `None` when absent or unparseable
    #[serde(default, deserialize_with = "de_lenient_date")]
    pub start_date: Option<NaiveDate>,
    /// Usage quota in GB, the billable-usage proxy
    #[serde(
        default,
        rename = "usage_limit_GB",
        deserialize_with = "de_lenient_quota"
    )]
    pub usage_limit_gb: i64,
}

impl EndUserAccount {
    /// Whether this account carries the free-tier quota sentinel.
    pub fn is_free_tier(&self) -> bool {
        self.usage_limit_gb == FREE_TIER_QUOTA_GB
    }
}

/// A parsed panel export: one flat admin list plus the end-user accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelSnapshot {
    /// Ordinal of the panel this snapshot was exported from
    pub panel_number: u32,
    /// Flat admin list
    pub admin_users: Vec<AdminRecord>,
    /// End-user accounts across all admins of this panel
    pub users: Vec<EndUserAccount>,
}

impl PanelSnapshot {
    /// Parse an exported JSON document, stamping each admin with the panel
    /// ordinal. Missing `admin_users`/`users` arrays parse as empty.
    pub fn parse(panel_number: u32, json: &str) -> SnapshotResult<Self> {
        #[derive(Deserialize)]
        struct RawExport {
            #[serde(default)]
            admin_users: Vec<AdminRecord>,
            #[serde(default)]
            users: Vec<EndUserAccount>,
        }

        let raw: RawExport = serde_json::from_str(json)?;
        let mut admin_users = raw.admin_users;
        for admin in &mut admin_users {
            admin.panel_number = panel_number;
        }
        tracing::debug!(
            panel_number,
            admins = admin_users.len(),
            users = raw.users.len(),
            "parsed panel snapshot"
        );
        Ok(Self {
            panel_number,
            admin_users,
            users: raw.users,
        })
    }
}

/// Parse a date in any of the export formats seen in the wild.
///
/// Returns `None` for anything unparseable rather than failing the record.
pub fn parse_export_date(text: &str) -> Option<NaiveDate> {
    const FORMATS: [&str; 3] = ["%Y-%m-%d", "%Y %m %d", "%Y/%m/%d"];
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text.trim(), fmt).ok())
}

fn de_lenient_date<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_export_date))
}

fn de_lenient_quota<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    // Some panels export quotas as floats; quotas are whole GB for billing.
    let raw = Option::<f64>::deserialize(deserializer)?;
    Ok(raw.map(|v| v.max(0.0) as i64).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_export_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        assert_eq!(parse_export_date("2024-03-05"), Some(expected));
        assert_eq!(parse_export_date("2024 03 05"), Some(expected));
        assert_eq!(parse_export_date("2024/03/05"), Some(expected));
        assert_eq!(parse_export_date("2024 3 5"), Some(expected));

        assert_eq!(parse_export_date("not a date"), None);
        assert_eq!(parse_export_date(""), None);
    }

    #[test]
    fn test_parse_snapshot_lenient() {
        let json = r#"{
            "admin_users": [
                {"uuid": "2c162d33-1111-4a83-a2a8-94e0a7a0f0c1", "name": "Owner", "comment": null},
                {"uuid": "2c162d33-2222-4a83-a2a8-94e0a7a0f0c1", "name": "reseller",
                 "parent_admin_uuid": "2c162d33-1111-4a83-a2a8-94e0a7a0f0c1", "comment": "2024-01-01"}
            ],
            "users": [
                {"uuid": "2c162d33-3333-4a83-a2a8-94e0a7a0f0c1", "name": "u1",
                 "added_by_uuid": "2c162d33-2222-4a83-a2a8-94e0a7a0f0c1",
                 "start_date": "2024-02-10", "usage_limit_GB": 30.0},
                {"uuid": "2c162d33-4444-4a83-a2a8-94e0a7a0f0c1", "name": "u2",
                 "start_date": "garbage"}
            ]
        }"#;

        let snapshot = PanelSnapshot::parse(3, json).unwrap();
        assert_eq!(snapshot.panel_number, 3);
        assert_eq!(snapshot.admin_users.len(), 2);
        assert!(snapshot.admin_users.iter().all(|a| a.panel_number == 3));

        let u1 = &snapshot.users[0];
        assert_eq!(u1.usage_limit_gb, 30);
        assert_eq!(u1.start_date, Some(NaiveDate::from_ymd_opt(2024, 2, 10).unwrap()));

        // Unparseable date and missing fields degrade, not fail
        let u2 = &snapshot.users[1];
        assert_eq!(u2.start_date, None);
        assert_eq!(u2.added_by_uuid, None);
        assert_eq!(u2.usage_limit_gb, 0);
    }

    #[test]
    fn test_parse_snapshot_missing_sections() {
        let snapshot = PanelSnapshot::parse(1, "{}").unwrap();
        assert!(snapshot.admin_users.is_empty());
        assert!(snapshot.users.is_empty());

        assert!(PanelSnapshot::parse(1, "not json").is_err());
    }

    #[test]
    fn test_billable_root_predicate() {
        let mut admin = AdminRecord {
            uuid: Uuid::new_v4(),
            name: "reseller".into(),
            parent_admin_uuid: None,
            comment: Some("2024-01-01".into()),
            panel_number: 1,
        };
        assert!(admin.is_billable_root());

        admin.comment = Some(NON_BILLABLE_COMMENT.into());
        assert!(!admin.is_billable_root());

        admin.comment = None;
        assert!(admin.is_billable_root());

        admin.name = OWNER_NAME.into();
        assert!(!admin.is_billable_root());
    }

    #[test]
    fn test_free_tier_sentinel() {
        let mut user = EndUserAccount {
            uuid: Uuid::new_v4(),
            name: "u".into(),
            added_by_uuid: None,
            start_date: None,
            usage_limit_gb: FREE_TIER_QUOTA_GB,
        };
        assert!(user.is_free_tier());
        user.usage_limit_gb = 2;
        assert!(!user.is_free_tier());
    }
}
