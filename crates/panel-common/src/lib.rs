//! Panel Billing Common - Shared types for the panel billing core
//!
//! This crate provides the parsed snapshot data model and the admin
//! hierarchy resolver shared by every billing component:
//! - Snapshot records (admins, end-user accounts) as exported by the panels
//! - Lenient date parsing for the export formats in the wild
//! - Parent-link tree reconstruction with cycle protection

#![warn(missing_docs)]

pub mod error;
pub mod hierarchy;
pub mod snapshot;

pub use error::{SnapshotError, SnapshotResult};
pub use hierarchy::{billable_roots, resolve_descendants};
pub use snapshot::{AdminRecord, EndUserAccount, PanelSnapshot};
