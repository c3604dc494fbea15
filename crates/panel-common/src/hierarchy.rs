//! Admin hierarchy reconstruction
//!
//! Panels export admins as a flat list with a `parent_admin_uuid`
//! back-reference. Billing needs the opposite view: for a chosen root, the
//! complete set of admins it is responsible for. The resolver builds an
//! adjacency index once per call and walks it iteratively with a visited
//! set, so malformed input (duplicate parent edges, cycles) cannot loop or
//! double-count an admin.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::snapshot::AdminRecord;

/// Resolve the root and all of its transitive descendants.
///
/// The result always begins with `root` itself, followed by descendants in
/// pre-order over the original list sequence (deterministic, not
/// billing-significant). An admin is visited at most once; a root that does
/// not appear in `all_admins` degenerates to a singleton result.
pub fn resolve_descendants(root: &AdminRecord, all_admins: &[AdminRecord]) -> Vec<AdminRecord> {
    let mut children: HashMap<Uuid, Vec<&AdminRecord>> = HashMap::new();
    for admin in all_admins {
        if let Some(parent) = admin.parent_admin_uuid {
            children.entry(parent).or_default().push(admin);
        }
    }

    let mut visited: HashSet<Uuid> = HashSet::new();
    visited.insert(root.uuid);

    let mut result = Vec::new();
    let mut stack: Vec<&AdminRecord> = vec![root];
    while let Some(node) = stack.pop() {
        result.push(node.clone());
        if let Some(kids) = children.get(&node.uuid) {
            // Reverse push keeps the pre-order aligned with list order.
            for kid in kids.iter().rev() {
                if visited.insert(kid.uuid) {
                    stack.push(kid);
                }
            }
        }
    }
    result
}

/// Billing roots of one snapshot's admin list, in list order.
pub fn billable_roots(admins: &[AdminRecord]) -> Vec<&AdminRecord> {
    admins.iter().filter(|a| a.is_billable_root()).collect()
}
