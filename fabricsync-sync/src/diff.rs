//! Unified diff of desired vs actual spec, for `fabricsync drift --diff`.

use serde_json::Value;
use similar::TextDiff;

use fabricsync_core::types::{FabricName, Resource};

use crate::store::{ResourceFilter, ResourceStore};
use crate::SyncError;

/// A single resource diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDiff {
    pub key: String,
    pub unified_diff: String,
}

/// Diff result for a fabric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabricDiff {
    pub fabric: FabricName,
    pub diffs: Vec<ResourceDiff>,
}

/// Compare each resource's desired spec (`a/`) to its actual spec (`b/`).
///
/// Resources whose sides render identically are omitted. A missing side
/// renders as empty.
pub fn diff_fabric(store: &ResourceStore, fabric: &FabricName) -> Result<FabricDiff, SyncError> {
    let mut diffs = Vec::new();
    for r in store.list_by_fabric(fabric, &ResourceFilter::default()) {
        if let Some(diff) = diff_resource(&r)? {
            diffs.push(diff);
        }
    }
    Ok(FabricDiff {
        fabric: fabric.clone(),
        diffs,
    })
}

pub fn diff_resource(r: &Resource) -> Result<Option<ResourceDiff>, SyncError> {
    let desired = render(r.desired_spec.as_ref())?;
    let actual = render(r.actual_spec.as_ref())?;
    if desired == actual {
        return Ok(None);
    }

    let path = format!("{}/{}/{}", r.namespace, r.kind, r.name);
    let old_header = format!("a/{path}");
    let new_header = format!("b/{path}");
    let unified = TextDiff::from_lines(&desired, &actual)
        .unified_diff()
        .header(&old_header, &new_header)
        .context_radius(3)
        .to_string();

    Ok(Some(ResourceDiff {
        key: r.key().to_string(),
        unified_diff: unified,
    }))
}

fn render(spec: Option<&Value>) -> Result<String, SyncError> {
    match spec {
        Some(value) => Ok(serde_yaml::to_string(value)?),
        None => Ok(String::new()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use fabricsync_core::types::ResourceKey;

    use crate::store::{ActualState, DesiredState};

    use super::*;

    fn key(name: &str) -> ResourceKey {
        ResourceKey::new("dc1", "default", "VPC", name)
    }

    #[test]
    fn in_sync_resources_have_no_diff() {
        let store = ResourceStore::default();
        store
            .upsert_desired(&key("a"), DesiredState::new(json!({"mtu": 9000})))
            .expect("desired");
        store
            .upsert_actual(&key("a"), ActualState::new(json!({"mtu": 9000})))
            .expect("actual");

        let diff = diff_fabric(&store, &FabricName::from("dc1")).expect("diff");
        assert!(diff.diffs.is_empty());
    }

    #[test]
    fn drifted_field_produces_unified_diff() {
        let store = ResourceStore::default();
        store
            .upsert_desired(&key("a"), DesiredState::new(json!({"mtu": 9000, "vlan": 10})))
            .expect("desired");
        store
            .upsert_actual(&key("a"), ActualState::new(json!({"mtu": 1500, "vlan": 10})))
            .expect("actual");

        let diff = diff_fabric(&store, &FabricName::from("dc1")).expect("diff");
        let only = &diff.diffs[0];
        assert!(only.unified_diff.contains("--- a/default/VPC/a"));
        assert!(only.unified_diff.contains("+++ b/default/VPC/a"));
        assert!(only.unified_diff.contains("-mtu: 9000"));
        assert!(only.unified_diff.contains("+mtu: 1500"));
    }

    #[test]
    fn missing_side_renders_empty() {
        let store = ResourceStore::default();
        store
            .upsert_desired(&key("new"), DesiredState::new(json!({"mtu": 9000})))
            .expect("desired");
        let diff = diff_fabric(&store, &FabricName::from("dc1")).expect("diff");
        assert!(diff.diffs[0].unified_diff.contains("-mtu: 9000"));
    }
}
