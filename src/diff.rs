//! Partial Update Differ
//!
//! Computes the minimal add/modify/remove sets between desired and observed
//! attribute bags, and splits an update into independently issued
//! partitions.

use crate::remote::Attributes;
use crate::state::{ObservedState, ResourceDescriptor};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Modification {
    pub old: Value,
    pub new: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AttributeDiff {
    pub to_add: Attributes,
    pub to_remove: BTreeSet<String>,
    pub to_modify: BTreeMap<String, Modification>,
}

impl AttributeDiff {
    /// No add, remove or modify: the caller must not issue a write
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty() && self.to_modify.is_empty()
    }

    pub fn len(&self) -> usize {
        self.to_add.len() + self.to_remove.len() + self.to_modify.len()
    }

    pub fn touched_keys(&self) -> impl Iterator<Item = &String> {
        self.to_add
            .keys()
            .chain(self.to_remove.iter())
            .chain(self.to_modify.keys())
    }

    /// Result of applying this diff to `observed`
    pub fn apply(&self, observed: &Attributes) -> Attributes {
        let mut result = observed.clone();
        for key in &self.to_remove {
            result.remove(key);
        }
        for (key, change) in &self.to_modify {
            result.insert(key.clone(), change.new.clone());
        }
        for (key, value) in &self.to_add {
            result.insert(key.clone(), value.clone());
        }
        result
    }
}

/// Diff `desired` against `observed`, ignoring `unmanaged` keys entirely.
///
/// Values compare structurally, so key order inside nested objects does
/// not matter.
pub fn diff(
    desired: &Attributes,
    observed: &Attributes,
    unmanaged: &BTreeSet<String>,
) -> AttributeDiff {
    let mut result = AttributeDiff::default();

    for (key, want) in desired {
        if unmanaged.contains(key) {
            continue;
        }
        match observed.get(key) {
            None => {
                result.to_add.insert(key.clone(), want.clone());
            },
            Some(have) if have != want => {
                result.to_modify.insert(
                    key.clone(),
                    Modification {
                        old: have.clone(),
                        new: want.clone(),
                    },
                );
            },
            Some(_) => {},
        }
    }

    for key in observed.keys() {
        if !desired.contains_key(key) && !unmanaged.contains(key) {
            result.to_remove.insert(key.clone());
        }
    }

    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeGroup {
    Tags,
    Attributes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Remove,
    Add,
    Modify,
}

/// One independently issued sub-call of an update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Partition {
    pub group: AttributeGroup,
    pub change: ChangeKind,
}

impl Partition {
    pub const TAG_REMOVE: Partition = Partition::new(AttributeGroup::Tags, ChangeKind::Remove);
    pub const TAG_ADD: Partition = Partition::new(AttributeGroup::Tags, ChangeKind::Add);
    pub const TAG_MODIFY: Partition = Partition::new(AttributeGroup::Tags, ChangeKind::Modify);
    pub const ATTRIBUTE_REMOVE: Partition =
        Partition::new(AttributeGroup::Attributes, ChangeKind::Remove);
    pub const ATTRIBUTE_ADD: Partition =
        Partition::new(AttributeGroup::Attributes, ChangeKind::Add);
    pub const ATTRIBUTE_MODIFY: Partition =
        Partition::new(AttributeGroup::Attributes, ChangeKind::Modify);

    /// Issue order for an update
    pub const ORDER: [Partition; 6] = [
        Self::TAG_REMOVE,
        Self::TAG_ADD,
        Self::TAG_MODIFY,
        Self::ATTRIBUTE_REMOVE,
        Self::ATTRIBUTE_ADD,
        Self::ATTRIBUTE_MODIFY,
    ];

    pub const fn new(group: AttributeGroup, change: ChangeKind) -> Self {
        Self { group, change }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let group = match self.group {
            AttributeGroup::Tags => "tags",
            AttributeGroup::Attributes => "attributes",
        };
        let change = match self.change {
            ChangeKind::Remove => "remove",
            ChangeKind::Add => "add",
            ChangeKind::Modify => "modify",
        };
        write!(f, "{}.{}", group, change)
    }
}

/// Payload of one partition call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionChange {
    pub partition: Partition,
    /// Keys to write with their new values (add and modify partitions)
    pub set: Attributes,
    /// Keys to drop (remove partitions)
    pub unset: BTreeSet<String>,
}

impl PartitionChange {
    pub fn set(partition: Partition, values: Attributes) -> Self {
        Self {
            partition,
            set: values,
            unset: BTreeSet::new(),
        }
    }

    pub fn unset(partition: Partition, keys: BTreeSet<String>) -> Self {
        Self {
            partition,
            set: Attributes::new(),
            unset: keys,
        }
    }
}

/// Attribute and tag diffs for one update
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpdatePlan {
    pub attributes: AttributeDiff,
    pub tags: AttributeDiff,
}

impl UpdatePlan {
    pub fn between(desired: &ResourceDescriptor, observed: &ObservedState) -> Self {
        Self {
            attributes: diff(desired.attributes(), &observed.attributes, desired.unmanaged()),
            tags: diff(desired.tags(), &observed.tags, desired.unmanaged_tags()),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.attributes.is_empty() && self.tags.is_empty()
    }

    /// Attributes this plan would change that may only be set at creation
    pub fn create_only_violations(&self, create_only: &BTreeSet<String>) -> Vec<String> {
        self.attributes
            .touched_keys()
            .filter(|k| create_only.contains(*k))
            .cloned()
            .collect()
    }

    /// Non-empty partitions, in [`Partition::ORDER`]
    pub fn partitions(&self) -> Vec<PartitionChange> {
        Partition::ORDER
            .iter()
            .filter_map(|partition| {
                let diff = match partition.group {
                    AttributeGroup::Tags => &self.tags,
                    AttributeGroup::Attributes => &self.attributes,
                };
                let change = match partition.change {
                    ChangeKind::Remove if !diff.to_remove.is_empty() => {
                        PartitionChange::unset(*partition, diff.to_remove.clone())
                    },
                    ChangeKind::Add if !diff.to_add.is_empty() => {
                        PartitionChange::set(*partition, diff.to_add.clone())
                    },
                    ChangeKind::Modify if !diff.to_modify.is_empty() => PartitionChange::set(
                        *partition,
                        diff.to_modify
                            .iter()
                            .map(|(k, m)| (k.clone(), m.new.clone()))
                            .collect(),
                    ),
                    _ => return None,
                };
                Some(change)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(pairs: &[(&str, Value)]) -> Attributes {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn keys(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_unmanaged_key_is_left_alone() {
        let desired = attrs(&[("a", json!(1)), ("b", json!(2))]);
        let observed = attrs(&[("a", json!(1)), ("c", json!(3))]);
        let d = diff(&desired, &observed, &keys(&["c"]));

        assert_eq!(d.to_add, attrs(&[("b", json!(2))]));
        assert!(d.to_remove.is_empty());
        assert!(d.to_modify.is_empty());
    }

    #[test]
    fn test_modify_and_remove() {
        let desired = attrs(&[("a", json!("x"))]);
        let observed = attrs(&[("a", json!("y")), ("b", json!(true))]);
        let d = diff(&desired, &observed, &BTreeSet::new());

        assert_eq!(d.to_modify["a"].old, json!("y"));
        assert_eq!(d.to_modify["a"].new, json!("x"));
        assert_eq!(d.to_remove, keys(&["b"]));
        assert_eq!(d.apply(&observed), desired);
    }

    #[test]
    fn test_structural_equality() {
        let desired = attrs(&[("cfg", json!({"x": 1, "y": [1, 2]}))]);
        let observed = attrs(&[("cfg", json!({"y": [1, 2], "x": 1}))]);
        assert!(diff(&desired, &observed, &BTreeSet::new()).is_empty());
    }

    #[test]
    fn test_partitions_follow_issue_order() {
        let plan = UpdatePlan {
            attributes: diff(
                &attrs(&[("memory", json!(8))]),
                &attrs(&[("memory", json!(4))]),
                &BTreeSet::new(),
            ),
            tags: diff(
                &attrs(&[("env", json!("prod"))]),
                &attrs(&[("owner", json!("me"))]),
                &BTreeSet::new(),
            ),
        };
        let order: Vec<Partition> = plan.partitions().iter().map(|c| c.partition).collect();
        assert_eq!(
            order,
            vec![Partition::TAG_REMOVE, Partition::TAG_ADD, Partition::ATTRIBUTE_MODIFY]
        );
        assert_eq!(plan.partitions()[2].set["memory"], json!(8));
    }

    #[test]
    fn test_create_only_violations() {
        let plan = UpdatePlan {
            attributes: diff(
                &attrs(&[("zone", json!("b")), ("name", json!("n2"))]),
                &attrs(&[("zone", json!("a")), ("name", json!("n1"))]),
                &BTreeSet::new(),
            ),
            tags: AttributeDiff::default(),
        };
        assert_eq!(plan.create_only_violations(&keys(&["zone"])), vec!["zone"]);
    }

    #[test]
    fn test_partition_display() {
        assert_eq!(Partition::TAG_REMOVE.to_string(), "tags.remove");
        assert_eq!(Partition::ATTRIBUTE_MODIFY.to_string(), "attributes.modify");
    }
}
