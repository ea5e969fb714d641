//! Desired and observed state

use crate::remote::{Attributes, RemoteObject, Scope};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;

/// Tag keys maintained by the provider itself
pub const DEFAULT_UNMANAGED_TAGS: &[&str] = &["project"];

/// Desired state of one remote object for a single reconciliation
#[derive(Debug, Clone)]
pub struct ResourceDescriptor {
    kind: String,
    scope: Scope,
    attributes: Attributes,
    tags: Attributes,
    create_only: BTreeSet<String>,
    unmanaged: BTreeSet<String>,
    unmanaged_tags: BTreeSet<String>,
    references: Vec<Reference>,
}

impl ResourceDescriptor {
    pub fn new(kind: &str, scope: Scope) -> Self {
        Self {
            kind: kind.to_string(),
            scope,
            attributes: Attributes::new(),
            tags: Attributes::new(),
            create_only: BTreeSet::new(),
            unmanaged: BTreeSet::new(),
            unmanaged_tags: DEFAULT_UNMANAGED_TAGS.iter().map(|s| s.to_string()).collect(),
            references: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: Value) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes.extend(attributes);
        self
    }

    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), Value::String(value.to_string()));
        self
    }

    /// Attributes that can only be set when the object is created
    pub fn with_create_only<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.create_only.extend(names.into_iter().map(Into::into));
        self
    }

    /// Attributes owned by the provider or another authority
    pub fn with_unmanaged<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unmanaged.extend(names.into_iter().map(Into::into));
        self
    }

    /// Replace the unmanaged tag keys (defaults to [`DEFAULT_UNMANAGED_TAGS`])
    pub fn with_unmanaged_tags<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unmanaged_tags = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_reference(mut self, reference: Reference) -> Self {
        self.references.push(reference);
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn tags(&self) -> &Attributes {
        &self.tags
    }

    /// Desired tags minus unmanaged keys
    pub fn managed_tags(&self) -> Attributes {
        self.tags
            .iter()
            .filter(|(k, _)| !self.unmanaged_tags.contains(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn create_only(&self) -> &BTreeSet<String> {
        &self.create_only
    }

    pub fn unmanaged(&self) -> &BTreeSet<String> {
        &self.unmanaged
    }

    pub fn unmanaged_tags(&self) -> &BTreeSet<String> {
        &self.unmanaged_tags
    }

    pub fn references(&self) -> &[Reference] {
        &self.references
    }
}

/// An object in a possibly different scope whose attributes feed creation
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub kind: String,
    pub scope: Scope,
    pub identity: String,
    pub arity: usize,
    /// (attribute on the referenced object, attribute in the create payload)
    pub imports: Vec<(String, String)>,
}

impl Reference {
    pub fn new(kind: &str, scope: Scope, identity: &str, arity: usize) -> Self {
        Self {
            kind: kind.to_string(),
            scope,
            identity: identity.to_string(),
            arity,
            imports: Vec::new(),
        }
    }

    pub fn import(mut self, from: &str, to: &str) -> Self {
        self.imports.push((from.to_string(), to.to_string()));
        self
    }
}

/// State decoded from the remote side; rebuilt on every read
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservedState {
    pub identity: String,
    pub attributes: Attributes,
    pub tags: Attributes,
    pub observed_at: DateTime<Utc>,
}

impl ObservedState {
    pub fn from_remote(identity: &str, object: RemoteObject) -> Self {
        Self {
            identity: identity.to_string(),
            attributes: object.attributes,
            tags: object.tags,
            observed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_project_tag_is_unmanaged_by_default() {
        let desired = ResourceDescriptor::new("mongodb_instance", Scope::region("ap-guangzhou"))
            .with_tag("env", "prod")
            .with_tag("project", "default");
        let managed = desired.managed_tags();
        assert_eq!(managed.len(), 1);
        assert_eq!(managed["env"], json!("prod"));
    }

    #[test]
    fn test_unmanaged_tags_override() {
        let desired = ResourceDescriptor::new("k", Scope::region("r"))
            .with_tag("project", "p")
            .with_unmanaged_tags(Vec::<String>::new());
        assert_eq!(desired.managed_tags().len(), 1);
    }
}
