//! Composite identities
//!
//! Remote objects without a single natural key are stored under an
//! ordered list of components joined by [`SEPARATOR`]. Identities are not
//! self-describing: decoding always needs the arity of the resource kind.

use crate::error::{ReconcileError, Result};
use crate::remote::{Attributes, Scope};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

pub const SEPARATOR: char = '#';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("identity {id:?} has {found} component(s), expected {expected}")]
    Arity {
        id: String,
        expected: usize,
        found: usize,
    },
}

/// Join components into the stored identity string.
///
/// Fails fast if a component contains the separator; such an identity could
/// not be decoded back.
pub fn encode<S: AsRef<str>>(components: &[S]) -> Result<String> {
    if components.is_empty() {
        return Err(ReconcileError::invalid_input(
            "encode identity",
            "an identity needs at least one component",
        ));
    }
    let mut encoded = String::new();
    for (i, component) in components.iter().enumerate() {
        let component = component.as_ref();
        if component.contains(SEPARATOR) {
            return Err(ReconcileError::InvalidComponent {
                component: component.to_string(),
                separator: SEPARATOR,
            });
        }
        if i > 0 {
            encoded.push(SEPARATOR);
        }
        encoded.push_str(component);
    }
    Ok(encoded)
}

/// Split a stored identity, checking it has exactly `expected_arity` parts
pub fn decode(id: &str, expected_arity: usize) -> std::result::Result<Vec<String>, DecodeError> {
    let parts: Vec<String> = id.split(SEPARATOR).map(str::to_string).collect();
    if parts.len() != expected_arity {
        return Err(DecodeError::Arity {
            id: id.to_string(),
            expected: expected_arity,
            found: parts.len(),
        });
    }
    Ok(parts)
}

/// Validated multi-part identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompositeIdentity {
    components: Vec<String>,
    encoded: String,
}

impl CompositeIdentity {
    pub fn new<S: AsRef<str>>(components: &[S]) -> Result<Self> {
        let encoded = encode(components)?;
        Ok(Self {
            components: components.iter().map(|c| c.as_ref().to_string()).collect(),
            encoded,
        })
    }

    pub fn decode(id: &str, expected_arity: usize) -> std::result::Result<Self, DecodeError> {
        let components = decode(id, expected_arity)?;
        Ok(Self {
            components,
            encoded: id.to_string(),
        })
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    pub fn arity(&self) -> usize {
        self.components.len()
    }

    pub fn as_str(&self) -> &str {
        &self.encoded
    }
}

impl fmt::Display for CompositeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

/// Where one identity component comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "from", content = "name", rename_all = "snake_case")]
pub enum IdentityPart {
    /// An attribute of the desired state (e.g. the parent id)
    Desired(String),
    /// An attribute returned by the creation call (e.g. the generated id)
    Created(String),
    Region,
    Account,
}

/// Build the identity of a freshly created object from its derivation rules
pub fn derive(
    parts: &[IdentityPart],
    desired: &Attributes,
    created: &Attributes,
    scope: &Scope,
) -> Result<CompositeIdentity> {
    const OP: &str = "derive identity";

    let mut components = Vec::with_capacity(parts.len());
    for part in parts {
        let component = match part {
            IdentityPart::Desired(name) => {
                component_value(desired.get(name)).ok_or_else(|| {
                    let reason = format!("desired attribute `{}` is missing or not scalar", name);
                    ReconcileError::invalid_input(OP, reason)
                })?
            },
            IdentityPart::Created(name) => {
                component_value(created.get(name)).ok_or_else(|| {
                    let reason = format!("created object has no scalar `{}`", name);
                    ReconcileError::invalid_input(OP, reason)
                })?
            },
            IdentityPart::Region => scope.region.clone(),
            IdentityPart::Account => scope.account.clone().ok_or_else(|| {
                ReconcileError::invalid_input(OP, format!("scope {} has no account", scope))
            })?,
        };
        components.push(component);
    }
    CompositeIdentity::new(&components)
}

fn component_value(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Six-segment resource name used by tag endpoints:
/// `qcs::<service>:<region>:uin/:<resource_type>/<id>`
pub fn qualified_name(service: &str, region: &str, resource_type: &str, id: &str) -> String {
    format!("qcs::{}:{}:uin/:{}/{}", service, region, resource_type, id)
}
