//! Type definitions for the tag-field to inventory-field mapping.
//!
//! Rules are deserialized from TOML as loose [`RuleConfig`] entries, then
//! compiled into [`MappingRule`]s whose expressions are checked against the
//! canonical field vocabulary.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// =============================================================================
// CONFIGURATION TYPES (loaded from TOML)
// =============================================================================

/// The `[mapping]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MappingConfig {
    /// Rules in application order
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// One `[[mapping.rules]]` entry. Exactly one of `field`, `template` or
/// `value` must be set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleConfig {
    /// Destination, e.g. `filament.name` or `spool.extra.lot`
    pub target: String,
    /// Copy a decoded tag field verbatim
    #[serde(default)]
    pub field: Option<String>,
    /// String pattern with `{field}` placeholders
    #[serde(default)]
    pub template: Option<String>,
    /// Constant value
    #[serde(default)]
    pub value: Option<Value>,
}

// =============================================================================
// COMPILED TYPES
// =============================================================================

/// Inventory entity a rule writes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Entity {
    Vendor,
    Filament,
    Spool,
}

impl Entity {
    pub fn parse(name: &str) -> Option<Entity> {
        match name {
            "vendor" => Some(Entity::Vendor),
            "filament" => Some(Entity::Filament),
            "spool" => Some(Entity::Spool),
            _ => None,
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Vendor => f.write_str("vendor"),
            Entity::Filament => f.write_str("filament"),
            Entity::Spool => f.write_str("spool"),
        }
    }
}

/// Destination field: entity plus a (possibly nested) key path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub entity: Entity,
    pub path: Vec<String>,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.entity, self.path.join("."))
    }
}

/// Closed expression language evaluated against decoded tag fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Value of a decoded field; writes nothing when the field is absent.
    Field(String),
    /// String concatenation; absent fields render as "".
    Concat(Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappingRule {
    pub target: Target,
    pub expr: Expr,
}

// =============================================================================
// OUTPUT TYPES
// =============================================================================

/// Inventory fields produced by the resolver, one JSON object per entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MappedFields {
    pub vendor: Map<String, Value>,
    pub filament: Map<String, Value>,
    pub spool: Map<String, Value>,
}

impl MappedFields {
    pub fn entity(&self, entity: Entity) -> &Map<String, Value> {
        match entity {
            Entity::Vendor => &self.vendor,
            Entity::Filament => &self.filament,
            Entity::Spool => &self.spool,
        }
    }

    pub fn entity_mut(&mut self, entity: Entity) -> &mut Map<String, Value> {
        match entity {
            Entity::Vendor => &mut self.vendor,
            Entity::Filament => &mut self.filament,
            Entity::Spool => &mut self.spool,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.vendor.is_empty() && self.filament.is_empty() && self.spool.is_empty()
    }

    /// Write `value` at `target`, creating intermediate objects. A
    /// non-object in the way is replaced.
    pub fn set(&mut self, target: &Target, value: Value) {
        let Some((last, parents)) = target.path.split_last() else {
            return;
        };
        let mut map = self.entity_mut(target.entity);
        for key in parents {
            let slot = map
                .entry(key.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            map = match slot {
                Value::Object(inner) => inner,
                _ => return,
            };
        }
        map.insert(last.clone(), value);
    }
}
