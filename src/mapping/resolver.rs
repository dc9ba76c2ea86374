//! Rule evaluation for the field mapping.
//!
//! The `Resolver` applies compiled rules, in order, to decoded tag fields
//! and produces per-entity inventory fields. Evaluation never fails.

use serde_json::Value;
use tracing::debug;

use super::rules::FieldMapping;
use super::types::*;
use crate::tag::{FieldMap, NormalizedFields};

/// Applies a [`FieldMapping`] to decoded tags.
#[derive(Debug, Clone, Default)]
pub struct Resolver {
    mapping: FieldMapping,
}

impl Resolver {
    pub fn new(mapping: FieldMapping) -> Self {
        Self { mapping }
    }

    pub fn mapping(&self) -> &FieldMapping {
        &self.mapping
    }

    /// Map decoded fields onto inventory fields.
    ///
    /// Direct references pass through untouched: nothing is synthesized for
    /// a tag that only points at an existing spool. For descriptors each
    /// rule runs in order and a later rule overwrites an earlier one.
    pub fn resolve(&self, fields: &NormalizedFields) -> MappedFields {
        let NormalizedFields::Descriptor(descriptor) = fields else {
            return MappedFields::default();
        };

        let mut mapped = MappedFields::default();
        for rule in self.mapping.rules() {
            match evaluate(&rule.expr, &descriptor.fields) {
                Some(value) => mapped.set(&rule.target, value),
                None => debug!(target = %rule.target, "Mapping source absent, skipping"),
            }
        }
        mapped
    }
}

/// Evaluate an expression. `None` means "write nothing".
pub fn evaluate(expr: &Expr, fields: &FieldMap) -> Option<Value> {
    match expr {
        Expr::Literal(value) => Some(value.clone()),
        Expr::Field(name) => fields.get(name).map(|value| value.to_json()),
        Expr::Concat(parts) => {
            let mut rendered = String::new();
            render_into(parts, fields, &mut rendered);
            Some(Value::String(clean_display_name(&rendered)))
        }
    }
}

fn render_into(parts: &[Expr], fields: &FieldMap, out: &mut String) {
    for part in parts {
        match part {
            Expr::Literal(Value::String(s)) => out.push_str(s),
            Expr::Literal(Value::Null) => {}
            Expr::Literal(other) => out.push_str(&other.to_string()),
            Expr::Field(name) => {
                if let Some(value) = fields.get(name) {
                    out.push_str(&value.render());
                }
            }
            Expr::Concat(inner) => render_into(inner, fields, out),
        }
    }
}

/// Collapse whitespace and drop a dangling leading or trailing dash, so
/// `"Acme PLA - "` (missing color) becomes `"Acme PLA"`.
pub fn clean_display_name(raw: &str) -> String {
    let collapsed = collapse_whitespace(raw);
    let trimmed = collapsed
        .strip_suffix('-')
        .unwrap_or(&collapsed)
        .trim_end();
    let trimmed = trimmed.strip_prefix('-').unwrap_or(trimmed).trim_start();
    collapse_whitespace(trimmed)
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BinaryFormat;
    use crate::mapping::rules::{compile_template, parse_target};
    use crate::tag::fields::*;
    use crate::tag::{Descriptor, FieldValue, NfcId, SpoolReference};
    use serde_json::json;

    fn descriptor(fields: FieldMap) -> NormalizedFields {
        NormalizedFields::Descriptor(Descriptor {
            format: BinaryFormat::Structured,
            nfc_id: NfcId::from_uid(&[0xAA, 0xBB, 0xCC]),
            fields,
        })
    }

    fn acme() -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert(VENDOR_NAME, "Acme");
        fields.insert(MATERIAL_BASE, FieldValue::Category("PLA".to_string()));
        fields.insert(COLOR_NAME, "Signal Red");
        fields.insert(NOMINAL_WEIGHT, 1000u64);
        fields
    }

    fn rule(target: &str, expr: Expr) -> MappingRule {
        MappingRule {
            target: parse_target(target).unwrap(),
            expr,
        }
    }

    #[test]
    fn test_reference_is_passthrough() {
        let resolver = Resolver::new(FieldMapping::new(vec![rule(
            "filament.name",
            Expr::Literal(json!("x")),
        )]));
        let fields = NormalizedFields::Reference(SpoolReference {
            spool_id: 3,
            filament_id: Some(2),
        });
        assert!(resolver.resolve(&fields).is_empty());
    }

    #[test]
    fn test_field_reference_keeps_type() {
        let resolver = Resolver::new(FieldMapping::new(vec![
            rule("filament.weight", Expr::Field(NOMINAL_WEIGHT.to_string())),
            rule("vendor.name", Expr::Field(VENDOR_NAME.to_string())),
        ]));
        let mapped = resolver.resolve(&descriptor(acme()));
        assert_eq!(mapped.filament.get("weight"), Some(&json!(1000)));
        assert_eq!(mapped.vendor.get("name"), Some(&json!("Acme")));
    }

    #[test]
    fn test_missing_field_writes_nothing() {
        let resolver = Resolver::new(FieldMapping::new(vec![rule(
            "filament.article_number",
            Expr::Field(GTIN.to_string()),
        )]));
        let mapped = resolver.resolve(&descriptor(acme()));
        assert!(mapped.filament.is_empty());
    }

    #[test]
    fn test_template_with_missing_field_renders_partially() {
        let template =
            compile_template("filament.name", "{vendor_name} {material_base} - {material_modifier}")
                .unwrap();
        let resolver = Resolver::new(FieldMapping::new(vec![rule("filament.name", template)]));
        let mapped = resolver.resolve(&descriptor(acme()));
        assert_eq!(mapped.filament.get("name"), Some(&json!("Acme PLA")));
    }

    #[test]
    fn test_last_write_wins() {
        let resolver = Resolver::new(FieldMapping::new(vec![
            rule("filament.name", Expr::Literal(json!("first"))),
            rule("filament.name", Expr::Field(COLOR_NAME.to_string())),
        ]));
        let mapped = resolver.resolve(&descriptor(acme()));
        assert_eq!(mapped.filament.get("name"), Some(&json!("Signal Red")));
    }

    #[test]
    fn test_nested_extra_targets() {
        let resolver = Resolver::new(FieldMapping::new(vec![
            rule("spool.extra.source", Expr::Literal(json!("nfc"))),
            rule("spool.extra.color", Expr::Field(COLOR_NAME.to_string())),
        ]));
        let mapped = resolver.resolve(&descriptor(acme()));
        assert_eq!(
            mapped.spool.get("extra"),
            Some(&json!({"source": "nfc", "color": "Signal Red"}))
        );
    }

    #[test]
    fn test_nested_target_replaces_scalar() {
        let resolver = Resolver::new(FieldMapping::new(vec![
            rule("spool.extra", Expr::Literal(json!(5))),
            rule("spool.extra.lot", Expr::Literal(json!("L1"))),
        ]));
        let mapped = resolver.resolve(&descriptor(acme()));
        assert_eq!(mapped.spool.get("extra"), Some(&json!({"lot": "L1"})));
    }

    #[test]
    fn test_concat_renders_numbers_and_literals() {
        let expr = Expr::Concat(vec![
            Expr::Field(NOMINAL_WEIGHT.to_string()),
            Expr::Literal(json!("g ")),
            Expr::Literal(json!(true)),
        ]);
        assert_eq!(evaluate(&expr, &acme()), Some(json!("1000g true")));
    }

    #[test]
    fn test_clean_display_name() {
        assert_eq!(clean_display_name("  Acme   PLA  -  "), "Acme PLA");
        assert_eq!(clean_display_name(" - Red"), "Red");
        assert_eq!(clean_display_name("Acme PLA - Red"), "Acme PLA - Red");
        assert_eq!(clean_display_name(""), "");
    }
}
