//! Compiling mapping rules from configuration.
//!
//! Provides two loading methods:
//! - `default_mapping()` - The rules shipped in the embedded default config
//! - `load_mapping(path)` - Rules from the `[mapping]` table of a TOML file

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use super::types::*;
use crate::config::DEFAULT_CONFIG;
use crate::error::MappingError;
use crate::tag::fields::is_known_field;

#[derive(Deserialize)]
struct MappingSection {
    #[serde(default)]
    mapping: MappingConfig,
}

/// Load and compile the `[mapping]` table of a TOML file.
pub fn load_mapping(path: &Path) -> Result<FieldMapping> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let section: MappingSection = toml::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(FieldMapping::compile(&section.mapping)?)
}

/// The mapping shipped with the binary in `config/spooltag.toml`.
///
/// # Panics
/// Panics if the embedded configuration is invalid (a build-time bug,
/// covered by tests).
pub fn default_mapping() -> FieldMapping {
    let section: MappingSection =
        toml::from_str(DEFAULT_CONFIG).expect("embedded spooltag.toml must be valid TOML");
    FieldMapping::compile(&section.mapping).expect("embedded mapping rules must compile")
}

/// Ordered, validated mapping rules.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldMapping {
    rules: Vec<MappingRule>,
}

impl FieldMapping {
    pub fn new(rules: Vec<MappingRule>) -> Self {
        Self { rules }
    }

    pub fn compile(config: &MappingConfig) -> Result<Self, MappingError> {
        let rules = config
            .rules
            .iter()
            .map(compile_rule)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[MappingRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn compile_rule(rule: &RuleConfig) -> Result<MappingRule, MappingError> {
    let target = parse_target(&rule.target)?;

    let expr = match (&rule.field, &rule.template, &rule.value) {
        (Some(field), None, None) => {
            check_field(&rule.target, field)?;
            Expr::Field(field.clone())
        }
        (None, Some(template), None) => compile_template(&rule.target, template)?,
        (None, None, Some(value)) => Expr::Literal(value.clone()),
        _ => {
            return Err(MappingError::AmbiguousRule {
                target: rule.target.clone(),
            })
        }
    };

    Ok(MappingRule { target, expr })
}

/// `vendor.<f>`, `filament.<f>`, `spool.<f>`, optionally nested
/// (`spool.extra.lot`).
pub fn parse_target(raw: &str) -> Result<Target, MappingError> {
    let invalid = || MappingError::InvalidTarget(raw.to_string());

    let mut segments = raw.trim().split('.');
    let entity = segments.next().and_then(Entity::parse).ok_or_else(invalid)?;
    let path: Vec<String> = segments.map(str::to_string).collect();

    let valid_segment =
        |s: &String| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if path.is_empty() || !path.iter().all(valid_segment) {
        return Err(invalid());
    }
    Ok(Target { entity, path })
}

fn check_field(target: &str, field: &str) -> Result<(), MappingError> {
    if is_known_field(field) {
        Ok(())
    } else {
        Err(MappingError::UnknownField {
            target: target.to_string(),
            field: field.to_string(),
        })
    }
}

/// Compile `"{vendor_name} {material_base} - {color_name}"` into a
/// concatenation. `{{` and `}}` produce literal braces.
pub fn compile_template(target: &str, template: &str) -> Result<Expr, MappingError> {
    let bad = |reason: &str| MappingError::BadTemplate {
        target: target.to_string(),
        reason: reason.to_string(),
    };

    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some('{') => return Err(bad("nested '{'")),
                        Some(ch) => name.push(ch),
                        None => return Err(bad("unclosed '{'")),
                    }
                }
                let name = name.trim();
                if name.is_empty() {
                    return Err(bad("empty placeholder"));
                }
                check_field(target, name)?;
                if !literal.is_empty() {
                    parts.push(Expr::Literal(Value::String(std::mem::take(&mut literal))));
                }
                parts.push(Expr::Field(name.to_string()));
            }
            '}' => return Err(bad("unmatched '}'")),
            other => literal.push(other),
        }
    }
    if !literal.is_empty() {
        parts.push(Expr::Literal(Value::String(literal)));
    }

    Ok(Expr::Concat(parts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(target: &str) -> RuleConfig {
        RuleConfig {
            target: target.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_mapping_compiles() {
        let mapping = default_mapping();
        assert!(!mapping.is_empty(), "Default config should ship mapping rules");
    }

    #[test]
    fn test_parse_target() {
        let target = parse_target("spool.extra.lot").unwrap();
        assert_eq!(target.entity, Entity::Spool);
        assert_eq!(target.path, vec!["extra", "lot"]);
        assert_eq!(target.to_string(), "spool.extra.lot");

        for bad in ["printer.name", "filament", "filament.", "filament..x", "vendor.na me"] {
            assert!(
                matches!(parse_target(bad), Err(MappingError::InvalidTarget(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_compile_template() {
        let expr = compile_template("filament.name", "{vendor_name} {{x}} {color_name}").unwrap();
        assert_eq!(
            expr,
            Expr::Concat(vec![
                Expr::Field("vendor_name".to_string()),
                Expr::Literal(json!(" {x} ")),
                Expr::Field("color_name".to_string()),
            ])
        );
    }

    #[test]
    fn test_template_errors() {
        assert!(matches!(
            compile_template("t.x", "{vendor_name"),
            Err(MappingError::BadTemplate { .. })
        ));
        assert!(matches!(
            compile_template("t.x", "a } b"),
            Err(MappingError::BadTemplate { .. })
        ));
        assert!(matches!(
            compile_template("t.x", "{}"),
            Err(MappingError::BadTemplate { .. })
        ));
        assert_eq!(
            compile_template("t.x", "{brand}"),
            Err(MappingError::UnknownField {
                target: "t.x".to_string(),
                field: "brand".to_string()
            })
        );
    }

    #[test]
    fn test_rule_needs_exactly_one_source() {
        let config = MappingConfig {
            rules: vec![rule("filament.name")],
        };
        assert!(matches!(
            FieldMapping::compile(&config),
            Err(MappingError::AmbiguousRule { .. })
        ));

        let mut both = rule("filament.name");
        both.field = Some("color_name".to_string());
        both.value = Some(json!("x"));
        let config = MappingConfig { rules: vec![both] };
        assert!(matches!(
            FieldMapping::compile(&config),
            Err(MappingError::AmbiguousRule { .. })
        ));
    }

    #[test]
    fn test_unknown_field_reference_is_rejected() {
        let mut r = rule("spool.lot_nr");
        r.field = Some("lot_number".to_string());
        let config = MappingConfig { rules: vec![r] };
        assert!(matches!(
            FieldMapping::compile(&config),
            Err(MappingError::UnknownField { .. })
        ));
    }

    #[test]
    fn test_load_mapping_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spooltag.toml");
        std::fs::write(
            &path,
            r#"
[spoolman]
url = "http://localhost:7912"

[[mapping.rules]]
target = "filament.name"
template = "{material_base} {color_name}"

[[mapping.rules]]
target = "spool.extra.source"
value = "nfc"
"#,
        )
        .unwrap();

        let mapping = load_mapping(&path).unwrap();
        assert_eq!(mapping.rules().len(), 2);
        assert_eq!(mapping.rules()[1].expr, Expr::Literal(json!("nfc")));
    }

    #[test]
    fn test_load_mapping_without_section_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.toml");
        std::fs::write(&path, "[tags]\nstructured_enabled = true\n").unwrap();
        assert!(load_mapping(&path).unwrap().is_empty());
    }
}
