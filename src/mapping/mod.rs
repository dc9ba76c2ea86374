//! Field mapping from decoded tag fields to inventory fields.
//!
//! # Architecture
//!
//! - **Rules**: `[[mapping.rules]]` entries in the TOML config (or the
//!   embedded defaults), compiled and validated once at startup
//! - **Expressions**: literal, field reference, or concatenation (what a
//!   `template` compiles to); no string evaluation at runtime
//! - **Resolution**: rules run in order, last write wins, never fails
//!
//! # Example
//!
//! ```ignore
//! use spooltag::mapping::{default_mapping, Resolver};
//!
//! let resolver = Resolver::new(default_mapping());
//! let mapped = resolver.resolve(&normalized_fields);
//! println!("filament name: {:?}", mapped.filament.get("name"));
//! ```

mod resolver;
mod rules;
mod types;

pub use resolver::{clean_display_name, evaluate, Resolver};
pub use rules::{compile_template, default_mapping, load_mapping, parse_target, FieldMapping};
pub use types::*;
