//! Field definitions for model schemas.
//!
//! [`FieldDef`] describes a field and its column mapping; [`FieldType`] selects
//! the field class and, for relations, the target model.

pub mod types;

pub use types::{FieldDef, FieldType};
