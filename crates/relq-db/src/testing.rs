//! Shared fixtures for unit tests.
//!
//! The `library` app has authors, books, publishers, countries and tags; the
//! `places` app has a multi-table inheritance pair.

use std::sync::{Arc, Mutex};

use relq_core::RelqResult;

use crate::context::QueryContext;
use crate::executor::DbExecutor;
use crate::fields::{FieldDef, FieldType};
use crate::model::{ModelMeta, ModelRegistry};
use crate::query::compiler::{DatabaseBackendType, Row};
use crate::value::Value;

pub(crate) fn library_registry() -> ModelRegistry {
    ModelRegistry::builder()
        .model(
            ModelMeta::new("library.author")
                .field(FieldDef::new("name", FieldType::CharField))
                .field(FieldDef::new("age", FieldType::IntegerField))
                .ordering(&["name"]),
        )
        .model(ModelMeta::new("library.country").field(FieldDef::new("name", FieldType::CharField)))
        .model(
            ModelMeta::new("library.publisher")
                .field(FieldDef::new("name", FieldType::CharField))
                .field(FieldDef::foreign_key("country", "library.country").nullable()),
        )
        .model(ModelMeta::new("library.tag").field(FieldDef::new("name", FieldType::CharField)))
        .model(
            ModelMeta::new("library.book")
                .field(FieldDef::new("title", FieldType::CharField))
                .field(FieldDef::new("pages", FieldType::IntegerField))
                .field(FieldDef::new("rating", FieldType::FloatField).nullable())
                .field(FieldDef::new("published", FieldType::DateField).nullable())
                .field(FieldDef::foreign_key("author", "library.author"))
                .field(
                    FieldDef::foreign_key("editor", "library.author")
                        .nullable()
                        .related_name("edited_books"),
                )
                .field(FieldDef::foreign_key("publisher", "library.publisher").nullable())
                .field(FieldDef::many_to_many("tags", "library.tag")),
        )
        .build()
        .unwrap()
}

pub(crate) fn library_context() -> Arc<QueryContext> {
    QueryContext::new(library_registry())
}

pub(crate) fn places_context() -> Arc<QueryContext> {
    let registry = ModelRegistry::builder()
        .model(ModelMeta::new("places.place").field(FieldDef::new("name", FieldType::CharField)))
        .model(
            ModelMeta::new("places.restaurant")
                .inherits("places.place")
                .field(FieldDef::new("serves_pizza", FieldType::BooleanField)),
        )
        .build()
        .unwrap();
    QueryContext::new(registry)
}

/// Returns the same rows for every query and records each statement.
#[derive(Debug, Default)]
pub(crate) struct StubExecutor {
    rows: Vec<Row>,
    statements: Mutex<Vec<(String, Vec<Value>)>>,
}

impl StubExecutor {
    pub(crate) fn with_rows(rows: Vec<Row>) -> Self {
        Self {
            rows,
            statements: Mutex::default(),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.statements.lock().unwrap().len()
    }

    pub(crate) fn statements(&self) -> Vec<(String, Vec<Value>)> {
        self.statements.lock().unwrap().clone()
    }
}

impl DbExecutor for StubExecutor {
    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::SQLite
    }

    fn execute_sql(&self, sql: &str, params: &[Value]) -> RelqResult<u64> {
        self.statements
            .lock()
            .unwrap()
            .push((sql.to_string(), params.to_vec()));
        Ok(0)
    }

    fn query(&self, sql: &str, params: &[Value]) -> RelqResult<Vec<Row>> {
        self.statements
            .lock()
            .unwrap()
            .push((sql.to_string(), params.to_vec()));
        Ok(self.rows.clone())
    }
}
