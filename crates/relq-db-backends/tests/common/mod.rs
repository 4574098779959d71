//! Shared schema, fixtures, and executors for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use relq_core::RelqResult;
use relq_db::fields::{FieldDef, FieldType};
use relq_db::model::{ModelMeta, ModelRegistry};
use relq_db::query::compiler::{DatabaseBackendType, Row};
use relq_db::value::Value;
use relq_db::{DbExecutor, QueryContext, QuerySet};
use relq_db_backends::SqliteBackend;

// ── Schema ────────────────────────────────────────────────────────────

pub fn library_registry() -> ModelRegistry {
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
        .model(ModelMeta::new("places.place").field(FieldDef::new("name", FieldType::CharField)))
        .model(
            ModelMeta::new("places.restaurant")
                .inherits("places.place")
                .field(FieldDef::new("serves_pizza", FieldType::BooleanField)),
        )
        .build()
        .unwrap()
}

const SCHEMA: &str = "
CREATE TABLE library_author (id INTEGER PRIMARY KEY, name TEXT NOT NULL, age INTEGER NOT NULL);
CREATE TABLE library_country (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
CREATE TABLE library_publisher (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    country_id INTEGER NULL REFERENCES library_country (id)
);
CREATE TABLE library_tag (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
CREATE TABLE library_book (
    id INTEGER PRIMARY KEY,
    title TEXT NOT NULL,
    pages INTEGER NOT NULL,
    rating REAL NULL,
    published TEXT NULL,
    author_id INTEGER NOT NULL REFERENCES library_author (id),
    editor_id INTEGER NULL REFERENCES library_author (id),
    publisher_id INTEGER NULL REFERENCES library_publisher (id)
);
CREATE TABLE library_book_tags (
    id INTEGER PRIMARY KEY,
    book_id INTEGER NOT NULL REFERENCES library_book (id),
    tag_id INTEGER NOT NULL REFERENCES library_tag (id)
);
CREATE TABLE places_place (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
CREATE TABLE places_restaurant (
    place_ptr_id INTEGER PRIMARY KEY REFERENCES places_place (id),
    serves_pizza BOOL NOT NULL
);
";

// Book 1 has an editor but no publisher, book 2 a publisher but no editor:
// an OR across both relations must keep both joins LEFT OUTER. Book 3 has
// tags x and z, book 4 has no tags: excluding tag x must keep book 4 and
// drop book 3.
const FIXTURES: &str = "
INSERT INTO library_author (id, name, age) VALUES (1, 'Ann', 30), (2, 'Bob', 45), (3, 'Cy', 60);
INSERT INTO library_country (id, name) VALUES (1, 'France'), (2, 'Peru');
INSERT INTO library_publisher (id, name, country_id) VALUES (1, 'Ace', 1), (2, 'Best', NULL);
INSERT INTO library_tag (id, name) VALUES (1, 'x'), (2, 'y'), (3, 'z');
INSERT INTO library_book (id, title, pages, rating, published, author_id, editor_id, publisher_id) VALUES
    (1, 'Alpha', 100, 4.5, '2020-01-01', 1, 2, NULL),
    (2, 'Beta', 250, NULL, NULL, 2, NULL, 2),
    (3, 'Gamma', 400, 3.0, '2021-06-15', 1, NULL, NULL),
    (4, 'Delta', 50, 5.0, '2019-03-03', 3, 3, 1),
    (5, 'Epsilon', 320, 2.0, NULL, 2, 1, 1);
INSERT INTO library_book_tags (book_id, tag_id) VALUES (1, 1), (2, 2), (3, 1), (3, 3), (5, 3);
INSERT INTO places_place (id, name) VALUES (1, 'Luigi'), (2, 'Park'), (3, 'Mario');
INSERT INTO places_restaurant (place_ptr_id, serves_pizza) VALUES (1, 1), (3, 0);
";

pub fn context() -> Arc<QueryContext> {
    QueryContext::new(library_registry())
}

/// An in-memory database loaded with the library and places fixtures.
pub fn database() -> SqliteBackend {
    let backend = SqliteBackend::memory().unwrap();
    backend.execute_batch(SCHEMA).unwrap();
    backend.execute_batch(FIXTURES).unwrap();
    backend
}

pub fn books() -> QuerySet {
    QuerySet::new(context(), "library.book").unwrap()
}

pub fn authors() -> QuerySet {
    QuerySet::new(context(), "library.author").unwrap()
}

/// Reads the `id` column of every row.
pub fn ids(rows: &[Row]) -> Vec<i64> {
    rows.iter().map(|r| r.get::<i64>("id").unwrap()).collect()
}

/// Reads the `id` column of every row, sorted.
pub fn sorted_ids(rows: &[Row]) -> Vec<i64> {
    let mut out = ids(rows);
    out.sort_unstable();
    out
}

/// Runs `qs` restricted to its `id` column and returns the sorted ids.
pub fn fetch_ids(qs: &QuerySet, db: &SqliteBackend) -> Vec<i64> {
    sorted_ids(&qs.values(&["id"]).unwrap().fetch(db).unwrap())
}

/// A numeric result cell as `f64`.
pub fn number(value: &Value) -> f64 {
    match value {
        Value::Int(i) => *i as f64,
        Value::Float(f) => *f,
        other => panic!("not a number: {other:?}"),
    }
}

// ── Executors ─────────────────────────────────────────────────────────

/// Forwards to another executor and counts round trips.
pub struct CountingExecutor<'a> {
    inner: &'a dyn DbExecutor,
    calls: AtomicUsize,
}

impl<'a> CountingExecutor<'a> {
    pub fn new(inner: &'a dyn DbExecutor) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DbExecutor for CountingExecutor<'_> {
    fn backend_type(&self) -> DatabaseBackendType {
        self.inner.backend_type()
    }

    fn execute_sql(&self, sql: &str, params: &[Value]) -> RelqResult<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.execute_sql(sql, params)
    }

    fn query(&self, sql: &str, params: &[Value]) -> RelqResult<Vec<Row>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.query(sql, params)
    }
}
