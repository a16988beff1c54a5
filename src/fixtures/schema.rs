//! Fixture schema definitions.

use crate::models::Record;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;

const FIRST_NAMES: &[&str] = &[
    "Ada", "Alan", "Barbara", "Dennis", "Edsger", "Frances", "Grace", "Ken", "Linus", "Margaret",
    "Niklaus", "Radia", "Robin", "Sophie", "Tony", "Yukihiro",
];

const LAST_NAMES: &[&str] = &[
    "Allen", "Dijkstra", "Hamilton", "Hoare", "Hopper", "Kernighan", "Knuth", "Liskov",
    "Lovelace", "Milner", "Perlman", "Ritchie", "Thompson", "Turing", "Wilson", "Wirth",
];

const WORDS: &[&str] = &[
    "alpha", "batch", "cache", "delta", "engine", "filter", "graph", "handle", "index", "join",
    "kernel", "ledger", "merge", "node", "offset", "parser", "query", "record", "schema", "table",
    "update", "vector", "window", "yield",
];

type CustomGenerator = Arc<dyn Fn(&mut StdRng, usize) -> JsonValue + Send + Sync>;

/// How one field of a fixture record is produced.
///
/// `index` is the zero-based position of the record within its batch.
#[derive(Clone)]
pub enum FieldGenerator {
    Constant(JsonValue),
    /// `start + index`
    Sequence { start: i64 },
    /// `{n}` is replaced with `index + 1`
    Pattern(String),
    IntRange { min: i64, max: i64 },
    FloatRange { min: f64, max: f64 },
    /// `true` with the given probability
    Bool { probability: f64 },
    OneOf(Vec<JsonValue>),
    /// Space-separated words, between `min` and `max` of them
    Words { min: usize, max: usize },
    FirstName,
    LastName,
    FullName,
    /// Unique per record within a run
    Email,
    Uuid,
    /// RFC 3339 timestamp within the last `within_days` days
    Timestamp { within_days: i64 },
    Custom(CustomGenerator),
}

impl std::fmt::Debug for FieldGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Constant(v) => f.debug_tuple("Constant").field(v).finish(),
            Self::Sequence { start } => f.debug_struct("Sequence").field("start", start).finish(),
            Self::Pattern(p) => f.debug_tuple("Pattern").field(p).finish(),
            Self::IntRange { min, max } => f
                .debug_struct("IntRange")
                .field("min", min)
                .field("max", max)
                .finish(),
            Self::FloatRange { min, max } => f
                .debug_struct("FloatRange")
                .field("min", min)
                .field("max", max)
                .finish(),
            Self::Bool { probability } => f
                .debug_struct("Bool")
                .field("probability", probability)
                .finish(),
            Self::OneOf(values) => f.debug_tuple("OneOf").field(values).finish(),
            Self::Words { min, max } => f
                .debug_struct("Words")
                .field("min", min)
                .field("max", max)
                .finish(),
            Self::FirstName => f.write_str("FirstName"),
            Self::LastName => f.write_str("LastName"),
            Self::FullName => f.write_str("FullName"),
            Self::Email => f.write_str("Email"),
            Self::Uuid => f.write_str("Uuid"),
            Self::Timestamp { within_days } => f
                .debug_struct("Timestamp")
                .field("within_days", within_days)
                .finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl FieldGenerator {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&mut StdRng, usize) -> JsonValue + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    pub fn generate(&self, rng: &mut StdRng, index: usize) -> JsonValue {
        self.generate_at(rng, index, Utc::now())
    }

    /// Like [`FieldGenerator::generate`], with timestamps counted back from `now`.
    pub fn generate_at(&self, rng: &mut StdRng, index: usize, now: DateTime<Utc>) -> JsonValue {
        match self {
            Self::Constant(value) => value.clone(),
            Self::Sequence { start } => json!(start + index as i64),
            Self::Pattern(pattern) => json!(pattern.replace("{n}", &(index + 1).to_string())),
            Self::IntRange { min, max } => {
                let (lo, hi) = ordered(*min, *max);
                json!(rng.gen_range(lo..=hi))
            }
            Self::FloatRange { min, max } => {
                let (lo, hi) = if min <= max { (*min, *max) } else { (*max, *min) };
                if lo == hi {
                    json!(lo)
                } else {
                    json!(rng.gen_range(lo..hi))
                }
            }
            Self::Bool { probability } => json!(rng.gen_bool(probability.clamp(0.0, 1.0))),
            Self::OneOf(values) => values.choose(rng).cloned().unwrap_or(JsonValue::Null),
            Self::Words { min, max } => {
                let (lo, hi) = ordered(*min, *max);
                let count = rng.gen_range(lo..=hi);
                let words: Vec<&str> = (0..count).filter_map(|_| WORDS.choose(rng).copied()).collect();
                json!(words.join(" "))
            }
            Self::FirstName => json!(pick(rng, FIRST_NAMES)),
            Self::LastName => json!(pick(rng, LAST_NAMES)),
            Self::FullName => json!(format!("{} {}", pick(rng, FIRST_NAMES), pick(rng, LAST_NAMES))),
            Self::Email => {
                let first = pick(rng, FIRST_NAMES).to_lowercase();
                let last = pick(rng, LAST_NAMES).to_lowercase();
                let tag: u32 = rng.gen_range(0..0x10000);
                json!(format!("{first}.{last}.{}.{tag:04x}@example.test", index + 1))
            }
            Self::Uuid => {
                let mut bytes = [0u8; 16];
                rng.fill(&mut bytes);
                json!(uuid::Builder::from_random_bytes(bytes).into_uuid().to_string())
            }
            Self::Timestamp { within_days } => {
                let span = (*within_days).max(0) * 86_400;
                let offset = if span == 0 { 0 } else { rng.gen_range(0..span) };
                let at = now - ChronoDuration::seconds(offset);
                json!(at.to_rfc3339())
            }
            Self::Custom(f) => f(rng, index),
        }
    }
}

fn ordered<T: PartialOrd>(a: T, b: T) -> (T, T) {
    if a <= b { (a, b) } else { (b, a) }
}

fn pick(rng: &mut StdRng, list: &[&'static str]) -> &'static str {
    list.choose(rng).copied().unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

/// Join collection for a many-to-many relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PivotTable {
    pub table: String,
    /// Column holding this schema's key
    pub source_column: String,
    /// Column holding the target's key
    pub target_column: String,
}

/// A relationship from the owning schema to `target`.
///
/// - many-to-one / one-to-one: `foreign_key` is set on the owning schema's
///   records from the target record's `local_key`.
/// - one-to-many: `per_parent` target records are created per owning record
///   with `foreign_key` set to the owner's `local_key`.
/// - many-to-many: pivot rows pair the owner's `local_key` with the target's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipDefinition {
    pub kind: RelationshipKind,
    pub target: String,
    pub foreign_key: String,
    pub local_key: String,
    pub per_parent: usize,
    pub pivot: Option<PivotTable>,
}

impl RelationshipDefinition {
    fn new(kind: RelationshipKind, target: &str, foreign_key: &str) -> Self {
        Self {
            kind,
            target: target.to_string(),
            foreign_key: foreign_key.to_string(),
            local_key: "id".to_string(),
            per_parent: 1,
            pivot: None,
        }
    }

    pub fn many_to_one(target: &str, foreign_key: &str) -> Self {
        Self::new(RelationshipKind::ManyToOne, target, foreign_key)
    }

    pub fn one_to_one(target: &str, foreign_key: &str) -> Self {
        Self::new(RelationshipKind::OneToOne, target, foreign_key)
    }

    pub fn one_to_many(target: &str, foreign_key: &str, per_parent: usize) -> Self {
        Self {
            per_parent,
            ..Self::new(RelationshipKind::OneToMany, target, foreign_key)
        }
    }

    pub fn many_to_many(target: &str, pivot: &str, source_column: &str, target_column: &str) -> Self {
        Self {
            pivot: Some(PivotTable {
                table: pivot.to_string(),
                source_column: source_column.to_string(),
                target_column: target_column.to_string(),
            }),
            ..Self::new(RelationshipKind::ManyToMany, target, target_column)
        }
    }

    pub fn with_local_key(mut self, local_key: &str) -> Self {
        self.local_key = local_key.to_string();
        self
    }

    /// Whether `target` must be seeded before the owning schema.
    pub fn target_is_dependency(&self) -> bool {
        !matches!(self.kind, RelationshipKind::OneToMany)
    }
}

/// Blueprint for one fixture set.
#[derive(Debug, Clone)]
pub struct SeederSchema {
    pub name: String,
    pub table: String,
    pub count: usize,
    /// Explicit records; generators fill the fields they leave out
    pub data: Option<Vec<Record>>,
    pub fields: Vec<(String, FieldGenerator)>,
    pub relationships: Vec<RelationshipDefinition>,
    pub dependencies: Vec<String>,
}

impl SeederSchema {
    /// Schema named after its table.
    pub fn new(table: &str) -> Self {
        Self::named(table, table)
    }

    pub fn named(name: &str, table: &str) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            count: 0,
            data: None,
            fields: Vec::new(),
            relationships: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    pub fn data(mut self, records: Vec<Record>) -> Self {
        self.data = Some(records);
        self
    }

    pub fn field(mut self, name: &str, generator: FieldGenerator) -> Self {
        self.fields.retain(|(existing, _)| existing != name);
        self.fields.push((name.to_string(), generator));
        self
    }

    pub fn relationship(mut self, relationship: RelationshipDefinition) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn depends_on(mut self, schema: &str) -> Self {
        if !self.dependencies.iter().any(|d| d == schema) {
            self.dependencies.push(schema.to_string());
        }
        self
    }

    /// Declared dependencies plus relationship targets seeded first.
    pub fn dependency_names(&self) -> Vec<String> {
        let mut names = self.dependencies.clone();
        for rel in self.relationships.iter().filter(|r| r.target_is_dependency()) {
            if !names.contains(&rel.target) {
                names.push(rel.target.clone());
            }
        }
        names
    }

    /// Records to insert before relationships are applied. Generated
    /// timestamps fall before `now`.
    pub fn build_records(&self, rng: &mut StdRng, now: DateTime<Utc>) -> Vec<Record> {
        match &self.data {
            Some(records) => records
                .iter()
                .enumerate()
                .map(|(index, record)| self.complete(record.clone(), rng, index, now))
                .collect(),
            None => (0..self.count)
                .map(|index| self.complete(Record::new(), rng, index, now))
                .collect(),
        }
    }

    /// One generated record, as used for one-to-many children.
    pub fn build_record(&self, rng: &mut StdRng, index: usize, now: DateTime<Utc>) -> Record {
        self.complete(Record::new(), rng, index, now)
    }

    fn complete(&self, mut record: Record, rng: &mut StdRng, index: usize, now: DateTime<Utc>) -> Record {
        for (field, generator) in &self.fields {
            if !record.contains_key(field) {
                record.insert(field.clone(), generator.generate_at(rng, index, now));
            }
        }
        record
    }
}
