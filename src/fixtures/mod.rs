//! Fixture seeding.
//!
//! Schemas describe how records are generated and how they relate; the
//! [`Seeder`] inserts them in dependency order and remembers what it wrote.

pub mod blueprints;
pub mod graph;
pub mod schema;
pub mod seeder;

pub use graph::DependencyGraph;
pub use schema::{FieldGenerator, PivotTable, RelationshipDefinition, RelationshipKind, SeederSchema};
pub use seeder::{DEFAULT_BATCH_SIZE, SEEDED_EPOCH, SeedReport, Seeder, SeederConfig};
