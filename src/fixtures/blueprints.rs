//! Ready-made schemas for the common users / posts / comments fixture set.
//!
//! Tables are expected to have an auto-generated `id` key.

use crate::fixtures::schema::{FieldGenerator, RelationshipDefinition, SeederSchema};
use serde_json::json;

pub fn users(count: usize) -> SeederSchema {
    SeederSchema::new("users")
        .count(count)
        .field("email", FieldGenerator::Email)
        .field("username", FieldGenerator::Pattern("user_{n}".into()))
        .field("first_name", FieldGenerator::FirstName)
        .field("last_name", FieldGenerator::LastName)
        .field("is_active", FieldGenerator::Constant(json!(true)))
        .field("is_verified", FieldGenerator::Bool { probability: 0.5 })
        .field("created_at", FieldGenerator::Timestamp { within_days: 365 })
}

pub fn posts(count: usize) -> SeederSchema {
    SeederSchema::new("posts")
        .count(count)
        .field("title", FieldGenerator::Words { min: 3, max: 8 })
        .field("slug", FieldGenerator::Pattern("post-{n}".into()))
        .field("content", FieldGenerator::Words { min: 20, max: 60 })
        .field(
            "status",
            FieldGenerator::OneOf(vec![json!("draft"), json!("published"), json!("archived")]),
        )
        .field("view_count", FieldGenerator::IntRange { min: 0, max: 10_000 })
        .field("created_at", FieldGenerator::Timestamp { within_days: 365 })
        .relationship(RelationshipDefinition::many_to_one("users", "user_id"))
}

pub fn comments(count: usize) -> SeederSchema {
    SeederSchema::new("comments")
        .count(count)
        .field("content", FieldGenerator::Words { min: 5, max: 30 })
        .field("author_name", FieldGenerator::FullName)
        .field("author_email", FieldGenerator::Email)
        .field("is_approved", FieldGenerator::Bool { probability: 0.5 })
        .field("created_at", FieldGenerator::Timestamp { within_days: 30 })
        .relationship(RelationshipDefinition::many_to_one("posts", "post_id"))
}
