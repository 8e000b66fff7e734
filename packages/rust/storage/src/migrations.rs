//! SQL migrations for the libSQL knowledge index.
//!
//! Applied in order on `init`. The vector column width is the configured
//! embedding dimension, so the schema is rendered per deployment.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: String,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations(dimension: usize) -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "knowledge_index with F32_BLOB vectors",
            sql: format!(
                r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS knowledge_index (
    id         TEXT PRIMARY KEY,
    embedding  F32_BLOB({dimension}) NOT NULL,
    payload    TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (1);
"#
            ),
        },
        Migration {
            version: 2,
            description: "index knowledge_index by update time",
            sql: r#"
CREATE INDEX IF NOT EXISTS idx_knowledge_updated ON knowledge_index(updated_at);

INSERT INTO schema_migrations (version) VALUES (2);
"#
            .to_string(),
        },
    ]
}
