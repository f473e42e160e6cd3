/// Schema for cache generations and the local key/value store.
pub const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Named, versioned containers (e.g. "artifact-v2-static")
CREATE TABLE IF NOT EXISTS cache_generations (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses, keyed by request identity within a generation
CREATE TABLE IF NOT EXISTS cache_entries (
    generation TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    response_url TEXT NOT NULL,
    status INTEGER NOT NULL,
    kind TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, method, url),
    FOREIGN KEY (generation) REFERENCES cache_generations(name) ON DELETE CASCADE
);

-- Page-side persistent values (catalog snapshot, history, clicks)
CREATE TABLE IF NOT EXISTS local_storage (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;
