//! Store schema.

pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA_VERSION_TABLE: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL
);
";

const MACHINES_TABLE: &str = "
CREATE TABLE IF NOT EXISTS machines (
    id TEXT PRIMARY KEY,
    name TEXT UNIQUE NOT NULL,
    json TEXT NOT NULL
);
";

const SETTINGS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

pub fn all_schemas() -> &'static [&'static str] {
    &[SCHEMA_VERSION_TABLE, MACHINES_TABLE, SETTINGS_TABLE]
}
