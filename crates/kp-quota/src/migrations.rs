use rusqlite::Connection;

struct Migration {
    version: u32,
    up_sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    up_sql: r#"
            CREATE TABLE IF NOT EXISTS quota_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key_hash TEXT NOT NULL,
                key_index INTEGER NOT NULL,
                units_used INTEGER NOT NULL DEFAULT 0 CHECK (units_used >= 0),
                requests_count INTEGER NOT NULL DEFAULT 0 CHECK (requests_count >= 0),
                quota_date TEXT NOT NULL,
                last_used_at TEXT,
                is_exhausted INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(key_hash, quota_date)
            );
            CREATE INDEX IF NOT EXISTS idx_quota_key_date ON quota_records(key_hash, quota_date);
            CREATE INDEX IF NOT EXISTS idx_quota_date ON quota_records(quota_date);
        "#,
}];

pub fn run_migrations(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY);")?;

    let current_version: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!("Running quota migration v{}", migration.version);
            conn.execute_batch(migration.up_sql)?;
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [migration.version],
            )?;
        }
    }

    Ok(())
}
