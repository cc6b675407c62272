use std::str::FromStr;

use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

const SCHEMA: [&str; 7] = [
    "CREATE TABLE IF NOT EXISTS job_queue (
        id TEXT PRIMARY KEY,
        owner TEXT NOT NULL,
        grp TEXT NOT NULL,
        autoseries INTEGER NOT NULL DEFAULT 0,
        queued TEXT NOT NULL,
        start TEXT,
        stop TEXT,
        server TEXT,
        process_id INTEGER,
        status TEXT NOT NULL DEFAULT 'queued',
        priority INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS job_files (
        job_id TEXT NOT NULL,
        position INTEGER NOT NULL,
        file TEXT NOT NULL,
        PRIMARY KEY (job_id, position)
    )",
    "CREATE TABLE IF NOT EXISTS server (
        name TEXT PRIMARY KEY,
        engine_path TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'free',
        job INTEGER,
        gpu_id INTEGER,
        claimed TEXT
    )",
    "CREATE TABLE IF NOT EXISTS queuemanager (
        id INTEGER PRIMARY KEY CHECK (id = 0),
        switch TEXT NOT NULL
    )",
    "INSERT OR IGNORE INTO queuemanager (id, switch) VALUES (0, 'on')",
    "CREATE TABLE IF NOT EXISTS statistics (
        id TEXT NOT NULL,
        owner TEXT NOT NULL,
        grp TEXT NOT NULL,
        start TEXT,
        stop TEXT NOT NULL,
        server TEXT
    )",
    "CREATE INDEX IF NOT EXISTS job_queue_status ON job_queue (status)",
];

/// Relational store shared by every queue manager process pointing at it.
pub struct SqliteDb {
    pub(in crate::infrastructure) pool: SqlitePool,
}

impl SqliteDb {
    /// Connects and creates missing tables.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("Invalid store url `{url}`"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("Cannot open store `{url}`"))?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// A private in-memory database. One connection, since every connection
    /// would otherwise see its own empty database.
    #[cfg(test)]
    pub async fn in_memory() -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Cannot create queue schema")?;
        }
        Ok(())
    }
}
