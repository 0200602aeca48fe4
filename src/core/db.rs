use std::fs;
use std::path::Path;

use anyhow::{Error, Result};
use rusqlite::Connection;

/// Opens (or creates) the sqlite database at `db_path` and makes sure
/// the schema exists.
pub fn open_db(db_path: &str) -> Result<Connection, Error> {
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(db_path)?;
    initialize_db(&conn)?;
    Ok(conn)
}

pub fn initialize_db(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        r"
        CREATE TABLE IF NOT EXISTS kv (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        ",
    )
}
