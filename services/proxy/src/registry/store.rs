//! Read contracts against the management store.
//!
//! The proxy needs exactly two reads: the active protected servers and the
//! bans. [`SqliteSource`] serves them from the management database over a
//! single connection opened at startup.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, Row};
use thiserror::Error;
use tracing::{debug, warn};

use super::model::{BanEntry, ProtectedServer, ServerStatus};

/// Errors from store reads.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store connection poisoned")]
    Poisoned,

    #[error("store task failed: {0}")]
    Task(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Source of registry data.
#[async_trait]
pub trait RegistrySource: Send + Sync {
    /// Protected servers whose status is active.
    async fn active_servers(&self) -> Result<Vec<ProtectedServer>, StoreError>;

    /// Bans flagged active. Expiry is not filtered here.
    async fn bans(&self) -> Result<Vec<BanEntry>, StoreError>;
}

/// Management database reader.
pub struct SqliteSource {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSource {
    /// Open the database at `path`, creating it and the two tables the proxy
    /// reads if they do not exist yet.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        // The management side writes concurrently.
        conn.busy_timeout(Duration::from_secs(2))?;

        Self::from_connection(conn)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[async_trait]
impl RegistrySource for SqliteSource {
    async fn active_servers(&self) -> Result<Vec<ProtectedServer>, StoreError> {
        self.with_conn(query_servers).await
    }

    async fn bans(&self) -> Result<Vec<BanEntry>, StoreError> {
        self.with_conn(query_bans).await
    }
}

/// Create the tables read by the proxy. Column sets match the management
/// side so either process can create the file first.
fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS servers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            real_ip TEXT NOT NULL,
            real_port INTEGER NOT NULL,
            proxy_port INTEGER NOT NULL,
            status TEXT DEFAULT 'active',
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            last_check DATETIME DEFAULT CURRENT_TIMESTAMP,
            connection_count INTEGER DEFAULT 0,
            last_connection DATETIME
        );

        CREATE TABLE IF NOT EXISTS bans (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ip TEXT NOT NULL,
            reason TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            expires_at DATETIME,
            is_active INTEGER DEFAULT 1
        );

        CREATE INDEX IF NOT EXISTS idx_servers_proxy_port ON servers(proxy_port);
        CREATE INDEX IF NOT EXISTS idx_servers_status ON servers(status);
        CREATE INDEX IF NOT EXISTS idx_bans_ip ON bans(ip);
        CREATE INDEX IF NOT EXISTS idx_bans_expires ON bans(expires_at);
        "#,
    )?;

    debug!("Registry store schema initialized");
    Ok(())
}

fn query_servers(conn: &Connection) -> Result<Vec<ProtectedServer>, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, real_ip, real_port, proxy_port, status FROM servers \
         WHERE status = 'active' ORDER BY id",
    )?;

    let mut rows = stmt.query([])?;
    let mut servers = Vec::new();
    while let Some(row) = rows.next()? {
        let id: i64 = row.get(0)?;

        let Some(real_ip) = text_column(row, 1)? else {
            warn!(server_id = id, "Skipping server with non-text backend address");
            continue;
        };

        let real_port = integer_column(row, 2)?;
        let proxy_port = integer_column(row, 3)?;
        let (Some(real_port), Some(proxy_port)) = (real_port, proxy_port) else {
            warn!(server_id = id, "Skipping server with non-integer port");
            continue;
        };

        let (Ok(backend_port), Ok(proxy_port)) =
            (u16::try_from(real_port), u16::try_from(proxy_port))
        else {
            warn!(
                server_id = id,
                real_port,
                proxy_port,
                "Skipping server with out-of-range port"
            );
            continue;
        };

        let status = text_column(row, 4)?;
        servers.push(ProtectedServer {
            id,
            proxy_port,
            backend_host: real_ip.trim().to_string(),
            backend_port,
            status: ServerStatus::from_str_lossy(status.as_deref().unwrap_or("active")),
        });
    }

    Ok(servers)
}

fn query_bans(conn: &Connection) -> Result<Vec<BanEntry>, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT ip, expires_at, id FROM bans WHERE COALESCE(is_active, 1) != 0 ORDER BY id",
    )?;

    let mut rows = stmt.query([])?;
    let mut bans = Vec::new();
    while let Some(row) = rows.next()? {
        let Some(address) = text_column(row, 0)? else {
            let ban_id: i64 = row.get(2)?;
            warn!(ban_id, "Skipping ban with non-text address");
            continue;
        };

        bans.push(BanEntry {
            expires_at: expiry_column(row, &address)?,
            address,
        });
    }

    Ok(bans)
}

/// Column value as an integer, or `None` when the stored value is not one.
/// Declared column types do not constrain what SQLite stores.
fn integer_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<i64>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Integer(value) => Some(value),
        _ => None,
    })
}

/// Column value as UTF-8 text, or `None` for any other stored value.
fn text_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<String>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Text(raw) => std::str::from_utf8(raw).ok().map(str::to_owned),
        _ => None,
    })
}

/// Read `expires_at`, which may hold SQLite datetime text or a Unix
/// timestamp. An expiry that cannot be read keeps the ban in force.
fn expiry_column(row: &Row<'_>, address: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let expires_at = match row.get_ref(1)? {
        ValueRef::Null => None,
        ValueRef::Text(raw) => {
            let text = String::from_utf8_lossy(raw);
            let parsed = parse_expiry(&text);
            if parsed.is_none() {
                warn!(address, expires_at = %text, "Unreadable ban expiry, treating as permanent");
            }
            parsed
        }
        ValueRef::Integer(secs) => Utc.timestamp_opt(secs, 0).single(),
        ValueRef::Real(secs) => Utc.timestamp_opt(secs as i64, 0).single(),
        ValueRef::Blob(_) => {
            warn!(address, "Binary ban expiry, treating as permanent");
            None
        }
    };

    Ok(expires_at)
}

/// Parse an expiry timestamp as written by SQLite (`YYYY-MM-DD HH:MM:SS`,
/// always UTC) or as RFC 3339.
pub fn parse_expiry(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }

    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};
    use rusqlite::params;

    fn seeded() -> SqliteSource {
        let source = SqliteSource::open_in_memory().unwrap();
        {
            let conn = source.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO servers (real_ip, real_port, proxy_port, status) VALUES (?1, ?2, ?3, ?4)",
                params!["10.0.0.5", 25565, 25577, "active"],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO servers (real_ip, real_port, proxy_port, status) VALUES (?1, ?2, ?3, ?4)",
                params!["10.0.0.6", 25565, 25578, "inactive"],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO servers (real_ip, real_port, proxy_port, status) VALUES (?1, ?2, ?3, ?4)",
                params!["10.0.0.7", 25565, 70000, "active"],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO bans (ip, reason) VALUES (?1, ?2)",
                params!["192.0.2.1", "Manual ban"],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO bans (ip, expires_at) VALUES (?1, ?2)",
                params!["192.0.2.2", "2001-01-01 00:00:00"],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO bans (ip, is_active) VALUES (?1, 0)",
                params!["192.0.2.3"],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO bans (ip, expires_at) VALUES (?1, ?2)",
                params!["192.0.2.4", 4_102_444_800i64],
            )
            .unwrap();
        }
        source
    }

    #[tokio::test]
    async fn test_active_servers() {
        let source = seeded();
        let servers = source.active_servers().await.unwrap();

        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].proxy_port, 25577);
        assert_eq!(servers[0].backend_host, "10.0.0.5");
        assert_eq!(servers[0].backend_port, 25565);
        assert!(servers[0].is_active());
    }

    #[tokio::test]
    async fn test_bans_include_expiry() {
        let source = seeded();
        let bans = source.bans().await.unwrap();

        let addresses: Vec<&str> = bans.iter().map(|b| b.address.as_str()).collect();
        assert_eq!(addresses, vec!["192.0.2.1", "192.0.2.2", "192.0.2.4"]);

        assert!(bans[0].expires_at.is_none());
        assert_eq!(bans[1].expires_at.unwrap().year(), 2001);
        assert_eq!(bans[2].expires_at.unwrap().year(), 2100);
    }

    #[tokio::test]
    async fn test_rows_with_wrong_value_types_are_skipped() {
        let source = SqliteSource::open_in_memory().unwrap();
        {
            let conn = source.conn.lock().unwrap();
            conn.execute_batch(
                r#"
                INSERT INTO servers (real_ip, real_port, proxy_port) VALUES ('10.0.0.8', 'mc-port', 25580);
                INSERT INTO servers (real_ip, real_port, proxy_port) VALUES (X'0a00', 25565, 25581);
                INSERT INTO servers (real_ip, real_port, proxy_port) VALUES ('10.0.0.9', 25565, 2.5);
                INSERT INTO servers (real_ip, real_port, proxy_port) VALUES ('10.0.0.10', 25565, 25582);
                INSERT INTO bans (ip) VALUES (X'c0000201');
                INSERT INTO bans (ip) VALUES ('192.0.2.9');
                "#,
            )
            .unwrap();
        }

        let servers = source.active_servers().await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].proxy_port, 25582);
        assert_eq!(servers[0].backend_host, "10.0.0.10");

        let bans = source.bans().await.unwrap();
        assert_eq!(bans.len(), 1);
        assert_eq!(bans[0].address, "192.0.2.9");
        assert!(bans[0].expires_at.is_none());
    }

    #[test]
    fn test_parse_expiry_formats() {
        let sqlite = parse_expiry("2030-05-06 07:08:09").unwrap();
        assert_eq!(sqlite.year(), 2030);
        assert_eq!(sqlite.hour(), 7);

        assert!(parse_expiry("2030-05-06 07:08:09.250").is_some());
        assert!(parse_expiry("2030-05-06T07:08:09").is_some());

        let rfc = parse_expiry("2030-05-06T09:08:09+02:00").unwrap();
        assert_eq!(rfc, sqlite);

        assert!(parse_expiry("").is_none());
        assert!(parse_expiry("tomorrow").is_none());
    }

    #[test]
    fn test_open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("shield.db");
        SqliteSource::open(&path).unwrap();
        assert!(path.exists());
    }
}
