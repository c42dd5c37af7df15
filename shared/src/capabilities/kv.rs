use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

pub const MAX_VALUE_SIZE: usize = 5 * 1024 * 1024;

/// Keys the app persists in durable local storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    LastKnownLocation,
    AppTheme,
}

impl CacheKey {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheKey::LastKnownLocation => "lastKnownLocation",
            CacheKey::AppTheme => "app-theme",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("serialization error for {key}: {message}")]
    Serialization { key: &'static str, message: String },

    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable string storage, the equivalent of the browser's localStorage.
pub trait LocalCache: Send + Sync {
    fn get(&self, key: CacheKey) -> Result<Option<String>, CacheError>;
    fn set(&self, key: CacheKey, value: &str) -> Result<(), CacheError>;
    fn remove(&self, key: CacheKey) -> Result<(), CacheError>;
}

fn check_size(value: &str) -> Result<(), CacheError> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(CacheError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

pub fn get_json<T: DeserializeOwned>(
    cache: &dyn LocalCache,
    key: CacheKey,
) -> Result<Option<T>, CacheError> {
    match cache.get(key)? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| CacheError::Serialization {
                key: key.as_str(),
                message: e.to_string(),
            }),
        None => Ok(None),
    }
}

pub fn set_json<T: Serialize>(
    cache: &dyn LocalCache,
    key: CacheKey,
    value: &T,
) -> Result<(), CacheError> {
    let raw = serde_json::to_string(value).map_err(|e| CacheError::Serialization {
        key: key.as_str(),
        message: e.to_string(),
    })?;
    cache.set(key, &raw)
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<CacheKey, String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, String>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LocalCache for MemoryCache {
    fn get(&self, key: CacheKey) -> Result<Option<String>, CacheError> {
        Ok(self.lock().get(&key).cloned())
    }

    fn set(&self, key: CacheKey, value: &str) -> Result<(), CacheError> {
        check_size(value)?;
        self.lock().insert(key, value.to_string());
        Ok(())
    }

    fn remove(&self, key: CacheKey) -> Result<(), CacheError> {
        self.lock().remove(&key);
        Ok(())
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use self::sqlite::SqliteCache;

#[cfg(not(target_arch = "wasm32"))]
mod sqlite {
    use super::{check_size, CacheError, CacheKey, LocalCache};
    use crate::model::UnixTimeMs;
    use rusqlite::{params, Connection, OptionalExtension};
    use std::path::Path;
    use std::sync::Mutex;

    fn storage_err(e: rusqlite::Error) -> CacheError {
        CacheError::Storage(e.to_string())
    }

    /// SQLite-backed cache for native builds.
    pub struct SqliteCache {
        conn: Mutex<Connection>,
    }

    impl SqliteCache {
        pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
            let conn = Connection::open(path).map_err(storage_err)?;
            Self::init(conn)
        }

        pub fn open_in_memory() -> Result<Self, CacheError> {
            let conn = Connection::open_in_memory().map_err(storage_err)?;
            Self::init(conn)
        }

        fn init(conn: Connection) -> Result<Self, CacheError> {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS local_cache (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                "#,
            )
            .map_err(storage_err)?;
            Ok(Self {
                conn: Mutex::new(conn),
            })
        }

        fn with_conn<T>(
            &self,
            f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
        ) -> Result<T, CacheError> {
            let conn = self
                .conn
                .lock()
                .map_err(|_| CacheError::Storage("cache lock poisoned".into()))?;
            f(&conn).map_err(storage_err)
        }
    }

    impl LocalCache for SqliteCache {
        fn get(&self, key: CacheKey) -> Result<Option<String>, CacheError> {
            self.with_conn(|conn| {
                conn.query_row(
                    "SELECT value FROM local_cache WHERE key = ?1",
                    params![key.as_str()],
                    |row| row.get(0),
                )
                .optional()
            })
        }

        fn set(&self, key: CacheKey, value: &str) -> Result<(), CacheError> {
            check_size(value)?;
            let now = UnixTimeMs::now().0 as i64;
            self.with_conn(|conn| {
                conn.execute(
                    r#"
                    INSERT INTO local_cache (key, value, updated_at) VALUES (?1, ?2, ?3)
                    ON CONFLICT(key) DO UPDATE SET
                        value = excluded.value,
                        updated_at = excluded.updated_at
                    "#,
                    params![key.as_str(), value, now],
                )
                .map(|_| ())
            })
        }

        fn remove(&self, key: CacheKey) -> Result<(), CacheError> {
            self.with_conn(|conn| {
                conn.execute("DELETE FROM local_cache WHERE key = ?1", params![key.as_str()])
                    .map(|_| ())
            })
        }
    }
}
