// Database schema types and row mappers

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use crate::error::{MediaError, Result};
use crate::metadata::MediaMetadata;

/// Current wall clock in unix milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Text-backed enum with SQL conversions.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s.to_ascii_uppercase().as_str() {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                $name::parse(text).ok_or_else(|| {
                    FromSqlError::Other(format!("unknown {} '{}'", stringify!($name), text).into())
                })
            }
        }
    };
}

text_enum!(AssetStatus {
    New => "NEW",
    Indexing => "INDEXING",
    Indexed => "INDEXED",
    Failed => "FAILED",
    Missing => "MISSING",
});

text_enum!(TaskKind {
    Parse => "PARSE",
    Thumbnail => "THUMBNAIL",
    Fingerprint => "FINGERPRINT",
});

text_enum!(TaskStatus {
    Pending => "PENDING",
    Processing => "PROCESSING",
    Done => "DONE",
    Failed => "FAILED",
});

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

// ----- Scope -----

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "lowercase")]
pub enum Scope {
    Global,
    Private { project_id: String },
}

impl Scope {
    pub fn private(project_id: &str) -> Self {
        Scope::Private { project_id: project_id.to_string() }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Private { .. } => "private",
        }
    }

    pub fn project_id(&self) -> Option<&str> {
        match self {
            Scope::Global => None,
            Scope::Private { project_id } => Some(project_id.as_str()),
        }
    }

    /// Build from the stored columns. Private requires a non-empty project id.
    pub fn from_parts(scope: &str, project_id: Option<String>) -> Result<Self> {
        match scope.to_ascii_lowercase().as_str() {
            "global" => Ok(Scope::Global),
            "private" => match project_id {
                Some(id) if !id.trim().is_empty() => Ok(Scope::Private { project_id: id }),
                _ => Err(MediaError::InvalidScope(
                    "private scope requires a project id".to_string(),
                )),
            },
            other => Err(MediaError::InvalidScope(format!("unknown scope '{}'", other))),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Global => f.write_str("global"),
            Scope::Private { project_id } => write!(f, "private:{}", project_id),
        }
    }
}

// ----- Asset -----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: String,
    pub path: String,
    pub size: i64,
    pub mtime: i64,
    pub fingerprint: Option<String>,
    pub scope: Scope,
    pub status: AssetStatus,
    pub parent_asset_id: Option<String>,
    pub format: Option<String>,
    /// Serialized MediaMetadata
    pub metadata: Option<String>,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Asset {
    pub fn media_metadata(&self) -> Result<Option<MediaMetadata>> {
        match &self.metadata {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    /// Lowercase extension without the dot, empty when there is none
    pub fn extension(&self) -> String {
        crate::metadata::extension_of(std::path::Path::new(&self.path))
    }
}

pub const ASSET_COLUMNS: &str = "id, path, size, mtime, fingerprint, scope, project_id, status, \
     parent_asset_id, format, metadata, attempts, last_error, created_at, updated_at";

pub fn asset_from_row(row: &Row) -> rusqlite::Result<Asset> {
    let scope_name: String = row.get(5)?;
    let project_id: Option<String> = row.get(6)?;
    let scope = Scope::from_parts(&scope_name, project_id).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, e.to_string().into())
    })?;

    Ok(Asset {
        id: row.get(0)?,
        path: row.get(1)?,
        size: row.get(2)?,
        mtime: row.get(3)?,
        fingerprint: row.get(4)?,
        scope,
        status: row.get(7)?,
        parent_asset_id: row.get(8)?,
        format: row.get(9)?,
        metadata: row.get(10)?,
        attempts: row.get(11)?,
        last_error: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

// ----- Thumbnail -----

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    pub asset_id: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

// ----- MediaTask -----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaTask {
    pub id: i64,
    pub asset_id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub not_before: i64,
    pub enqueued_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

pub const TASK_COLUMNS: &str = "id, asset_id, kind, status, attempts, last_error, not_before, \
     enqueued_at, started_at, finished_at";

pub fn task_from_row(row: &Row) -> rusqlite::Result<MediaTask> {
    Ok(MediaTask {
        id: row.get(0)?,
        asset_id: row.get(1)?,
        kind: row.get(2)?,
        status: row.get(3)?,
        attempts: row.get(4)?,
        last_error: row.get(5)?,
        not_before: row.get(6)?,
        enqueued_at: row.get(7)?,
        started_at: row.get(8)?,
        finished_at: row.get(9)?,
    })
}

// ----- EventLog -----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub topic: String,
    pub event_type: String,
    pub subject_id: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: i64,
}

pub fn event_from_row(row: &Row) -> rusqlite::Result<EventRecord> {
    let raw: String = row.get(4)?;
    let payload = serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(EventRecord {
        id: row.get(0)?,
        topic: row.get(1)?,
        event_type: row.get(2)?,
        subject_id: row.get(3)?,
        payload,
        created_at: row.get(5)?,
    })
}
