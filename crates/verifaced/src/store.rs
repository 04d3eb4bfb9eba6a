//! SQLite persistence for identities, embeddings and audit logs.
//!
//! The relational layout is load-bearing: external evaluation tooling and
//! the retention pipeline read these tables directly, so column names and
//! types must not drift. Embedding vectors are stored as packed
//! little-endian `f32` blobs alongside their dimension, model version and
//! L2 norm.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use thiserror::Error;
use tokio_rusqlite::Connection;
use veriface_core::metrics::LogProjection;
use veriface_core::{Decision, Descriptor, Pose, DESCRIPTOR_DIM};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("invalid embedding dimension: {0} (expected {DESCRIPTOR_DIM})")]
    InvalidDim(usize),
    #[error("invalid embedding value (NaN/Inf)")]
    InvalidValue,
    #[error("corrupt pose label in PoseEmbeddings: {0:?}")]
    CorruptPose(String),
    #[error("Dim column says {dim} but the vector blob holds {bytes} bytes")]
    DimBlobMismatch { dim: i64, bytes: usize },
}

/// Decision column values, the core decisions plus the enrollment marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogDecision {
    Allow,
    StepUp,
    // Fail-closed default for partially populated entries.
    #[default]
    Deny,
    Enroll,
}

impl LogDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogDecision::Allow => "ALLOW",
            LogDecision::StepUp => "STEP_UP",
            LogDecision::Deny => "DENY",
            LogDecision::Enroll => "ENROLL",
        }
    }
}

impl From<Decision> for LogDecision {
    fn from(d: Decision) -> Self {
        match d {
            Decision::Allow => LogDecision::Allow,
            Decision::StepUp => LogDecision::StepUp,
            Decision::Deny => LogDecision::Deny,
        }
    }
}

/// One append-only audit row. Written once per completed attempt, never
/// updated. The lab-evaluation fields stay `None` in production traffic.
#[derive(Debug, Clone, Default)]
pub struct AuditLogEntry {
    pub user_id: Option<i64>,
    pub similarity: Option<f64>,
    pub decision: LogDecision,
    /// Coarse PAD verdict string ("PASS"/"FAIL") kept for layout compat.
    pub pad_result: Option<String>,
    pub purpose: Option<String>,
    pub ip: Option<String>,
    pub device_info: Option<String>,
    pub geo: Option<String>,
    pub pad_prob_min: Option<f64>,
    pub pad_prob_max: Option<f64>,
    pub pad_prob_avg: Option<f64>,
    pub pad_passed: Option<bool>,
    pub is_bona_fide: Option<bool>,
    pub attack_type: Option<String>,
    pub duration_ms: Option<i64>,
    pub at: i64,
}

/// SQLite-backed store. Cheap to clone; the connection is shared.
#[derive(Clone)]
pub struct AuthStore {
    conn: Connection,
}

impl AuthStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA foreign_keys = ON;

                 CREATE TABLE IF NOT EXISTS Users(
                     UserId       INTEGER PRIMARY KEY AUTOINCREMENT,
                     Phone        TEXT,
                     Email        TEXT,
                     Status       TEXT NOT NULL DEFAULT 'ACTIVE',
                     CreatedAt    INTEGER NOT NULL,
                     UpdatedAt    INTEGER NOT NULL,
                     PasswordHash TEXT,
                     PasswordSalt TEXT
                 );

                 CREATE TABLE IF NOT EXISTS UserEmbeddings(
                     UserId       INTEGER PRIMARY KEY REFERENCES Users(UserId) ON DELETE CASCADE,
                     Vector       BLOB NOT NULL,
                     Dim          INTEGER NOT NULL,
                     ModelVersion TEXT NOT NULL,
                     L2Norm       REAL NOT NULL,
                     CreatedAt    INTEGER NOT NULL
                 );

                 CREATE TABLE IF NOT EXISTS PoseEmbeddings(
                     UserId       INTEGER NOT NULL REFERENCES Users(UserId) ON DELETE CASCADE,
                     Pose         TEXT NOT NULL CHECK (Pose IN ('front','left','right')),
                     Vector       BLOB NOT NULL,
                     Dim          INTEGER NOT NULL,
                     ModelVersion TEXT NOT NULL,
                     L2Norm       REAL NOT NULL,
                     CreatedAt    INTEGER NOT NULL,
                     PRIMARY KEY (UserId, Pose)
                 );

                 CREATE TABLE IF NOT EXISTS AuthLogs(
                     LogId      INTEGER PRIMARY KEY AUTOINCREMENT,
                     UserId     INTEGER REFERENCES Users(UserId) ON DELETE SET NULL,
                     Similarity REAL,
                     Decision   TEXT NOT NULL CHECK (Decision IN ('ALLOW','STEP_UP','DENY','ENROLL')),
                     PadResult  TEXT,
                     Purpose    TEXT,
                     Ip         TEXT,
                     DeviceInfo TEXT,
                     Geo        TEXT,
                     PadProbMin REAL,
                     PadProbMax REAL,
                     PadProbAvg REAL,
                     PadPassed  INTEGER,
                     IsBonaFide INTEGER,
                     AttackType TEXT,
                     DurationMs INTEGER,
                     At         INTEGER NOT NULL
                 );",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    /// Create an identity row. Returns the new user id.
    pub async fn create_user(
        &self,
        phone: Option<String>,
        email: Option<String>,
    ) -> Result<i64, StoreError> {
        let now = chrono::Utc::now().timestamp();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO Users(Phone, Email, Status, CreatedAt, UpdatedAt)
                     VALUES (?1, ?2, 'ACTIVE', ?3, ?3)",
                    rusqlite::params![phone, email, now],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(StoreError::from)
    }

    /// Resolve a user by phone or email. Credential matching only — any
    /// password verification happens upstream.
    pub async fn lookup_user_by_credential(
        &self,
        credential: &str,
    ) -> Result<Option<i64>, StoreError> {
        let credential = credential.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT UserId FROM Users WHERE Phone = ?1 OR Email = ?1 LIMIT 1",
                )?;
                let id = stmt
                    .query_row([&credential], |row| row.get::<_, i64>(0))
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                Ok(id)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Upsert one pose descriptor for a user.
    pub async fn save_pose_embedding(
        &self,
        user_id: i64,
        pose: Pose,
        descriptor: &Descriptor,
        model_version: &str,
    ) -> Result<(), StoreError> {
        validate_values(descriptor.values())?;
        let blob = descriptor.to_le_bytes();
        let dim = descriptor.values().len() as i64;
        let l2 = (descriptor.l2_norm() + 1e-9) as f64;
        let now = chrono::Utc::now().timestamp();
        let model_version = model_version.to_string();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO PoseEmbeddings(UserId, Pose, Vector, Dim, ModelVersion, L2Norm, CreatedAt)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(UserId, Pose) DO UPDATE SET
                       Vector = excluded.Vector, Dim = excluded.Dim,
                       ModelVersion = excluded.ModelVersion, L2Norm = excluded.L2Norm,
                       CreatedAt = excluded.CreatedAt",
                    rusqlite::params![user_id, pose.as_str(), blob, dim, model_version, l2, now],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    /// Upsert the single mean vector kept for single-image verification
    /// compatibility.
    pub async fn save_mean_embedding(
        &self,
        user_id: i64,
        descriptor: &Descriptor,
        model_version: &str,
    ) -> Result<(), StoreError> {
        validate_values(descriptor.values())?;
        let blob = descriptor.to_le_bytes();
        let dim = descriptor.values().len() as i64;
        let l2 = (descriptor.l2_norm() + 1e-9) as f64;
        let now = chrono::Utc::now().timestamp();
        let model_version = model_version.to_string();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO UserEmbeddings(UserId, Vector, Dim, ModelVersion, L2Norm, CreatedAt)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(UserId) DO UPDATE SET
                       Vector = excluded.Vector, Dim = excluded.Dim,
                       ModelVersion = excluded.ModelVersion, L2Norm = excluded.L2Norm,
                       CreatedAt = excluded.CreatedAt",
                    rusqlite::params![user_id, blob, dim, model_version, l2, now],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    /// Raw pose descriptor blobs for a user. Decoding is the codec's job —
    /// rows predate the current model and may carry historical encodings.
    pub async fn get_pose_embeddings(
        &self,
        user_id: i64,
    ) -> Result<HashMap<Pose, Vec<u8>>, StoreError> {
        let rows: Vec<(String, Vec<u8>, i64)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare("SELECT Pose, Vector, Dim FROM PoseEmbeddings WHERE UserId = ?1")?;
                let rows = stmt.query_map([user_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for (pose_str, blob, dim) in rows {
            let pose = Pose::from_str(&pose_str).map_err(|_| StoreError::CorruptPose(pose_str))?;
            // The Dim column must describe the whole blob. Never cut the blob
            // down to it: a mislabeled legacy vector has to reach the codec
            // intact so it fails there, not pass as its own prefix.
            let expected = dim.max(0) as usize * 4;
            if expected != blob.len() {
                return Err(StoreError::DimBlobMismatch {
                    dim,
                    bytes: blob.len(),
                });
            }
            out.insert(pose, blob);
        }
        Ok(out)
    }

    /// Raw mean-vector blob for a user, if one has been saved.
    pub async fn get_mean_embedding(&self, user_id: i64) -> Result<Option<Vec<u8>>, StoreError> {
        self.conn
            .call(move |conn| {
                let blob = conn
                    .query_row(
                        "SELECT Vector FROM UserEmbeddings WHERE UserId = ?1",
                        [user_id],
                        |row| row.get::<_, Vec<u8>>(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                Ok(blob)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Append one audit row. Returns the log id.
    pub async fn append_auth_log(&self, entry: &AuditLogEntry) -> Result<i64, StoreError> {
        let entry = entry.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO AuthLogs
                       (UserId, Similarity, Decision, PadResult, Purpose, Ip, DeviceInfo, Geo,
                        PadProbMin, PadProbMax, PadProbAvg, PadPassed, IsBonaFide, AttackType,
                        DurationMs, At)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                    rusqlite::params![
                        entry.user_id,
                        entry.similarity,
                        entry.decision.as_str(),
                        entry.pad_result,
                        entry.purpose,
                        entry.ip,
                        entry.device_info,
                        entry.geo,
                        entry.pad_prob_min,
                        entry.pad_prob_max,
                        entry.pad_prob_avg,
                        entry.pad_passed.map(i64::from),
                        entry.is_bona_fide.map(i64::from),
                        entry.attack_type,
                        entry.duration_ms,
                        entry.at,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(StoreError::from)
    }

    /// Evaluation projection of the audit log, optionally bounded by epoch
    /// seconds (inclusive).
    pub async fn export_logs(
        &self,
        t0: Option<i64>,
        t1: Option<i64>,
    ) -> Result<Vec<LogProjection>, StoreError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT Similarity, IsBonaFide, PadProbMin, PadPassed, Decision, Purpose,
                            AttackType, DurationMs, At
                     FROM AuthLogs
                     WHERE (?1 IS NULL OR At >= ?1) AND (?2 IS NULL OR At <= ?2)
                     ORDER BY LogId",
                )?;
                let rows = stmt.query_map(rusqlite::params![t0, t1], |row| {
                    Ok(LogProjection {
                        sim: row.get(0)?,
                        bona: row.get(1)?,
                        pad_prob: row.get(2)?,
                        pad_ok: row.get(3)?,
                        decision: row.get(4)?,
                        purpose: row.get(5)?,
                        atk: row.get(6)?,
                        dur_ms: row.get(7)?,
                        at: row.get(8)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn count_users(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM Users", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }
}

fn validate_values(values: &[f32]) -> Result<(), StoreError> {
    if values.len() != DESCRIPTOR_DIM {
        return Err(StoreError::InvalidDim(values.len()));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::InvalidValue);
    }
    Ok(())
}
