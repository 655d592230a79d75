//! presence-store: SQLite persistence for identities, templates and
//! attendance events.
//!
//! One [`Store`] owns one connection. Every trait call runs as a single
//! transaction; registration takes the write lock up front (IMMEDIATE) so the
//! identity lookup and insert cannot interleave with another writer.

use chrono::{Local, NaiveDateTime};
use presence_core::attendance::{AttendanceAction, AttendanceEvent, LastAction, TimePeriod};
use presence_core::repository::{
    AttendanceRecorder, EnrolledIdentity, Identity, StoreError, TemplateStore,
};
use presence_core::types::{Embedding, EMBEDDING_DIM};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS identities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    handle TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS templates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id INTEGER NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
    embedding BLOB NOT NULL,
    model_version TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_templates_identity ON templates(identity_id, id);

CREATE TABLE IF NOT EXISTS attendance_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id INTEGER NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
    action TEXT NOT NULL CHECK(action IN ('check_in', 'check_out')),
    score REAL NOT NULL,
    time_period TEXT NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_identity_time
    ON attendance_events(identity_id, timestamp, id);
";

type Result<T> = std::result::Result<T, StoreError>;

/// Map SQLite failures onto the storage error vocabulary.
trait SqlResultExt<T> {
    fn store(self) -> Result<T>;
}

impl<T> SqlResultExt<T> for rusqlite::Result<T> {
    fn store(self) -> Result<T> {
        self.map_err(classify)
    }
}

fn classify(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::ConstraintViolation
                if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                StoreError::Conflict(err.to_string())
            }
            ErrorCode::ConstraintViolation => StoreError::Corrupt(err.to_string()),
            ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => StoreError::Corrupt(err.to_string()),
            _ => StoreError::Unavailable(err.to_string()),
        },
        rusqlite::Error::FromSqlConversionFailure(..)
        | rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::IntegralValueOutOfRange(..) => StoreError::Corrupt(err.to_string()),
        _ => StoreError::Unavailable(err.to_string()),
    }
}

fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// SQLite-backed template store and attendance recorder.
pub struct Store {
    conn: Connection,
    clock: fn() -> NaiveDateTime,
}

impl Store {
    /// Open or create the database at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("create {}: {e}", parent.display()))
            })?;
        }

        let conn = Connection::open(path).store()?;
        conn.busy_timeout(BUSY_TIMEOUT).store()?;
        let store = Self::init(conn)?;
        tracing::info!(path = %path.display(), "attendance store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().store()?)
    }

    /// Replace the wall clock used to stamp attendance events.
    pub fn with_clock(mut self, clock: fn() -> NaiveDateTime) -> Self {
        self.clock = clock;
        self
    }

    /// How long a writer waits for another connection's lock.
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<()> {
        self.conn.busy_timeout(timeout).store()
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", 1).store()?;
        conn.execute_batch(SCHEMA_SQL).store()?;
        Ok(Self { conn, clock: local_now })
    }

    /// Number of templates stored for `handle`; 0 when unknown.
    pub fn template_count(&self, handle: &str) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM templates t
                 JOIN identities i ON t.identity_id = i.id
                 WHERE i.handle = ?1",
                params![handle],
                |row| row.get(0),
            )
            .store()?;
        to_usize(count)
    }

    fn identity_id(conn: &Connection, handle: &str) -> Result<Option<i64>> {
        conn.query_row("SELECT id FROM identities WHERE handle = ?1", params![handle], |row| {
            row.get(0)
        })
        .optional()
        .store()
    }
}

impl TemplateStore for Store {
    fn add_template(&mut self, handle: &str, template: &Embedding) -> Result<usize> {
        let now = (self.clock)();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .store()?;

        let identity_id = match Self::identity_id(&tx, handle)? {
            Some(id) => id,
            None => {
                tx.execute(
                    "INSERT INTO identities (handle, created_at) VALUES (?1, ?2)",
                    params![handle, now],
                )
                .store()?;
                tracing::info!(handle, "identity created");
                tx.last_insert_rowid()
            }
        };

        tx.execute(
            "INSERT INTO templates (identity_id, embedding, model_version, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                identity_id,
                encode_embedding(template.values()),
                template.model_version,
                now
            ],
        )
        .store()?;

        let count: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM templates WHERE identity_id = ?1",
                params![identity_id],
                |row| row.get(0),
            )
            .store()?;

        tx.commit().store()?;
        to_usize(count)
    }

    fn templates(&self, handle: &str) -> Result<Vec<Embedding>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT t.embedding, t.model_version FROM templates t
                 JOIN identities i ON t.identity_id = i.id
                 WHERE i.handle = ?1
                 ORDER BY t.id",
            )
            .store()?;
        let rows = stmt
            .query_map(params![handle], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Option<String>>(1)?))
            })
            .store()?;

        let mut out = Vec::new();
        for row in rows {
            let (blob, model_version) = row.store()?;
            out.push(decode_embedding(&blob, model_version)?);
        }
        Ok(out)
    }

    fn enrolled(&self) -> Result<Vec<EnrolledIdentity>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT i.handle, t.embedding, t.model_version FROM identities i
                 JOIN templates t ON t.identity_id = i.id
                 ORDER BY i.handle, t.id",
            )
            .store()?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })
            .store()?;

        let mut out: Vec<EnrolledIdentity> = Vec::new();
        for row in rows {
            let (handle, blob, model_version) = row.store()?;
            let embedding = decode_embedding(&blob, model_version)?;
            match out.last_mut() {
                Some(last) if last.handle == handle => last.templates.push(embedding),
                _ => out.push(EnrolledIdentity { handle, templates: vec![embedding] }),
            }
        }
        Ok(out)
    }

    fn identities(&self) -> Result<Vec<Identity>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT i.handle, i.created_at, COUNT(t.id) FROM identities i
                 LEFT JOIN templates t ON t.identity_id = i.id
                 GROUP BY i.id
                 ORDER BY i.handle",
            )
            .store()?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, NaiveDateTime>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .store()?;

        let mut out = Vec::new();
        for row in rows {
            let (handle, created_at, count) = row.store()?;
            out.push(Identity { handle, created_at, template_count: to_usize(count)? });
        }
        Ok(out)
    }

    fn remove_identity(&mut self, handle: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM identities WHERE handle = ?1", params![handle])
            .store()?;
        Ok(removed > 0)
    }
}

impl AttendanceRecorder for Store {
    fn record(
        &mut self,
        handle: &str,
        action: AttendanceAction,
        score: f32,
    ) -> Result<Option<AttendanceEvent>> {
        let now = (self.clock)();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .store()?;

        let Some(identity_id) = Self::identity_id(&tx, handle)? else {
            return Ok(None);
        };

        let previous: Option<NaiveDateTime> = tx
            .query_row(
                "SELECT MAX(timestamp) FROM attendance_events WHERE identity_id = ?1",
                params![identity_id],
                |row| row.get(0),
            )
            .store()?;

        // Per-identity event order never goes backwards, even if the clock does.
        let timestamp = match previous {
            Some(prev) if prev > now => {
                tracing::warn!(handle, %prev, %now, "clock behind last event; clamping timestamp");
                prev
            }
            _ => now,
        };
        let period = TimePeriod::from_timestamp(&timestamp);

        tx.execute(
            "INSERT INTO attendance_events (identity_id, action, score, time_period, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![identity_id, action.as_str(), score as f64, period.as_str(), timestamp],
        )
        .store()?;
        tx.commit().store()?;

        Ok(Some(AttendanceEvent {
            identity: handle.to_string(),
            action,
            score,
            period,
            timestamp,
        }))
    }

    fn last_action(&self, handle: &str) -> Result<Option<LastAction>> {
        let row = self
            .conn
            .query_row(
                "SELECT e.action, e.timestamp FROM attendance_events e
                 JOIN identities i ON e.identity_id = i.id
                 WHERE i.handle = ?1
                 ORDER BY e.timestamp DESC, e.id DESC
                 LIMIT 1",
                params![handle],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, NaiveDateTime>(1)?)),
            )
            .optional()
            .store()?;

        let Some((action, timestamp)) = row else {
            return Ok(None);
        };
        let action = action
            .parse::<AttendanceAction>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(Some(LastAction { action, timestamp }))
    }
}

fn encode_embedding(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(values));
    for &value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_embedding(blob: &[u8], model_version: Option<String>) -> Result<Embedding> {
    let expected_len = EMBEDDING_DIM * std::mem::size_of::<f32>();
    if blob.len() != expected_len {
        return Err(StoreError::Corrupt(format!(
            "embedding blob is {} bytes, expected {expected_len}",
            blob.len()
        )));
    }

    let values: Vec<f32> = blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    let mut embedding = Embedding::from_unit(values).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    embedding.model_version = model_version;
    Ok(embedding)
}

fn to_usize(value: i64) -> Result<usize> {
    usize::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative count {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn emb(components: &[(usize, f32)]) -> Embedding {
        let mut v = vec![0.0; EMBEDDING_DIM];
        for &(i, x) in components {
            v[i] = x;
        }
        let mut e = Embedding::new(v).unwrap();
        e.model_version = Some("w600k_mbf".to_string());
        e
    }

    fn at_nine() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 9).unwrap().and_hms_opt(9, 30, 0).unwrap()
    }

    fn at_seven() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 9).unwrap().and_hms_opt(7, 0, 0).unwrap()
    }

    fn at_noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 9).unwrap().and_hms_opt(12, 10, 0).unwrap()
    }

    fn temp_db_path() -> std::path::PathBuf {
        std::env::temp_dir()
            .join(format!("presence-store-test-{}", uuid::Uuid::new_v4()))
            .join("attendance.db")
    }

    #[test]
    fn test_add_template_counts_and_roundtrips() {
        let mut store = Store::open_in_memory().unwrap();
        let first = emb(&[(0, 1.0), (1, 0.5)]);
        let second = emb(&[(0, 0.9), (2, 0.4)]);

        assert_eq!(store.add_template("alice", &first).unwrap(), 1);
        assert_eq!(store.add_template("alice", &second).unwrap(), 2);
        assert_eq!(store.template_count("alice").unwrap(), 2);
        assert_eq!(store.template_count("bob").unwrap(), 0);

        let templates = store.templates("alice").unwrap();
        assert_eq!(templates, vec![first, second]);

        let aggregate = Embedding::aggregate(&templates).unwrap().unwrap();
        assert!(aggregate.is_unit());
    }

    #[test]
    fn test_unknown_identity_has_no_templates() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.templates("nobody").unwrap().is_empty());
    }

    #[test]
    fn test_enrolled_and_identities_ordered_by_handle() {
        let mut store = Store::open_in_memory().unwrap().with_clock(at_nine);
        store.add_template("zoe", &emb(&[(0, 1.0)])).unwrap();
        store.add_template("adam", &emb(&[(1, 1.0)])).unwrap();
        store.add_template("zoe", &emb(&[(2, 1.0)])).unwrap();

        let enrolled = store.enrolled().unwrap();
        let handles: Vec<&str> = enrolled.iter().map(|e| e.handle.as_str()).collect();
        assert_eq!(handles, ["adam", "zoe"]);
        assert_eq!(enrolled[1].templates.len(), 2);

        let identities = store.identities().unwrap();
        assert_eq!(identities.len(), 2);
        assert_eq!(identities[0].handle, "adam");
        assert_eq!(identities[0].template_count, 1);
        assert_eq!(identities[1].template_count, 2);
        assert_eq!(identities[1].created_at, at_nine());
    }

    #[test]
    fn test_record_unknown_identity_writes_nothing() {
        let mut store = Store::open_in_memory().unwrap();
        assert_eq!(store.record("ghost", AttendanceAction::CheckIn, 0.9).unwrap(), None);
        let events: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM attendance_events", [], |r| r.get(0))
            .unwrap();
        assert_eq!(events, 0);
    }

    #[test]
    fn test_record_assigns_period_and_last_action() {
        let mut store = Store::open_in_memory().unwrap().with_clock(at_nine);
        store.add_template("alice", &emb(&[(0, 1.0)])).unwrap();

        let event = store.record("alice", AttendanceAction::CheckIn, 0.83).unwrap().unwrap();
        assert_eq!(event.period, TimePeriod::Morning);
        assert_eq!(event.timestamp, at_nine());

        store.clock = at_noon;
        let event = store.record("alice", AttendanceAction::CheckOut, 0.71).unwrap().unwrap();
        assert_eq!(event.period, TimePeriod::Noon);

        let last = store.last_action("alice").unwrap().unwrap();
        assert_eq!(last, LastAction { action: AttendanceAction::CheckOut, timestamp: at_noon() });
        assert_eq!(store.last_action("bob").unwrap(), None);
    }

    #[test]
    fn test_record_clamps_clock_going_backwards() {
        let mut store = Store::open_in_memory().unwrap().with_clock(at_nine);
        store.add_template("alice", &emb(&[(0, 1.0)])).unwrap();
        store.record("alice", AttendanceAction::CheckIn, 0.8).unwrap();

        store.clock = at_seven;
        let event = store.record("alice", AttendanceAction::CheckOut, 0.8).unwrap().unwrap();
        assert_eq!(event.timestamp, at_nine());
        assert_eq!(event.period, TimePeriod::Morning);

        let last = store.last_action("alice").unwrap().unwrap();
        assert_eq!(last.action, AttendanceAction::CheckOut);
    }

    #[test]
    fn test_remove_identity_cascades() {
        let mut store = Store::open_in_memory().unwrap();
        store.add_template("alice", &emb(&[(0, 1.0)])).unwrap();
        store.record("alice", AttendanceAction::CheckIn, 0.9).unwrap();

        assert!(store.remove_identity("alice").unwrap());
        assert!(!store.remove_identity("alice").unwrap());

        let (templates, events): (i64, i64) = store
            .conn
            .query_row(
                "SELECT (SELECT COUNT(*) FROM templates), (SELECT COUNT(*) FROM attendance_events)",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!((templates, events), (0, 0));
    }

    #[test]
    fn test_truncated_blob_is_corrupt() {
        let mut store = Store::open_in_memory().unwrap();
        store.add_template("alice", &emb(&[(0, 1.0)])).unwrap();
        store
            .conn
            .execute("UPDATE templates SET embedding = x'00000000'", [])
            .unwrap();

        assert!(matches!(store.templates("alice"), Err(StoreError::Corrupt(_))));
        assert!(matches!(store.enrolled(), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_non_unit_blob_is_corrupt() {
        let mut store = Store::open_in_memory().unwrap();
        store.add_template("alice", &emb(&[(0, 1.0)])).unwrap();
        let doubled = encode_embedding(&[0.1f32; EMBEDDING_DIM]);
        store
            .conn
            .execute("UPDATE templates SET embedding = ?1", params![doubled])
            .unwrap();

        assert!(matches!(store.templates("alice"), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_duplicate_handle_maps_to_conflict() {
        let mut store = Store::open_in_memory().unwrap();
        store.add_template("alice", &emb(&[(0, 1.0)])).unwrap();
        let err = store
            .conn
            .execute(
                "INSERT INTO identities (handle, created_at) VALUES ('alice', '2026-01-01 00:00:00')",
                [],
            )
            .store()
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn test_schema_setup_is_idempotent() {
        let path = temp_db_path();
        {
            let mut store = Store::open(&path).unwrap();
            store.add_template("alice", &emb(&[(0, 1.0)])).unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.template_count("alice").unwrap(), 1);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_concurrent_writers_never_duplicate_identity() {
        let path = temp_db_path();
        let mut a = Store::open(&path).unwrap();
        let mut b = Store::open(&path).unwrap();

        // Another writer holds the lock: fail fast as unavailable, write nothing.
        b.set_busy_timeout(Duration::ZERO).unwrap();
        a.conn.execute_batch("BEGIN IMMEDIATE").unwrap();
        let err = b.add_template("alice", &emb(&[(0, 1.0)])).unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)), "{err:?}");
        a.conn.execute_batch("ROLLBACK").unwrap();

        // Both register the same new handle: one identity, two templates.
        assert_eq!(a.add_template("alice", &emb(&[(0, 1.0)])).unwrap(), 1);
        assert_eq!(b.add_template("alice", &emb(&[(1, 1.0)])).unwrap(), 2);

        let identities = a.identities().unwrap();
        assert_eq!(identities.len(), 1);
        assert_eq!(identities[0].template_count, 2);

        drop((a, b));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    mod pipeline {
        use super::*;
        use image::{ImageFormat, Rgb, RgbImage};
        use presence_core::detector::{DetectorError, FaceDetector};
        use presence_core::recognizer::{EmbeddingProvider, RecognizerError};
        use presence_core::types::BoundingBox;
        use presence_core::{
            FaceLocalizer, GeofencePolicy, IdentityMatcher, LocalizerConfig, Pipeline, QualityGate,
        };
        use std::io::Cursor;

        struct CentreDetector;

        impl FaceDetector for CentreDetector {
            fn name(&self) -> &'static str {
                "centre"
            }

            fn detect(&mut self, image: &RgbImage, _threshold: f32) -> std::result::Result<Vec<BoundingBox>, DetectorError> {
                let (w, h) = (image.width() as f32, image.height() as f32);
                Ok(vec![BoundingBox { x: w / 4.0, y: h / 4.0, width: w / 2.0, height: h / 2.0, confidence: 0.9 }])
            }
        }

        /// Direction of the crop's mean colour.
        struct MeanColour;

        impl EmbeddingProvider for MeanColour {
            fn embed(&mut self, face: &RgbImage) -> std::result::Result<Embedding, RecognizerError> {
                let mut raw = vec![0.0f32; EMBEDDING_DIM];
                for pixel in face.pixels() {
                    for c in 0..3 {
                        raw[c] += pixel.0[c] as f32;
                    }
                }
                Ok(Embedding::new(raw)?)
            }
        }

        fn photo(a: [u8; 3], b: [u8; 3]) -> Vec<u8> {
            let img = RgbImage::from_fn(64, 64, |x, y| if (x + y) % 2 == 0 { Rgb(a) } else { Rgb(b) });
            let mut bytes = Vec::new();
            img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();
            bytes
        }

        #[test]
        fn test_register_then_recognize_records_event() {
            let store = Store::open_in_memory().unwrap().with_clock(at_seven);
            let localizer = FaceLocalizer::new(vec![Box::new(CentreDetector)], LocalizerConfig::default());
            let mut pipeline = Pipeline::new(
                QualityGate::default(),
                localizer,
                MeanColour,
                store,
                IdentityMatcher::default(),
                GeofencePolicy::default(),
            );

            let alice = photo([250, 60, 60], [40, 10, 10]);
            let stranger = photo([60, 250, 60], [10, 40, 10]);

            let registered = pipeline.register("alice", &alice).unwrap().accepted().unwrap();
            assert_eq!(registered.embedding_count, 1);

            let miss = pipeline
                .recognize(&stranger, AttendanceAction::CheckIn, None, None)
                .unwrap()
                .accepted()
                .unwrap();
            assert!(!miss.recognized);
            assert!(miss.score.unwrap() < 0.6);

            let hit = pipeline
                .recognize(&alice, AttendanceAction::CheckIn, None, None)
                .unwrap()
                .accepted()
                .unwrap();
            assert_eq!(hit.identity.as_deref(), Some("alice"));
            assert_eq!(hit.event.unwrap().period, TimePeriod::Morning);

            let last = pipeline.last_action("alice").unwrap().unwrap();
            assert_eq!(last.action, AttendanceAction::CheckIn);
            assert_eq!(last.timestamp, at_seven());
        }
    }
}
