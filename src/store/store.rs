//! SQLite-backed storage for calls and their derived artefacts.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;
use uuid::Uuid;

use super::models::*;
use super::schema::CALL_DB_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::BASE_DB_VERSION;

/// Row returned by the paginated results listing.
#[derive(Debug)]
pub struct ResultListRow {
    pub record: CallRecord,
    pub operator_name: Option<String>,
    pub analysis: Option<Analysis>,
}

/// Storage operations used by the ingestion facade, the queue worker and
/// the HTTP handlers. Implementations must be safe to share across tasks.
pub trait CallStore: Send + Sync {
    // === Operators ===

    /// Find an operator by exact name without creating one. First match
    /// wins.
    fn find_operator_by_name(&self, name: &str) -> Result<Option<Operator>>;

    /// Find an operator by exact name or create one. First match wins.
    fn upsert_operator(&self, name: &str) -> Result<Operator>;

    fn get_operator(&self, id: &str) -> Result<Option<Operator>>;

    /// Distinct operator names for autocomplete, optionally filtered by
    /// a case-insensitive substring.
    fn list_operator_names(&self, q: Option<&str>, limit: usize) -> Result<Vec<String>>;

    fn count_operator_files(&self, operator_id: &str) -> Result<usize>;

    // === Files ===

    /// Insert a batch of freshly validated files in one transaction.
    fn insert_files(&self, files: &[CallRecord]) -> Result<()>;

    /// Insert a brand-new operator together with its batch of files in
    /// one transaction. Used by ingestion when the operator row must not
    /// outlive an aborted batch.
    fn insert_operator_and_files(&self, operator: &Operator, files: &[CallRecord]) -> Result<()>;

    fn get_file(&self, id: &str) -> Result<Option<CallRecord>>;

    /// Map of file_hash to file id for every non-failed file. The
    /// ingestion dedup scan runs against this snapshot.
    fn active_hash_index(&self) -> Result<HashMap<String, String>>;

    /// Advance status/stage/progress in one committed write.
    fn set_progress(&self, id: &str, status: FileStatus, stage: i32, progress: i32) -> Result<()>;

    /// Terminal failure: records the message and bumps retry_count.
    fn mark_failed(&self, id: &str, error: &str) -> Result<()>;

    /// Startup recovery: rewrite every running file to `queued`, leaving
    /// `stage` untouched so completed checkpoints are skipped on re-run.
    /// Returns the affected ids.
    fn recover_interrupted(&self) -> Result<Vec<String>>;

    fn list_results(&self, filter: &ResultsFilter) -> Result<ResultsPage<ResultListRow>>;

    // === Derived artefacts (one row per file, delete-then-insert) ===

    fn replace_transcription(&self, transcription: &Transcription) -> Result<()>;
    fn get_transcription(&self, file_id: &str) -> Result<Option<Transcription>>;

    fn replace_diarization(&self, diarization: &Diarization) -> Result<()>;
    fn get_diarization(&self, file_id: &str) -> Result<Option<Diarization>>;

    fn replace_analysis(&self, analysis: &Analysis) -> Result<()>;
    fn get_analysis(&self, file_id: &str) -> Result<Option<Analysis>>;

    /// Cheap connectivity probe for the health endpoint.
    fn ping(&self) -> Result<()>;
}

/// SQLite implementation of [`CallStore`].
pub struct SqliteCallStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCallStore {
    /// Open an existing database or create a new one with the current
    /// schema, running pending migrations as needed.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = if db_path.as_ref().exists() {
            Connection::open(&db_path)?
        } else {
            let conn = Connection::open(&db_path)?;
            CALL_DB_VERSIONED_SCHEMAS
                .last()
                .context("No schemas defined")?
                .create(&conn)?;
            info!("Created new call database at {:?}", db_path.as_ref());
            conn
        };

        conn.execute("PRAGMA foreign_keys = ON;", [])?;

        let db_version = conn
            .query_row("PRAGMA user_version;", [], |row| row.get::<usize, i64>(0))
            .context("Failed to read database version")?
            - BASE_DB_VERSION as i64;
        if db_version < 0 {
            bail!(
                "Call database version {} is too old, does not contain base db version {}",
                db_version,
                BASE_DB_VERSION
            );
        }
        let version = db_version as usize;

        let schema_count = CALL_DB_VERSIONED_SCHEMAS.len();
        if version >= schema_count {
            bail!(
                "Call database version {} is too new (max supported: {})",
                version,
                schema_count - 1
            );
        }

        Self::migrate_if_needed(&conn, version)?;

        CALL_DB_VERSIONED_SCHEMAS
            .last()
            .context("Failed to get schema")?
            .validate(&conn)?;

        Ok(SqliteCallStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for unit tests.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON;", [])?;
        CALL_DB_VERSIONED_SCHEMAS
            .last()
            .context("No schemas defined")?
            .create(&conn)?;
        Ok(SqliteCallStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn migrate_if_needed(conn: &Connection, current_version: usize) -> Result<()> {
        let target_version = CALL_DB_VERSIONED_SCHEMAS.len() - 1;
        if current_version >= target_version {
            return Ok(());
        }

        info!(
            "Migrating call database from version {} to {}",
            current_version, target_version
        );
        for schema in CALL_DB_VERSIONED_SCHEMAS.iter().skip(current_version + 1) {
            if let Some(migration_fn) = schema.migration {
                info!("Running call database migration to version {}", schema.version);
                migration_fn(conn)?;
            }
        }
        conn.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + target_version),
            [],
        )?;
        Ok(())
    }

    fn row_to_file(row: &rusqlite::Row) -> rusqlite::Result<CallRecord> {
        Ok(CallRecord {
            id: row.get("id")?,
            operator_id: row.get("operator_id")?,
            original_name: row.get("original_name")?,
            file_hash: row.get("file_hash")?,
            file_size: row.get("file_size")?,
            duration_sec: row.get("duration_sec")?,
            audio_path: row.get("audio_path")?,
            status: FileStatus::parse(&row.get::<_, String>("status")?)
                .unwrap_or(FileStatus::Queued),
            stage: row.get("stage")?,
            progress: row.get("progress")?,
            retry_count: row.get("retry_count")?,
            error_message: row.get("error_message")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            caller_phone: row.get("caller_phone")?,
            called_phone: row.get("called_phone")?,
            operator_phone: row.get("operator_phone")?,
            crm_duration: row.get("duration")?,
            order_id: row.get("order_id")?,
        })
    }

    fn row_to_analysis(row: &rusqlite::Row) -> rusqlite::Result<Analysis> {
        let quotes: Vec<ScoreQuote> = row
            .get::<_, Option<String>>("quotes")?
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        Ok(Analysis {
            id: row.get("id")?,
            file_id: row.get("file_id")?,
            standard: row.get("standard")?,
            loyalty: row.get("loyalty")?,
            kindness: row.get("kindness")?,
            overall: row.get("overall")?,
            summary: row.get("summary")?,
            quotes,
            model: row
                .get::<_, Option<String>>("llm_model")?
                .unwrap_or_default(),
            partial: row.get::<_, i32>("partial")? != 0,
            created_at: row.get("created_at")?,
        })
    }

    fn operator_by_name(conn: &Connection, name: &str) -> Result<Option<Operator>> {
        let existing = conn
            .query_row(
                "SELECT id, name, created_at FROM operators \
                 WHERE name = ?1 ORDER BY created_at LIMIT 1",
                params![name],
                |row| {
                    Ok(Operator {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(existing)
    }

    fn insert_operator_row(conn: &Connection, operator: &Operator) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO operators (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![operator.id, operator.name, operator.created_at],
        )?;
        Ok(())
    }

    fn insert_file_row(conn: &Connection, file: &CallRecord) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO files (
                id, operator_id, original_name, file_hash, file_size,
                duration_sec, audio_path, status, stage, progress,
                retry_count, error_message, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                file.id,
                file.operator_id,
                file.original_name,
                file.file_hash,
                file.file_size,
                file.duration_sec,
                file.audio_path,
                file.status.as_str(),
                file.stage,
                file.progress,
                file.retry_count,
                file.error_message,
                file.created_at,
                file.updated_at,
            ],
        )?;
        Ok(())
    }

    fn analysis_for(conn: &Connection, file_id: &str) -> Result<Option<Analysis>> {
        let result = conn
            .query_row(
                "SELECT * FROM analyses WHERE file_id = ?1",
                params![file_id],
                Self::row_to_analysis,
            )
            .optional()?;
        Ok(result)
    }
}

impl CallStore for SqliteCallStore {
    fn find_operator_by_name(&self, name: &str) -> Result<Option<Operator>> {
        let conn = self.conn.lock().unwrap();
        Self::operator_by_name(&conn, name)
    }

    fn upsert_operator(&self, name: &str) -> Result<Operator> {
        let conn = self.conn.lock().unwrap();
        if let Some(operator) = Self::operator_by_name(&conn, name)? {
            return Ok(operator);
        }

        let operator = Operator {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_at: chrono::Utc::now().timestamp(),
        };
        Self::insert_operator_row(&conn, &operator)?;
        Ok(operator)
    }

    fn get_operator(&self, id: &str) -> Result<Option<Operator>> {
        let conn = self.conn.lock().unwrap();
        let result = conn
            .query_row(
                "SELECT id, name, created_at FROM operators WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Operator {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    fn list_operator_names(&self, q: Option<&str>, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let names = match q {
            Some(q) => {
                let pattern = format!("%{}%", q);
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT name FROM operators \
                     WHERE name LIKE ?1 ORDER BY name LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![pattern, limit], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<Vec<String>>>()?
            }
            None => {
                let mut stmt =
                    conn.prepare("SELECT DISTINCT name FROM operators ORDER BY name LIMIT ?1")?;
                let rows = stmt.query_map(params![limit], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<Vec<String>>>()?
            }
        };
        Ok(names)
    }

    fn count_operator_files(&self, operator_id: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM files WHERE operator_id = ?1",
            params![operator_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn insert_files(&self, files: &[CallRecord]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for file in files {
            Self::insert_file_row(&tx, file)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn insert_operator_and_files(&self, operator: &Operator, files: &[CallRecord]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        Self::insert_operator_row(&tx, operator)?;
        for file in files {
            Self::insert_file_row(&tx, file)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_file(&self, id: &str) -> Result<Option<CallRecord>> {
        let conn = self.conn.lock().unwrap();
        let result = conn
            .query_row(
                "SELECT * FROM files WHERE id = ?1",
                params![id],
                Self::row_to_file,
            )
            .optional()?;
        Ok(result)
    }

    fn active_hash_index(&self) -> Result<HashMap<String, String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT file_hash, id FROM files WHERE status != 'failed'")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut index = HashMap::new();
        for row in rows {
            let (hash, id) = row?;
            index.entry(hash).or_insert(id);
        }
        Ok(index)
    }

    fn set_progress(&self, id: &str, status: FileStatus, stage: i32, progress: i32) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE files SET status = ?2, stage = ?3, progress = ?4, updated_at = ?5 \
             WHERE id = ?1",
            params![
                id,
                status.as_str(),
                stage,
                progress,
                chrono::Utc::now().timestamp()
            ],
        )?;
        Ok(())
    }

    fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE files SET status = 'failed', error_message = ?2, \
             retry_count = retry_count + 1, updated_at = ?3 WHERE id = ?1",
            params![id, error, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }

    fn recover_interrupted(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let ids = {
            let mut stmt = tx.prepare(
                "SELECT id FROM files \
                 WHERE status IN ('transcribing', 'diarizing', 'analyzing')",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<Vec<String>>>()?
        };
        // Stage is deliberately left alone: the orchestrator skips
        // completed checkpoints on re-entry.
        tx.execute(
            "UPDATE files SET status = 'queued', updated_at = ?1 \
             WHERE status IN ('transcribing', 'diarizing', 'analyzing')",
            params![chrono::Utc::now().timestamp()],
        )?;
        tx.commit()?;
        Ok(ids)
    }

    fn list_results(&self, filter: &ResultsFilter) -> Result<ResultsPage<ResultListRow>> {
        let conn = self.conn.lock().unwrap();

        let mut where_clauses: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(operator) = &filter.operator {
            where_clauses.push(format!(
                "operators.name LIKE ?{}",
                args.len() + 1
            ));
            args.push(Box::new(format!("%{}%", operator)));
        }
        if let Some(status) = filter.status {
            where_clauses.push(format!("files.status = ?{}", args.len() + 1));
            args.push(Box::new(status.as_str().to_string()));
        }
        if let Some(date_from) = filter.date_from {
            where_clauses.push(format!("files.created_at >= ?{}", args.len() + 1));
            args.push(Box::new(date_from));
        }
        if let Some(date_to) = filter.date_to {
            where_clauses.push(format!("files.created_at <= ?{}", args.len() + 1));
            args.push(Box::new(date_to));
        }
        if let Some(q) = &filter.q {
            where_clauses.push(format!("files.original_name LIKE ?{}", args.len() + 1));
            args.push(Box::new(format!("%{}%", q)));
        }
        if let Some(score_min) = filter.score_min {
            where_clauses.push(format!("analyses.overall >= ?{}", args.len() + 1));
            args.push(Box::new(score_min));
        }
        if let Some(score_max) = filter.score_max {
            where_clauses.push(format!("analyses.overall <= ?{}", args.len() + 1));
            args.push(Box::new(score_max));
        }

        let from = "FROM files \
                    LEFT JOIN operators ON operators.id = files.operator_id \
                    LEFT JOIN analyses ON analyses.file_id = files.id";
        let where_sql = if where_clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", where_clauses.join(" AND "))
        };

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            args.iter().map(|b| b.as_ref()).collect();

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) {}{}", from, where_sql),
            params_ref.as_slice(),
            |row| row.get(0),
        )?;
        let total = total as usize;

        let limit = filter.limit.max(1);
        let page = filter.page.max(1);
        let offset = (page - 1) * limit;

        let select_sql = format!(
            "SELECT files.*, operators.name AS operator_name {}{} \
             ORDER BY files.created_at DESC LIMIT {} OFFSET {}",
            from, where_sql, limit, offset
        );

        let mut stmt = conn.prepare(&select_sql)?;
        let file_rows = stmt
            .query_map(params_ref.as_slice(), |row| {
                let record = Self::row_to_file(row)?;
                let operator_name: Option<String> = row.get("operator_name")?;
                Ok((record, operator_name))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut items = Vec::with_capacity(file_rows.len());
        for (record, operator_name) in file_rows {
            let analysis = Self::analysis_for(&conn, &record.id)?;
            items.push(ResultListRow {
                record,
                operator_name,
                analysis,
            });
        }

        let pages = if total > 0 { total.div_ceil(limit) } else { 1 };
        Ok(ResultsPage {
            items,
            total,
            page,
            limit,
            pages,
        })
    }

    fn replace_transcription(&self, transcription: &Transcription) -> Result<()> {
        let words_json = serde_json::to_string(&transcription.words)?;
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM transcriptions WHERE file_id = ?1",
            params![transcription.file_id],
        )?;
        tx.execute(
            "INSERT INTO transcriptions (id, file_id, full_text, word_timings, language, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                transcription.id,
                transcription.file_id,
                transcription.full_text,
                words_json,
                transcription.language,
                transcription.created_at,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn get_transcription(&self, file_id: &str) -> Result<Option<Transcription>> {
        let conn = self.conn.lock().unwrap();
        let result = conn
            .query_row(
                "SELECT * FROM transcriptions WHERE file_id = ?1",
                params![file_id],
                |row| {
                    let words: Vec<WordTiming> = row
                        .get::<_, Option<String>>("word_timings")?
                        .and_then(|s| serde_json::from_str(&s).ok())
                        .unwrap_or_default();
                    Ok(Transcription {
                        id: row.get("id")?,
                        file_id: row.get("file_id")?,
                        full_text: row.get("full_text")?,
                        words,
                        language: row.get("language")?,
                        created_at: row.get("created_at")?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    fn replace_diarization(&self, diarization: &Diarization) -> Result<()> {
        let segments_json = serde_json::to_string(&diarization.segments)?;
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM diarizations WHERE file_id = ?1",
            params![diarization.file_id],
        )?;
        tx.execute(
            "INSERT INTO diarizations (id, file_id, segments, method, confidence, num_speakers, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                diarization.id,
                diarization.file_id,
                segments_json,
                diarization.method.as_str(),
                diarization.confidence,
                diarization.num_speakers,
                diarization.created_at,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn get_diarization(&self, file_id: &str) -> Result<Option<Diarization>> {
        let conn = self.conn.lock().unwrap();
        let result = conn
            .query_row(
                "SELECT * FROM diarizations WHERE file_id = ?1",
                params![file_id],
                |row| {
                    let segments: Vec<SpeakerSegment> = row
                        .get::<_, Option<String>>("segments")?
                        .and_then(|s| serde_json::from_str(&s).ok())
                        .unwrap_or_default();
                    let method = row
                        .get::<_, Option<String>>("method")?
                        .as_deref()
                        .and_then(DiarizationMethod::parse)
                        .unwrap_or(DiarizationMethod::Pyannote);
                    Ok(Diarization {
                        id: row.get("id")?,
                        file_id: row.get("file_id")?,
                        segments,
                        method,
                        confidence: row.get("confidence")?,
                        num_speakers: row.get::<_, Option<i32>>("num_speakers")?.unwrap_or(1),
                        created_at: row.get("created_at")?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    fn replace_analysis(&self, analysis: &Analysis) -> Result<()> {
        let quotes_json = serde_json::to_string(&analysis.quotes)?;
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM analyses WHERE file_id = ?1",
            params![analysis.file_id],
        )?;
        tx.execute(
            "INSERT INTO analyses (
                id, file_id, standard, loyalty, kindness, overall,
                summary, quotes, llm_model, partial, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                analysis.id,
                analysis.file_id,
                analysis.standard,
                analysis.loyalty,
                analysis.kindness,
                analysis.overall,
                analysis.summary,
                quotes_json,
                analysis.model,
                analysis.partial as i32,
                analysis.created_at,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn get_analysis(&self, file_id: &str) -> Result<Option<Analysis>> {
        let conn = self.conn.lock().unwrap();
        Self::analysis_for(&conn, file_id)
    }

    fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued_file(id: &str, hash: &str) -> CallRecord {
        CallRecord::new_queued(
            id.to_string(),
            "op1".to_string(),
            format!("{id}.wav"),
            hash.to_string(),
            2048,
            10.0,
            format!("/data/uploads/{id}.wav"),
        )
    }

    fn store_with_operator() -> (SqliteCallStore, Operator) {
        let store = SqliteCallStore::in_memory().unwrap();
        let operator = store.upsert_operator("Ivan").unwrap();
        (store, operator)
    }

    #[test]
    fn find_operator_by_name_does_not_create() {
        let store = SqliteCallStore::in_memory().unwrap();
        assert!(store.find_operator_by_name("Ivan").unwrap().is_none());
        assert!(store.list_operator_names(None, 20).unwrap().is_empty());

        let created = store.upsert_operator("Ivan").unwrap();
        let found = store.find_operator_by_name("Ivan").unwrap().unwrap();
        assert_eq!(found.id, created.id);
    }

    #[test]
    fn insert_operator_and_files_commits_both() {
        let store = SqliteCallStore::in_memory().unwrap();
        let operator = Operator {
            id: "op1".to_string(),
            name: "Ivan".to_string(),
            created_at: chrono::Utc::now().timestamp(),
        };
        let mut file = queued_file("f1", "hash1");
        file.operator_id = Some(operator.id.clone());

        store.insert_operator_and_files(&operator, &[file]).unwrap();

        assert!(store.get_operator("op1").unwrap().is_some());
        assert!(store.get_file("f1").unwrap().is_some());
    }

    #[test]
    fn insert_operator_and_files_rolls_back_operator_on_file_error() {
        let store = SqliteCallStore::in_memory().unwrap();
        store.insert_files(&[queued_file("f1", "hash1")]).unwrap();

        let operator = Operator {
            id: "op1".to_string(),
            name: "Ivan".to_string(),
            created_at: chrono::Utc::now().timestamp(),
        };
        // Conflicting primary key makes the second insert fail.
        let duplicate = queued_file("f1", "hash2");

        assert!(store
            .insert_operator_and_files(&operator, &[duplicate])
            .is_err());
        assert!(
            store.get_operator("op1").unwrap().is_none(),
            "operator must not survive an aborted batch"
        );
    }

    #[test]
    fn upsert_operator_is_first_wins() {
        let store = SqliteCallStore::in_memory().unwrap();
        let first = store.upsert_operator("Ivan").unwrap();
        let second = store.upsert_operator("Ivan").unwrap();
        assert_eq!(first.id, second.id);

        let other = store.upsert_operator("Petr").unwrap();
        assert_ne!(first.id, other.id);
    }

    #[test]
    fn insert_and_get_file() {
        let (store, operator) = store_with_operator();
        let mut file = queued_file("f1", "hash1");
        file.operator_id = Some(operator.id.clone());
        store.insert_files(&[file]).unwrap();

        let loaded = store.get_file("f1").unwrap().unwrap();
        assert_eq!(loaded.status, FileStatus::Queued);
        assert_eq!(loaded.stage, 0);
        assert_eq!(loaded.file_hash, "hash1");
        assert!(loaded.order_id.is_none());
    }

    #[test]
    fn active_hash_index_excludes_failed() {
        let (store, _) = store_with_operator();
        store
            .insert_files(&[queued_file("f1", "hash1"), queued_file("f2", "hash2")])
            .unwrap();
        store.mark_failed("f2", "boom").unwrap();

        let index = store.active_hash_index().unwrap();
        assert_eq!(index.get("hash1"), Some(&"f1".to_string()));
        assert!(!index.contains_key("hash2"));
    }

    #[test]
    fn mark_failed_bumps_retry_count() {
        let (store, _) = store_with_operator();
        store.insert_files(&[queued_file("f1", "hash1")]).unwrap();
        store.mark_failed("f1", "transcription failed").unwrap();

        let loaded = store.get_file("f1").unwrap().unwrap();
        assert_eq!(loaded.status, FileStatus::Failed);
        assert_eq!(loaded.retry_count, 1);
        assert_eq!(loaded.error_message.as_deref(), Some("transcription failed"));
    }

    #[test]
    fn recover_interrupted_requeues_but_keeps_stage() {
        let (store, _) = store_with_operator();
        store.insert_files(&[queued_file("f1", "hash1")]).unwrap();
        store
            .set_progress("f1", FileStatus::Diarizing, 1, 45)
            .unwrap();

        let recovered = store.recover_interrupted().unwrap();
        assert_eq!(recovered, vec!["f1".to_string()]);

        let loaded = store.get_file("f1").unwrap().unwrap();
        assert_eq!(loaded.status, FileStatus::Queued);
        assert_eq!(loaded.stage, 1, "stage must survive recovery");
        assert_eq!(loaded.progress, 45, "progress is preserved");
    }

    #[test]
    fn recover_interrupted_ignores_terminal_files() {
        let (store, _) = store_with_operator();
        store
            .insert_files(&[queued_file("f1", "h1"), queued_file("f2", "h2")])
            .unwrap();
        store.set_progress("f1", FileStatus::Done, 4, 100).unwrap();
        store.mark_failed("f2", "x").unwrap();

        assert!(store.recover_interrupted().unwrap().is_empty());
    }

    #[test]
    fn replace_transcription_is_idempotent() {
        let (store, _) = store_with_operator();
        store.insert_files(&[queued_file("f1", "hash1")]).unwrap();

        let make = |text: &str| Transcription {
            id: Uuid::new_v4().to_string(),
            file_id: "f1".to_string(),
            full_text: text.to_string(),
            words: vec![WordTiming {
                word: text.to_string(),
                start: 0.0,
                end: 1.0,
            }],
            language: "ru".to_string(),
            created_at: chrono::Utc::now().timestamp(),
        };

        store.replace_transcription(&make("first")).unwrap();
        store.replace_transcription(&make("second")).unwrap();

        let loaded = store.get_transcription("f1").unwrap().unwrap();
        assert_eq!(loaded.full_text, "second");
        assert_eq!(loaded.words.len(), 1);
    }

    #[test]
    fn replace_analysis_rejects_out_of_range_scores() {
        let (store, _) = store_with_operator();
        store.insert_files(&[queued_file("f1", "hash1")]).unwrap();

        let analysis = Analysis {
            id: Uuid::new_v4().to_string(),
            file_id: "f1".to_string(),
            standard: 120,
            loyalty: 50,
            kindness: 50,
            overall: 70,
            summary: "broken".to_string(),
            quotes: vec![],
            model: "gpt-4".to_string(),
            partial: false,
            created_at: chrono::Utc::now().timestamp(),
        };
        assert!(store.replace_analysis(&analysis).is_err());
    }

    #[test]
    fn analysis_round_trips_quotes() {
        let (store, _) = store_with_operator();
        store.insert_files(&[queued_file("f1", "hash1")]).unwrap();

        let analysis = Analysis {
            id: Uuid::new_v4().to_string(),
            file_id: "f1".to_string(),
            standard: 80,
            loyalty: 70,
            kindness: 90,
            overall: 80,
            summary: "solid call".to_string(),
            quotes: vec![ScoreQuote {
                text: "thanks for calling".to_string(),
                criterion: "standard".to_string(),
                sentiment: "positive".to_string(),
            }],
            model: "gpt-4".to_string(),
            partial: false,
            created_at: chrono::Utc::now().timestamp(),
        };
        store.replace_analysis(&analysis).unwrap();

        let loaded = store.get_analysis("f1").unwrap().unwrap();
        assert_eq!(loaded.quotes.len(), 1);
        assert_eq!(loaded.quotes[0].criterion, "standard");
        assert!(!loaded.partial);
    }

    #[test]
    fn list_results_filters_by_status_and_paginates() {
        let (store, operator) = store_with_operator();
        let mut files = Vec::new();
        for i in 0..5 {
            let mut f = queued_file(&format!("f{i}"), &format!("hash{i}"));
            f.operator_id = Some(operator.id.clone());
            files.push(f);
        }
        store.insert_files(&files).unwrap();
        store.set_progress("f0", FileStatus::Done, 4, 100).unwrap();
        store.set_progress("f1", FileStatus::Done, 4, 100).unwrap();

        let page = store
            .list_results(&ResultsFilter {
                page: 1,
                limit: 1,
                status: Some(FileStatus::Done),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.pages, 2);
        assert_eq!(page.items[0].operator_name.as_deref(), Some("Ivan"));
    }

    #[test]
    fn list_results_score_filter_requires_analysis() {
        let (store, _) = store_with_operator();
        store
            .insert_files(&[queued_file("f1", "h1"), queued_file("f2", "h2")])
            .unwrap();
        store
            .replace_analysis(&Analysis {
                id: Uuid::new_v4().to_string(),
                file_id: "f1".to_string(),
                standard: 90,
                loyalty: 90,
                kindness: 90,
                overall: 90,
                summary: "great".to_string(),
                quotes: vec![],
                model: "gpt-4".to_string(),
                partial: false,
                created_at: chrono::Utc::now().timestamp(),
            })
            .unwrap();

        let page = store
            .list_results(&ResultsFilter {
                page: 1,
                limit: 20,
                score_min: Some(80),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].record.id, "f1");
        assert_eq!(page.items[0].analysis.as_ref().unwrap().overall, 90);
    }

    #[test]
    fn list_operator_names_filters_substring() {
        let store = SqliteCallStore::in_memory().unwrap();
        store.upsert_operator("Ivan").unwrap();
        store.upsert_operator("Irina").unwrap();
        store.upsert_operator("Petr").unwrap();

        let all = store.list_operator_names(None, 20).unwrap();
        assert_eq!(all.len(), 3);

        let filtered = store.list_operator_names(Some("I"), 20).unwrap();
        assert_eq!(filtered, vec!["Irina".to_string(), "Ivan".to_string()]);
    }
}
