//! Database schema for the call-analysis database.
//!
//! Versioned, append-only. v0 is the initial layout; v1 adds the CRM
//! correlation columns used by the out-of-core webhook ingester.

use anyhow::Result;
use rusqlite::Connection;

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, ForeignKey, SqlType, Table, VersionedSchema, DEFAULT_TIMESTAMP};

const FILE_OPERATOR_FK: ForeignKey = ForeignKey {
    foreign_table: "operators",
    foreign_column: "id",
    cascade_delete: false,
};

const CHILD_FILE_FK: ForeignKey = ForeignKey {
    foreign_table: "files",
    foreign_column: "id",
    cascade_delete: true,
};

const OPERATORS_TABLE: Table = Table {
    name: "operators",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!(
            "created_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[("idx_operators_name", "name")],
};

const FILES_TABLE_V0: Table = Table {
    name: "files",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!(
            "operator_id",
            &SqlType::Text,
            foreign_key = Some(&FILE_OPERATOR_FK)
        ),
        sqlite_column!("original_name", &SqlType::Text, non_null = true),
        sqlite_column!("file_hash", &SqlType::Text, non_null = true),
        sqlite_column!("file_size", &SqlType::Integer, non_null = true),
        sqlite_column!("duration_sec", &SqlType::Real),
        sqlite_column!("audio_path", &SqlType::Text),
        sqlite_column!(
            "status",
            &SqlType::Text,
            non_null = true,
            default_value = Some("'queued'")
        ),
        sqlite_column!("stage", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!(
            "progress",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "retry_count",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("error_message", &SqlType::Text),
        sqlite_column!(
            "created_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
        sqlite_column!(
            "updated_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[
        ("idx_files_operator", "operator_id"),
        ("idx_files_status", "status"),
        ("idx_files_created", "created_at"),
        ("idx_files_hash", "file_hash"),
    ],
};

/// v1: CRM correlation metadata appended to the files table.
const FILES_TABLE_V1: Table = Table {
    name: "files",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!(
            "operator_id",
            &SqlType::Text,
            foreign_key = Some(&FILE_OPERATOR_FK)
        ),
        sqlite_column!("original_name", &SqlType::Text, non_null = true),
        sqlite_column!("file_hash", &SqlType::Text, non_null = true),
        sqlite_column!("file_size", &SqlType::Integer, non_null = true),
        sqlite_column!("duration_sec", &SqlType::Real),
        sqlite_column!("audio_path", &SqlType::Text),
        sqlite_column!(
            "status",
            &SqlType::Text,
            non_null = true,
            default_value = Some("'queued'")
        ),
        sqlite_column!("stage", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!(
            "progress",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "retry_count",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("error_message", &SqlType::Text),
        sqlite_column!(
            "created_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
        sqlite_column!(
            "updated_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
        sqlite_column!("caller_phone", &SqlType::Text),
        sqlite_column!("called_phone", &SqlType::Text),
        sqlite_column!("operator_phone", &SqlType::Text),
        sqlite_column!("duration", &SqlType::Integer),
        sqlite_column!("order_id", &SqlType::Text),
    ],
    indices: &[
        ("idx_files_operator", "operator_id"),
        ("idx_files_status", "status"),
        ("idx_files_created", "created_at"),
        ("idx_files_hash", "file_hash"),
        ("idx_files_order_id", "order_id"),
    ],
};

const TRANSCRIPTIONS_TABLE: Table = Table {
    name: "transcriptions",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!(
            "file_id",
            &SqlType::Text,
            non_null = true,
            is_unique = true,
            foreign_key = Some(&CHILD_FILE_FK)
        ),
        sqlite_column!("full_text", &SqlType::Text, non_null = true),
        sqlite_column!("word_timings", &SqlType::Text),
        sqlite_column!(
            "language",
            &SqlType::Text,
            non_null = true,
            default_value = Some("'ru'")
        ),
        sqlite_column!(
            "created_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[],
};

const DIARIZATIONS_TABLE: Table = Table {
    name: "diarizations",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!(
            "file_id",
            &SqlType::Text,
            non_null = true,
            is_unique = true,
            foreign_key = Some(&CHILD_FILE_FK)
        ),
        sqlite_column!("segments", &SqlType::Text, non_null = true),
        sqlite_column!("method", &SqlType::Text),
        sqlite_column!("confidence", &SqlType::Real),
        sqlite_column!("num_speakers", &SqlType::Integer),
        sqlite_column!(
            "created_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[],
};

const ANALYSES_TABLE: Table = Table {
    name: "analyses",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!(
            "file_id",
            &SqlType::Text,
            non_null = true,
            is_unique = true,
            foreign_key = Some(&CHILD_FILE_FK)
        ),
        sqlite_column!(
            "standard",
            &SqlType::Integer,
            non_null = true,
            check = Some("standard BETWEEN 0 AND 100")
        ),
        sqlite_column!(
            "loyalty",
            &SqlType::Integer,
            non_null = true,
            check = Some("loyalty BETWEEN 0 AND 100")
        ),
        sqlite_column!(
            "kindness",
            &SqlType::Integer,
            non_null = true,
            check = Some("kindness BETWEEN 0 AND 100")
        ),
        sqlite_column!(
            "overall",
            &SqlType::Integer,
            non_null = true,
            check = Some("overall BETWEEN 0 AND 100")
        ),
        sqlite_column!("summary", &SqlType::Text, non_null = true),
        sqlite_column!("quotes", &SqlType::Text),
        sqlite_column!("llm_model", &SqlType::Text),
        sqlite_column!(
            "partial",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "created_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[
        ("idx_analyses_standard", "standard"),
        ("idx_analyses_loyalty", "loyalty"),
        ("idx_analyses_kindness", "kindness"),
        ("idx_analyses_overall", "overall"),
    ],
};

fn migrate_v0_to_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "ALTER TABLE files ADD COLUMN caller_phone TEXT;
         ALTER TABLE files ADD COLUMN called_phone TEXT;
         ALTER TABLE files ADD COLUMN operator_phone TEXT;
         ALTER TABLE files ADD COLUMN duration INTEGER;
         ALTER TABLE files ADD COLUMN order_id TEXT;
         CREATE INDEX idx_files_order_id ON files(order_id);",
    )?;
    Ok(())
}

pub const CALL_DB_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 0,
        tables: &[
            OPERATORS_TABLE,
            FILES_TABLE_V0,
            TRANSCRIPTIONS_TABLE,
            DIARIZATIONS_TABLE,
            ANALYSES_TABLE,
        ],
        migration: None,
    },
    VersionedSchema {
        version: 1,
        tables: &[
            OPERATORS_TABLE,
            FILES_TABLE_V1,
            TRANSCRIPTIONS_TABLE,
            DIARIZATIONS_TABLE,
            ANALYSES_TABLE,
        ],
        migration: Some(migrate_v0_to_v1),
    },
];
