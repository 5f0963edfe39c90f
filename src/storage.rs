//! SQLite persistence for pipelines, jobs, records and model configs
//!
//! One file-backed database (or `:memory:` for tests, pinned to a single
//! pooled connection so the database survives between calls). Schema
//! migrations are forward-only `ALTER TABLE ADD COLUMN`; destructive
//! cascades run inside explicit transactions.

use crate::config::Settings;
use crate::error::{EngineError, EngineResult};
use crate::job::{Job, JobStatus, JobUpdate};
use crate::llm_config::{detect_provider, EmbeddingModelConfig, LlmModelConfig, LlmProvider};
use crate::pipeline::{StateMap, TraceEntry, Usage};
use crate::record::{NewRecord, Record, RecordStatus, RecordUpdate};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::Duration;

/// A pipeline row with its parsed definition
#[derive(Debug, Clone)]
pub struct PipelineRow {
    pub id: i64,
    pub name: String,
    pub definition: Value,
    pub created_at: String,
    pub validation_config: Option<Value>,
}

/// Filters for record listing
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub status: Option<RecordStatus>,
    pub job_id: Option<i64>,
    pub pipeline_id: Option<i64>,
    pub limit: i64,
    pub offset: i64,
}

impl RecordFilter {
    pub fn new() -> Self {
        Self {
            limit: 100,
            ..Self::default()
        }
    }
}

/// Heterogeneous bind value for dynamically built UPDATE statements
enum SqlValue {
    Text(String),
    Int(i64),
    Real(f64),
}

#[derive(Debug, Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Open (and migrate) the database at `db_path`; env vars supply the
    /// LLM fallback row for the startup migration
    pub async fn connect(db_path: &str) -> EngineResult<Self> {
        let fallback = (
            std::env::var("LLM_ENDPOINT").unwrap_or_default(),
            std::env::var("LLM_API_KEY").unwrap_or_default(),
            std::env::var("LLM_MODEL").unwrap_or_default(),
        );
        Self::connect_inner(db_path, fallback).await
    }

    /// Open the database described by settings
    pub async fn from_settings(settings: &Settings) -> EngineResult<Self> {
        settings.ensure_data_dir()?;
        Self::connect_inner(
            &settings.database_path,
            (
                settings.llm_endpoint.clone(),
                settings.llm_api_key.clone(),
                settings.llm_model.clone(),
            ),
        )
        .await
    }

    async fn connect_inner(
        db_path: &str,
        env_fallback: (String, String, String),
    ) -> EngineResult<Self> {
        let in_memory = db_path == ":memory:";
        let options = if in_memory {
            SqliteConnectOptions::new().in_memory(true)
        } else {
            if let Some(parent) = Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            SqliteConnectOptions::new()
                .filename(db_path)
                .create_if_missing(true)
                .busy_timeout(Duration::from_secs(5))
        };

        // an in-memory database lives and dies with its connection, so
        // the pool is pinned to one connection that never retires
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options.connect_with(options).await?;
        let storage = Self { pool };
        storage.init_schema(env_fallback).await?;
        Ok(storage)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn init_schema(&self, env_fallback: (String, String, String)) -> EngineResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS pipelines (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                definition TEXT NOT NULL,
                created_at TIMESTAMP NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pipeline_id INTEGER NOT NULL,
                status TEXT NOT NULL,
                total_seeds INTEGER NOT NULL,
                records_generated INTEGER DEFAULT 0,
                records_failed INTEGER DEFAULT 0,
                started_at TIMESTAMP NOT NULL,
                completed_at TIMESTAMP,
                FOREIGN KEY (pipeline_id) REFERENCES pipelines(id)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                output TEXT NOT NULL,
                metadata TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_status ON records(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_created_at ON records(created_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS llm_models (
                name TEXT PRIMARY KEY,
                provider TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                api_key TEXT,
                model_name TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS embedding_models (
                name TEXT PRIMARY KEY,
                provider TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                api_key TEXT,
                model_name TEXT NOT NULL,
                dimensions INTEGER
            )",
        )
        .execute(&self.pool)
        .await?;

        self.migrate_schema().await?;
        self.migrate_env_to_db(env_fallback).await?;
        Ok(())
    }

    /// Forward-only additive migrations for every known column
    async fn migrate_schema(&self) -> EngineResult<()> {
        let additions: [(&str, &str, &str); 12] = [
            ("records", "pipeline_id", "INTEGER"),
            ("records", "job_id", "INTEGER"),
            ("records", "trace", "TEXT"),
            ("pipelines", "validation_config", "TEXT"),
            ("jobs", "current_seed", "INTEGER DEFAULT 0"),
            ("jobs", "progress", "REAL DEFAULT 0.0"),
            ("jobs", "current_block", "TEXT"),
            ("jobs", "current_step", "TEXT"),
            ("jobs", "created_at", "TIMESTAMP"),
            ("jobs", "error", "TEXT"),
            ("jobs", "usage", "TEXT"),
            ("llm_models", "is_default", "INTEGER NOT NULL DEFAULT 0"),
        ];
        for (table, column, column_type) in additions {
            self.add_column_if_missing(table, column, column_type).await?;
        }
        self.add_column_if_missing("embedding_models", "is_default", "INTEGER NOT NULL DEFAULT 0")
            .await?;
        Ok(())
    }

    async fn add_column_if_missing(
        &self,
        table: &str,
        column: &str,
        column_type: &str,
    ) -> EngineResult<()> {
        let pragma = format!("PRAGMA table_info({table})");
        let rows = sqlx::query(&pragma).fetch_all(&self.pool).await?;
        let exists = rows.iter().any(|row| {
            row.try_get::<String, _>("name")
                .map(|name| name == column)
                .unwrap_or(false)
        });
        if !exists {
            let alter = format!("ALTER TABLE {table} ADD COLUMN \"{column}\" {column_type}");
            sqlx::query(&alter).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// When no LLM models exist and the environment carries an endpoint
    /// and model, seed a `default` row (provider inferred from the
    /// endpoint host)
    async fn migrate_env_to_db(
        &self,
        (endpoint, api_key, model): (String, String, String),
    ) -> EngineResult<()> {
        if model.is_empty() || endpoint.is_empty() {
            return Ok(());
        }
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM llm_models")
            .fetch_one(&self.pool)
            .await?;
        if count > 0 {
            return Ok(());
        }
        let provider = detect_provider(&endpoint);
        sqlx::query(
            "INSERT INTO llm_models (name, provider, endpoint, api_key, model_name, is_default)
             VALUES (?, ?, ?, ?, ?, 1)",
        )
        .bind("default")
        .bind(provider.as_str())
        .bind(&endpoint)
        .bind((!api_key.is_empty()).then_some(api_key))
        .bind(&model)
        .execute(&self.pool)
        .await?;
        tracing::info!("migrated env llm config into llm_models as 'default'");
        Ok(())
    }

    // ----- records -----

    pub async fn save_record(
        &self,
        record: &NewRecord,
        pipeline_id: Option<i64>,
        job_id: Option<i64>,
    ) -> EngineResult<i64> {
        let now = Utc::now().to_rfc3339();
        let trace_json = if record.trace.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&record.trace)?)
        };
        let result = sqlx::query(
            "INSERT INTO records (output, metadata, status, pipeline_id, job_id, trace,
             created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.output)
        .bind(serde_json::to_string(&record.metadata)?)
        .bind(RecordStatus::Pending.as_str())
        .bind(pipeline_id)
        .bind(job_id)
        .bind(trace_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_records(&self, filter: &RecordFilter) -> EngineResult<Vec<Record>> {
        let mut clauses = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            params.push(SqlValue::Text(status.as_str().to_string()));
        }
        if let Some(job_id) = filter.job_id {
            clauses.push("job_id = ?");
            params.push(SqlValue::Int(job_id));
        }
        if let Some(pipeline_id) = filter.pipeline_id {
            clauses.push("pipeline_id = ?");
            params.push(SqlValue::Int(pipeline_id));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT * FROM records {where_sql} ORDER BY created_at DESC LIMIT ? OFFSET ?"
        );
        params.push(SqlValue::Int(filter.limit));
        params.push(SqlValue::Int(filter.offset));

        let mut query = sqlx::query(&sql);
        for param in &params {
            query = bind_value(query, param);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_record).collect()
    }

    pub async fn get_record(&self, record_id: i64) -> EngineResult<Option<Record>> {
        let row = sqlx::query("SELECT * FROM records WHERE id = ?")
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    pub async fn update_record(
        &self,
        record_id: i64,
        update: &RecordUpdate,
    ) -> EngineResult<bool> {
        if update.is_empty() {
            return Ok(false);
        }
        let mut fields = record_update_fields(update)?;
        fields.push(("updated_at", Utc::now().to_rfc3339()));
        self.apply_record_update(record_id, fields).await
    }

    /// Patch the last trace entry's accumulated state, writing the whole
    /// trace back in one UPDATE (the review UI corrects per-field values
    /// post-hoc through this)
    pub async fn update_record_accumulated_state(
        &self,
        record_id: i64,
        patch: &StateMap,
        update: &RecordUpdate,
    ) -> EngineResult<bool> {
        let Some(record) = self.get_record(record_id).await? else {
            return Ok(false);
        };
        if record.trace.is_empty() {
            return Ok(false);
        }

        let mut trace = record.trace;
        if let Some(last) = trace.last_mut() {
            if let Some(state) = last.accumulated_state.as_mut() {
                for (key, value) in patch {
                    state.insert(key.clone(), value.clone());
                }
            }
        }

        let mut fields = record_update_fields(update)?;
        fields.push(("trace", serde_json::to_string(&trace)?));
        fields.push(("updated_at", Utc::now().to_rfc3339()));
        self.apply_record_update(record_id, fields).await
    }

    async fn apply_record_update(
        &self,
        record_id: i64,
        fields: Vec<(&str, String)>,
    ) -> EngineResult<bool> {
        let set_clause: Vec<String> = fields.iter().map(|(name, _)| format!("{name} = ?")).collect();
        let sql = format!("UPDATE records SET {} WHERE id = ?", set_clause.join(", "));
        let mut query = sqlx::query(&sql);
        for (_, value) in &fields {
            query = query.bind(value.clone());
        }
        let result = query.bind(record_id).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete records; with a job id the job row goes too, atomically
    pub async fn delete_records(&self, job_id: Option<i64>) -> EngineResult<i64> {
        match job_id {
            Some(job_id) => {
                let mut tx = self.pool.begin().await?;
                let deleted = sqlx::query("DELETE FROM records WHERE job_id = ?")
                    .bind(job_id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                sqlx::query("DELETE FROM jobs WHERE id = ?")
                    .bind(job_id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok(deleted as i64)
            }
            None => {
                let deleted = sqlx::query("DELETE FROM records")
                    .execute(&self.pool)
                    .await?
                    .rows_affected();
                Ok(deleted as i64)
            }
        }
    }

    /// Newline-delimited JSON export, one record per line. The last
    /// trace entry's accumulated state is flattened minus keys already
    /// present in metadata; a state field shadowed by a metadata key is
    /// therefore hidden from the export.
    pub async fn export_jsonl(
        &self,
        status: Option<RecordStatus>,
        job_id: Option<i64>,
    ) -> EngineResult<String> {
        let records = self
            .get_records(&RecordFilter {
                status,
                job_id,
                limit: 999_999,
                ..RecordFilter::default()
            })
            .await?;

        let mut lines = Vec::with_capacity(records.len());
        for record in records {
            let mut accumulated_state = StateMap::new();
            if let Some(last) = record.trace.last() {
                if let Some(state) = &last.accumulated_state {
                    for (key, value) in state {
                        if !record.metadata.contains_key(key) {
                            accumulated_state.insert(key.clone(), value.clone());
                        }
                    }
                }
            }
            let line = serde_json::json!({
                "id": record.id,
                "metadata": record.metadata,
                "status": record.status.as_str(),
                "accumulated_state": accumulated_state,
                "created_at": record.created_at.to_rfc3339(),
                "updated_at": record.updated_at.to_rfc3339(),
            });
            lines.push(serde_json::to_string(&line)?);
        }
        Ok(lines.join("\n"))
    }

    // ----- pipelines -----

    pub async fn save_pipeline(&self, name: &str, definition: &Value) -> EngineResult<i64> {
        let result =
            sqlx::query("INSERT INTO pipelines (name, definition, created_at) VALUES (?, ?, ?)")
                .bind(name)
                .bind(serde_json::to_string(definition)?)
                .bind(Utc::now().to_rfc3339())
                .execute(&self.pool)
                .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_pipeline(&self, pipeline_id: i64) -> EngineResult<Option<PipelineRow>> {
        let row = sqlx::query("SELECT * FROM pipelines WHERE id = ?")
            .bind(pipeline_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_pipeline).transpose()
    }

    pub async fn list_pipelines(&self) -> EngineResult<Vec<PipelineRow>> {
        let rows = sqlx::query("SELECT * FROM pipelines ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_pipeline).collect()
    }

    pub async fn update_pipeline(
        &self,
        pipeline_id: i64,
        name: &str,
        definition: &Value,
    ) -> EngineResult<bool> {
        let result = sqlx::query("UPDATE pipelines SET name = ?, definition = ? WHERE id = ?")
            .bind(name)
            .bind(serde_json::to_string(definition)?)
            .bind(pipeline_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_pipeline_validation_config(
        &self,
        pipeline_id: i64,
        validation_config: &Value,
    ) -> EngineResult<bool> {
        let result = sqlx::query("UPDATE pipelines SET validation_config = ? WHERE id = ?")
            .bind(serde_json::to_string(validation_config)?)
            .bind(pipeline_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Cascade: records, then jobs, then the pipeline row, in one
    /// transaction so a failure leaves no dangling children
    pub async fn delete_pipeline(&self, pipeline_id: i64) -> EngineResult<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM records WHERE pipeline_id = ?")
            .bind(pipeline_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM jobs WHERE pipeline_id = ?")
            .bind(pipeline_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM pipelines WHERE id = ?")
            .bind(pipeline_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    // ----- jobs -----

    pub async fn create_job(
        &self,
        pipeline_id: i64,
        total_seeds: i64,
        status: JobStatus,
    ) -> EngineResult<i64> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "INSERT INTO jobs (pipeline_id, status, total_seeds, started_at, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(pipeline_id)
        .bind(status.as_str())
        .bind(total_seeds)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_job(&self, job_id: i64) -> EngineResult<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    pub async fn list_jobs(
        &self,
        pipeline_id: Option<i64>,
        limit: i64,
    ) -> EngineResult<Vec<Job>> {
        let rows = match pipeline_id {
            Some(pipeline_id) => {
                sqlx::query(
                    "SELECT * FROM jobs WHERE pipeline_id = ? ORDER BY started_at DESC LIMIT ?",
                )
                .bind(pipeline_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM jobs ORDER BY started_at DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(row_to_job).collect()
    }

    pub async fn update_job(&self, job_id: i64, update: &JobUpdate) -> EngineResult<bool> {
        let mut fields: Vec<(&str, SqlValue)> = Vec::new();
        if let Some(status) = update.status {
            fields.push(("status", SqlValue::Text(status.as_str().to_string())));
        }
        if let Some(total) = update.total_seeds {
            fields.push(("total_seeds", SqlValue::Int(total)));
        }
        if let Some(seed) = update.current_seed {
            fields.push(("current_seed", SqlValue::Int(seed)));
        }
        if let Some(count) = update.records_generated {
            fields.push(("records_generated", SqlValue::Int(count)));
        }
        if let Some(count) = update.records_failed {
            fields.push(("records_failed", SqlValue::Int(count)));
        }
        if let Some(progress) = update.progress {
            fields.push(("progress", SqlValue::Real(progress)));
        }
        if let Some(block) = &update.current_block {
            fields.push(("current_block", SqlValue::Text(block.clone())));
        }
        if let Some(step) = &update.current_step {
            fields.push(("current_step", SqlValue::Text(step.clone())));
        }
        if let Some(error) = &update.error {
            fields.push(("error", SqlValue::Text(error.clone())));
        }
        if let Some(at) = &update.completed_at {
            fields.push(("completed_at", SqlValue::Text(at.clone())));
        }
        if let Some(usage) = &update.usage {
            fields.push(("\"usage\"", SqlValue::Text(serde_json::to_string(usage)?)));
        }
        if fields.is_empty() {
            return Ok(true);
        }

        let set_clause: Vec<String> = fields.iter().map(|(name, _)| format!("{name} = ?")).collect();
        let sql = format!("UPDATE jobs SET {} WHERE id = ?", set_clause.join(", "));
        let mut query = sqlx::query(&sql);
        for (_, value) in &fields {
            query = bind_value(query, value);
        }
        let result = query.bind(job_id).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    // ----- llm models -----

    pub async fn list_llm_models(&self) -> EngineResult<Vec<LlmModelConfig>> {
        let rows = sqlx::query("SELECT * FROM llm_models ORDER BY rowid")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_llm_model).collect()
    }

    pub async fn get_llm_model(&self, name: &str) -> EngineResult<Option<LlmModelConfig>> {
        let row = sqlx::query("SELECT * FROM llm_models WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_llm_model).transpose()
    }

    /// Upsert on unique name. The first model of the kind becomes
    /// default regardless of the incoming flag; saving a default clears
    /// every other default flag.
    pub async fn save_llm_model(&self, config: &LlmModelConfig) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        let others: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM llm_models WHERE name != ?")
            .bind(&config.name)
            .fetch_one(&mut *tx)
            .await?;
        let is_default = config.is_default || others == 0;
        if is_default {
            sqlx::query("UPDATE llm_models SET is_default = 0")
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(
            "INSERT INTO llm_models (name, provider, endpoint, api_key, model_name, is_default)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET
                provider = excluded.provider,
                endpoint = excluded.endpoint,
                api_key = excluded.api_key,
                model_name = excluded.model_name,
                is_default = excluded.is_default",
        )
        .bind(&config.name)
        .bind(config.provider.as_str())
        .bind(&config.endpoint)
        .bind((!config.api_key.is_empty()).then(|| config.api_key.clone()))
        .bind(&config.model_name)
        .bind(is_default as i64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Delete a model; when the default goes away and models remain,
    /// the first by name order is promoted
    pub async fn delete_llm_model(&self, name: &str) -> EngineResult<bool> {
        let mut tx = self.pool.begin().await?;
        let was_default: Option<i64> =
            sqlx::query_scalar("SELECT is_default FROM llm_models WHERE name = ?")
                .bind(name)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(was_default) = was_default else {
            return Ok(false);
        };
        sqlx::query("DELETE FROM llm_models WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        if was_default != 0 {
            sqlx::query(
                "UPDATE llm_models SET is_default = 1
                 WHERE name = (SELECT MIN(name) FROM llm_models)",
            )
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    pub async fn set_default_llm_model(&self, name: &str) -> EngineResult<bool> {
        let mut tx = self.pool.begin().await?;
        let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM llm_models WHERE name = ?")
            .bind(name)
            .fetch_one(&mut *tx)
            .await?;
        if exists == 0 {
            return Ok(false);
        }
        sqlx::query("UPDATE llm_models SET is_default = 0")
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE llm_models SET is_default = 1 WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    // ----- embedding models -----

    pub async fn list_embedding_models(&self) -> EngineResult<Vec<EmbeddingModelConfig>> {
        let rows = sqlx::query("SELECT * FROM embedding_models ORDER BY rowid")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_embedding_model).collect()
    }

    pub async fn get_embedding_model(
        &self,
        name: &str,
    ) -> EngineResult<Option<EmbeddingModelConfig>> {
        let row = sqlx::query("SELECT * FROM embedding_models WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_embedding_model).transpose()
    }

    pub async fn save_embedding_model(&self, config: &EmbeddingModelConfig) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        let others: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM embedding_models WHERE name != ?")
                .bind(&config.name)
                .fetch_one(&mut *tx)
                .await?;
        let is_default = config.is_default || others == 0;
        if is_default {
            sqlx::query("UPDATE embedding_models SET is_default = 0")
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(
            "INSERT INTO embedding_models
                (name, provider, endpoint, api_key, model_name, dimensions, is_default)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET
                provider = excluded.provider,
                endpoint = excluded.endpoint,
                api_key = excluded.api_key,
                model_name = excluded.model_name,
                dimensions = excluded.dimensions,
                is_default = excluded.is_default",
        )
        .bind(&config.name)
        .bind(config.provider.as_str())
        .bind(&config.endpoint)
        .bind((!config.api_key.is_empty()).then(|| config.api_key.clone()))
        .bind(&config.model_name)
        .bind(config.dimensions)
        .bind(is_default as i64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_embedding_model(&self, name: &str) -> EngineResult<bool> {
        let mut tx = self.pool.begin().await?;
        let was_default: Option<i64> =
            sqlx::query_scalar("SELECT is_default FROM embedding_models WHERE name = ?")
                .bind(name)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(was_default) = was_default else {
            return Ok(false);
        };
        sqlx::query("DELETE FROM embedding_models WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        if was_default != 0 {
            sqlx::query(
                "UPDATE embedding_models SET is_default = 1
                 WHERE name = (SELECT MIN(name) FROM embedding_models)",
            )
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(true)
    }
}

type SqliteQuery<'q> =
    sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

fn bind_value<'q>(query: SqliteQuery<'q>, value: &SqlValue) -> SqliteQuery<'q> {
    match value {
        SqlValue::Text(text) => query.bind(text.clone()),
        SqlValue::Int(int) => query.bind(*int),
        SqlValue::Real(real) => query.bind(*real),
    }
}

fn record_update_fields(update: &RecordUpdate) -> EngineResult<Vec<(&'static str, String)>> {
    let mut fields = Vec::new();
    if let Some(output) = &update.output {
        fields.push(("output", output.clone()));
    }
    if let Some(status) = update.status {
        fields.push(("status", status.as_str().to_string()));
    }
    if let Some(metadata) = &update.metadata {
        fields.push(("metadata", serde_json::to_string(metadata)?));
    }
    Ok(fields)
}

fn parse_timestamp(raw: &str) -> EngineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngineError::Validation(format!("invalid timestamp '{raw}': {e}")))
}

fn row_to_record(row: &SqliteRow) -> EngineResult<Record> {
    let metadata_json: String = row.try_get("metadata")?;
    let trace_json: Option<String> = row.try_get("trace")?;
    let status_raw: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    let trace: Vec<TraceEntry> = match trace_json {
        Some(json) => serde_json::from_str(&json)?,
        None => Vec::new(),
    };
    Ok(Record {
        id: row.try_get("id")?,
        output: row.try_get("output")?,
        metadata: serde_json::from_str(&metadata_json)?,
        status: RecordStatus::parse(&status_raw)
            .ok_or_else(|| EngineError::Validation(format!("unknown record status '{status_raw}'")))?,
        pipeline_id: row.try_get("pipeline_id")?,
        job_id: row.try_get("job_id")?,
        trace,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn row_to_pipeline(row: &SqliteRow) -> EngineResult<PipelineRow> {
    let definition_json: String = row.try_get("definition")?;
    let validation_json: Option<String> = row.try_get("validation_config")?;
    Ok(PipelineRow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        definition: serde_json::from_str(&definition_json)?,
        created_at: row.try_get("created_at")?,
        validation_config: validation_json
            .map(|json| serde_json::from_str(&json))
            .transpose()?,
    })
}

fn row_to_job(row: &SqliteRow) -> EngineResult<Job> {
    let status_raw: String = row.try_get("status")?;
    let usage_json: Option<String> = row.try_get("usage")?;
    let usage = usage_json
        .and_then(|json| serde_json::from_str::<Usage>(&json).ok())
        .unwrap_or_default();
    Ok(Job {
        id: row.try_get("id")?,
        pipeline_id: row.try_get("pipeline_id")?,
        status: JobStatus::parse(&status_raw)
            .ok_or_else(|| EngineError::Validation(format!("unknown job status '{status_raw}'")))?,
        total_seeds: row.try_get("total_seeds")?,
        current_seed: row.try_get::<Option<i64>, _>("current_seed")?.unwrap_or(0),
        records_generated: row
            .try_get::<Option<i64>, _>("records_generated")?
            .unwrap_or(0),
        records_failed: row.try_get::<Option<i64>, _>("records_failed")?.unwrap_or(0),
        progress: row.try_get::<Option<f64>, _>("progress")?.unwrap_or(0.0),
        current_block: row
            .try_get::<Option<String>, _>("current_block")?
            .unwrap_or_default(),
        current_step: row
            .try_get::<Option<String>, _>("current_step")?
            .unwrap_or_default(),
        error: row.try_get::<Option<String>, _>("error")?.unwrap_or_default(),
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        created_at: row.try_get("created_at")?,
        usage,
    })
}

fn row_to_llm_model(row: &SqliteRow) -> EngineResult<LlmModelConfig> {
    let provider_raw: String = row.try_get("provider")?;
    Ok(LlmModelConfig {
        name: row.try_get("name")?,
        provider: LlmProvider::parse(&provider_raw).unwrap_or(LlmProvider::OpenAi),
        endpoint: row.try_get("endpoint")?,
        api_key: row
            .try_get::<Option<String>, _>("api_key")?
            .unwrap_or_default(),
        model_name: row.try_get("model_name")?,
        is_default: row.try_get::<i64, _>("is_default")? != 0,
    })
}

fn row_to_embedding_model(row: &SqliteRow) -> EngineResult<EmbeddingModelConfig> {
    let provider_raw: String = row.try_get("provider")?;
    Ok(EmbeddingModelConfig {
        name: row.try_get("name")?,
        provider: LlmProvider::parse(&provider_raw).unwrap_or(LlmProvider::OpenAi),
        endpoint: row.try_get("endpoint")?,
        api_key: row
            .try_get::<Option<String>, _>("api_key")?
            .unwrap_or_default(),
        model_name: row.try_get("model_name")?,
        is_default: row.try_get::<i64, _>("is_default")? != 0,
        dimensions: row
            .try_get::<Option<i64>, _>("dimensions")?
            .unwrap_or_default(),
    })
}
