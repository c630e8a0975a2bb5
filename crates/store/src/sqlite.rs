//! SQLite store.
//!
//! One database file holds every table. Structured fields (segment lists,
//! profile maps, spec configs, prompt payloads) are stored as JSON text.
//! Timestamps are fixed-width RFC 3339 strings so that text ordering is
//! chronological ordering.
//!
//! Behavior targets carry a partial unique index over the active row of each
//! (parameter, scope, scope target) tuple; a supersede runs in a single
//! transaction and reports [`StoreError::Conflict`] when another writer got
//! there first.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use promptloom_core::caller::{
    Caller, CallerAttribute, Enrollment, MeasurementScore, MemoryFact, PersonalityProfile, Playbook,
};
use promptloom_core::error::StoreError;
use promptloom_core::prompt::ComposedPrompt;
use promptloom_core::spec::{SpecRole, SpecScope, Specification};
use promptloom_core::store::{CallerStore, PromptStore, SpecStore, Store, TargetStore};
use promptloom_core::target::{BehaviorParameter, BehaviorTarget, TargetKey};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, Sqlite, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

/// Schema, applied in order on every open.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "specifications table",
        r#"
        CREATE TABLE IF NOT EXISTS specifications (
            id                TEXT PRIMARY KEY,
            slug              TEXT UNIQUE NOT NULL,
            name              TEXT NOT NULL DEFAULT '',
            role              TEXT NOT NULL,
            scope             TEXT NOT NULL,
            domain            TEXT,
            is_active         INTEGER NOT NULL DEFAULT 1,
            is_locked         INTEGER NOT NULL DEFAULT 0,
            extends_archetype TEXT,
            config            TEXT NOT NULL DEFAULT '{}',
            version           INTEGER NOT NULL DEFAULT 1,
            updated_at        TEXT NOT NULL
        )
        "#,
    ),
    (
        "behavior_targets table",
        r#"
        CREATE TABLE IF NOT EXISTS behavior_targets (
            iid              INTEGER PRIMARY KEY AUTOINCREMENT,
            id               TEXT UNIQUE NOT NULL,
            parameter_id     TEXT NOT NULL,
            scope            TEXT NOT NULL,
            scope_target_id  TEXT NOT NULL DEFAULT '',
            target_value     REAL NOT NULL,
            confidence       REAL NOT NULL,
            source           TEXT NOT NULL,
            effective_from   TEXT NOT NULL,
            effective_until  TEXT,
            superseded_by_id TEXT
        )
        "#,
    ),
    (
        "active target index",
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_targets_active
        ON behavior_targets(parameter_id, scope, scope_target_id)
        WHERE effective_until IS NULL
        "#,
    ),
    (
        "target tuple index",
        "CREATE INDEX IF NOT EXISTS idx_targets_tuple ON behavior_targets(parameter_id, scope, scope_target_id, iid)",
    ),
    (
        "behavior_parameters table",
        r#"
        CREATE TABLE IF NOT EXISTS behavior_parameters (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            high_label  TEXT,
            low_label   TEXT
        )
        "#,
    ),
    (
        "callers table",
        r#"
        CREATE TABLE IF NOT EXISTS callers (
            id         TEXT PRIMARY KEY,
            name       TEXT NOT NULL DEFAULT '',
            domain     TEXT,
            segments   TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "personality_profiles table",
        r#"
        CREATE TABLE IF NOT EXISTS personality_profiles (
            caller_id        TEXT PRIMARY KEY,
            parameter_values TEXT NOT NULL DEFAULT '{}',
            calls_used       INTEGER NOT NULL DEFAULT 0,
            last_updated_at  TEXT NOT NULL
        )
        "#,
    ),
    (
        "memory_facts table",
        r#"
        CREATE TABLE IF NOT EXISTS memory_facts (
            id           TEXT PRIMARY KEY,
            caller_id    TEXT NOT NULL,
            category     TEXT NOT NULL,
            key          TEXT NOT NULL,
            value        TEXT NOT NULL,
            confidence   REAL NOT NULL,
            extracted_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "memory_facts index",
        "CREATE INDEX IF NOT EXISTS idx_memory_facts_caller ON memory_facts(caller_id, extracted_at DESC)",
    ),
    (
        "playbooks table",
        r#"
        CREATE TABLE IF NOT EXISTS playbooks (
            id       TEXT PRIMARY KEY,
            name     TEXT NOT NULL DEFAULT '',
            domain   TEXT,
            status   TEXT NOT NULL,
            spec_ids TEXT NOT NULL DEFAULT '[]'
        )
        "#,
    ),
    (
        "enrollments table",
        r#"
        CREATE TABLE IF NOT EXISTS enrollments (
            caller_id            TEXT NOT NULL,
            playbook_id          TEXT NOT NULL,
            status               TEXT NOT NULL,
            current_module_id    TEXT,
            completed_module_ids TEXT NOT NULL DEFAULT '[]',
            enrolled_at          TEXT NOT NULL,
            PRIMARY KEY (caller_id, playbook_id)
        )
        "#,
    ),
    (
        "measurement_scores table",
        r#"
        CREATE TABLE IF NOT EXISTS measurement_scores (
            id           TEXT PRIMARY KEY,
            caller_id    TEXT NOT NULL,
            parameter_id TEXT NOT NULL,
            score        REAL NOT NULL,
            call_id      TEXT,
            scored_at    TEXT NOT NULL
        )
        "#,
    ),
    (
        "measurement_scores index",
        "CREATE INDEX IF NOT EXISTS idx_scores_lookup ON measurement_scores(caller_id, parameter_id, scored_at DESC)",
    ),
    (
        "caller_attributes table",
        r#"
        CREATE TABLE IF NOT EXISTS caller_attributes (
            caller_id   TEXT NOT NULL,
            key         TEXT NOT NULL,
            scope       TEXT NOT NULL,
            value       TEXT NOT NULL,
            source_spec TEXT NOT NULL,
            updated_at  TEXT NOT NULL,
            PRIMARY KEY (caller_id, key)
        )
        "#,
    ),
    (
        "composed_prompts table",
        r#"
        CREATE TABLE IF NOT EXISTS composed_prompts (
            iid             INTEGER PRIMARY KEY AUTOINCREMENT,
            id              TEXT UNIQUE NOT NULL,
            caller_id       TEXT NOT NULL,
            trigger_call_id TEXT,
            prompt_text     TEXT NOT NULL,
            voice_text      TEXT NOT NULL,
            llm_prompt      TEXT NOT NULL,
            metadata        TEXT NOT NULL,
            inputs_hash     TEXT NOT NULL,
            status          TEXT NOT NULL,
            composed_at     TEXT NOT NULL
        )
        "#,
    ),
    (
        "composed_prompts index",
        "CREATE INDEX IF NOT EXISTS idx_prompts_caller ON composed_prompts(caller_id, composed_at DESC, iid DESC)",
    ),
];

/// A SQLite-backed store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `url` with the default
    /// pool size. Pass `"sqlite::memory:"` for an ephemeral database.
    pub async fn new(url: &str) -> Result<Self, StoreError> {
        Self::connect(url, 4).await
    }

    /// Open the database at `url` with at most `max_connections` pooled
    /// connections.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite url: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", "ON");

        // Every connection to `:memory:` is its own database; keep exactly one alive.
        let ephemeral = url.contains(":memory:");
        let mut pool_options =
            SqlitePoolOptions::new().max_connections(if ephemeral { 1 } else { max_connections });
        if ephemeral {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite store initialized at {url}");
        Ok(store)
    }

    /// Create from an existing pool (useful for testing).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        for (name, sql) in MIGRATIONS {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::MigrationFailed(format!("{name}: {e}")))?;
        }
        debug!("SQLite migrations complete");
        Ok(())
    }

    fn row_to_spec(row: &SqliteRow) -> Result<Specification, StoreError> {
        let role: String = col(row, "role")?;
        let scope: String = col(row, "scope")?;
        let version: i64 = col(row, "version")?;
        Ok(Specification {
            id: col(row, "id")?,
            slug: col(row, "slug")?,
            name: col(row, "name")?,
            role: SpecRole::from_str(&role).map_err(|e| StoreError::Corrupt(e.to_string()))?,
            scope: SpecScope::from_str(&scope).map_err(|e| StoreError::Corrupt(e.to_string()))?,
            domain: col(row, "domain")?,
            is_active: col(row, "is_active")?,
            is_locked: col(row, "is_locked")?,
            extends_archetype: col(row, "extends_archetype")?,
            config: json_col(row, "config")?,
            version: u32::try_from(version)
                .map_err(|_| StoreError::Corrupt(format!("spec version {version}")))?,
            updated_at: ts_col(row, "updated_at")?,
        })
    }

    fn row_to_target(row: &SqliteRow) -> Result<BehaviorTarget, StoreError> {
        let scope_target: String = col(row, "scope_target_id")?;
        let effective_until: Option<String> = col(row, "effective_until")?;
        Ok(BehaviorTarget {
            id: col(row, "id")?,
            parameter_id: col(row, "parameter_id")?,
            scope: enum_col(row, "scope")?,
            scope_target_id: Some(scope_target).filter(|s| !s.is_empty()),
            target_value: col(row, "target_value")?,
            confidence: col(row, "confidence")?,
            source: enum_col(row, "source")?,
            effective_from: ts_col(row, "effective_from")?,
            effective_until: effective_until.as_deref().map(parse_ts).transpose()?,
            superseded_by_id: col(row, "superseded_by_id")?,
        })
    }

    fn row_to_prompt(row: &SqliteRow) -> Result<ComposedPrompt, StoreError> {
        Ok(ComposedPrompt {
            id: col(row, "id")?,
            caller_id: col(row, "caller_id")?,
            trigger_call_id: col(row, "trigger_call_id")?,
            prompt_text: col(row, "prompt_text")?,
            voice_text: col(row, "voice_text")?,
            llm_prompt: json_col(row, "llm_prompt")?,
            metadata: json_col(row, "metadata")?,
            inputs_hash: col(row, "inputs_hash")?,
            status: enum_col(row, "status")?,
            composed_at: ts_col(row, "composed_at")?,
        })
    }
}

// ── Column helpers ─────────────────────────────────────────────────────────

fn col<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StoreError::QueryFailed(format!("{name} column: {e}")))
}

fn json_col<T: DeserializeOwned>(row: &SqliteRow, name: &str) -> Result<T, StoreError> {
    let raw: String = col(row, name)?;
    serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt(format!("{name} column: {e}")))
}

fn ts_col(row: &SqliteRow, name: &str) -> Result<DateTime<Utc>, StoreError> {
    let raw: String = col(row, name)?;
    parse_ts(&raw)
}

/// Enums are stored as their serde string form.
fn enum_col<T: DeserializeOwned>(row: &SqliteRow, name: &str) -> Result<T, StoreError> {
    let raw: String = col(row, name)?;
    serde_json::from_value(serde_json::Value::String(raw))
        .map_err(|e| StoreError::Corrupt(format!("{name} column: {e}")))
}

fn enum_str<T: Serialize>(value: &T) -> Result<String, StoreError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        Ok(other) => Err(StoreError::Storage(format!("not a string enum: {other}"))),
        Err(e) => Err(StoreError::Storage(e.to_string())),
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Storage(format!("JSON encoding: {e}")))
}

fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{raw}': {e}")))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// SQLITE_BUSY and its extended codes (e.g. BUSY_SNAPSHOT): another writer holds the lock.
fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| code & 0xff == 5),
        _ => false,
    }
}

/// Write-path errors another writer can cause become [`StoreError::Conflict`].
fn supersede_error(err: sqlx::Error, context: String) -> StoreError {
    if is_unique_violation(&err) || is_busy(&err) {
        StoreError::Conflict(format!("{context}: {err}"))
    } else {
        StoreError::Storage(format!("{context}: {err}"))
    }
}

impl Store for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }
}

#[async_trait]
impl SpecStore for SqliteStore {
    async fn get_spec(&self, id: &str) -> Result<Option<Specification>, StoreError> {
        let row = sqlx::query("SELECT * FROM specifications WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("get_spec: {e}")))?;
        row.as_ref().map(Self::row_to_spec).transpose()
    }

    async fn get_spec_by_slug(&self, slug: &str) -> Result<Option<Specification>, StoreError> {
        let row = sqlx::query("SELECT * FROM specifications WHERE slug = ?1")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("get_spec_by_slug: {e}")))?;
        row.as_ref().map(Self::row_to_spec).transpose()
    }

    async fn list_specs(
        &self,
        role: Option<SpecRole>,
        active_only: bool,
    ) -> Result<Vec<Specification>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM specifications
            WHERE (?1 IS NULL OR role = ?1)
              AND (?2 = 0 OR is_active = 1)
            ORDER BY slug
            "#,
        )
        .bind(role.map(|r| r.as_str()))
        .bind(active_only)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("list_specs: {e}")))?;
        rows.iter().map(Self::row_to_spec).collect()
    }

    async fn put_spec(&self, spec: Specification) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO specifications
                (id, slug, name, role, scope, domain, is_active, is_locked,
                 extends_archetype, config, version, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(id) DO UPDATE SET
                slug = excluded.slug,
                name = excluded.name,
                role = excluded.role,
                scope = excluded.scope,
                domain = excluded.domain,
                is_active = excluded.is_active,
                is_locked = excluded.is_locked,
                extends_archetype = excluded.extends_archetype,
                config = excluded.config,
                version = excluded.version,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&spec.id)
        .bind(&spec.slug)
        .bind(&spec.name)
        .bind(spec.role.as_str())
        .bind(spec.scope.as_str())
        .bind(&spec.domain)
        .bind(spec.is_active)
        .bind(spec.is_locked)
        .bind(&spec.extends_archetype)
        .bind(to_json(&spec.config)?)
        .bind(i64::from(spec.version))
        .bind(ts(&spec.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("put_spec {}: {e}", spec.slug)))?;
        Ok(())
    }
}

#[async_trait]
impl TargetStore for SqliteStore {
    async fn active_target(&self, key: &TargetKey) -> Result<Option<BehaviorTarget>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM behavior_targets
            WHERE parameter_id = ?1 AND scope = ?2 AND scope_target_id = ?3
              AND effective_until IS NULL
            "#,
        )
        .bind(&key.parameter_id)
        .bind(key.scope.as_str())
        .bind(key.scope_column())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("active_target {key}: {e}")))?;
        row.as_ref().map(Self::row_to_target).transpose()
    }

    async fn supersede_active(
        &self,
        key: &TargetKey,
        next: BehaviorTarget,
    ) -> Result<Option<String>, StoreError> {
        if next.key() != *key {
            return Err(StoreError::Storage(format!(
                "target {} does not belong to {key}",
                next.id
            )));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Storage(format!("begin supersede: {e}")))?;

        let previous: Option<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM behavior_targets
            WHERE parameter_id = ?1 AND scope = ?2 AND scope_target_id = ?3
              AND effective_until IS NULL
            "#,
        )
        .bind(&key.parameter_id)
        .bind(key.scope.as_str())
        .bind(key.scope_column())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| supersede_error(e, format!("supersede lookup {key}")))?;

        let effective_from = ts(&next.effective_from);

        if let Some(previous_id) = &previous {
            let retired = sqlx::query(
                r#"
                UPDATE behavior_targets
                SET effective_until = ?1, superseded_by_id = ?2
                WHERE id = ?3 AND effective_until IS NULL
                "#,
            )
            .bind(&effective_from)
            .bind(&next.id)
            .bind(previous_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| supersede_error(e, format!("retire {previous_id}")))?;

            if retired.rows_affected() != 1 {
                return Err(StoreError::Conflict(format!(
                    "active target for {key} changed during supersede"
                )));
            }
        }

        sqlx::query(
            r#"
            INSERT INTO behavior_targets
                (id, parameter_id, scope, scope_target_id, target_value, confidence,
                 source, effective_from, effective_until, superseded_by_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, NULL)
            "#,
        )
        .bind(&next.id)
        .bind(&next.parameter_id)
        .bind(next.scope.as_str())
        .bind(key.scope_column())
        .bind(next.target_value)
        .bind(next.confidence)
        .bind(next.source.as_str())
        .bind(&effective_from)
        .execute(&mut *tx)
        .await
        .map_err(|e| supersede_error(e, format!("insert target {} for {key}", next.id)))?;

        tx.commit()
            .await
            .map_err(|e| supersede_error(e, format!("commit supersede {key}")))?;

        debug!(
            "Superseded {key}: {} -> {}",
            previous.as_deref().unwrap_or("(none)"),
            next.id
        );
        Ok(previous)
    }

    async fn target_history(&self, key: &TargetKey) -> Result<Vec<BehaviorTarget>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM behavior_targets
            WHERE parameter_id = ?1 AND scope = ?2 AND scope_target_id = ?3
            ORDER BY iid
            "#,
        )
        .bind(&key.parameter_id)
        .bind(key.scope.as_str())
        .bind(key.scope_column())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("target_history {key}: {e}")))?;
        rows.iter().map(Self::row_to_target).collect()
    }

    async fn put_parameter(&self, parameter: BehaviorParameter) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO behavior_parameters (id, name, description, high_label, low_label)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                high_label = excluded.high_label,
                low_label = excluded.low_label
            "#,
        )
        .bind(&parameter.id)
        .bind(&parameter.name)
        .bind(&parameter.description)
        .bind(&parameter.high_label)
        .bind(&parameter.low_label)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("put_parameter {}: {e}", parameter.id)))?;
        Ok(())
    }

    async fn get_parameters(&self, ids: &[String]) -> Result<Vec<BehaviorParameter>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (1..=ids.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT * FROM behavior_parameters WHERE id IN ({placeholders}) ORDER BY id");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("get_parameters: {e}")))?;

        rows.iter()
            .map(|row| {
                Ok(BehaviorParameter {
                    id: col(row, "id")?,
                    name: col(row, "name")?,
                    description: col(row, "description")?,
                    high_label: col(row, "high_label")?,
                    low_label: col(row, "low_label")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl CallerStore for SqliteStore {
    async fn get_caller(&self, id: &str) -> Result<Option<Caller>, StoreError> {
        let row = sqlx::query("SELECT * FROM callers WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("get_caller: {e}")))?;
        row.as_ref()
            .map(|row| {
                Ok(Caller {
                    id: col(row, "id")?,
                    name: col(row, "name")?,
                    domain: col(row, "domain")?,
                    segments: json_col(row, "segments")?,
                    created_at: ts_col(row, "created_at")?,
                })
            })
            .transpose()
    }

    async fn put_caller(&self, caller: Caller) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO callers (id, name, domain, segments, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                domain = excluded.domain,
                segments = excluded.segments
            "#,
        )
        .bind(&caller.id)
        .bind(&caller.name)
        .bind(&caller.domain)
        .bind(to_json(&caller.segments)?)
        .bind(ts(&caller.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("put_caller {}: {e}", caller.id)))?;
        Ok(())
    }

    async fn get_profile(&self, caller_id: &str) -> Result<Option<PersonalityProfile>, StoreError> {
        let row = sqlx::query("SELECT * FROM personality_profiles WHERE caller_id = ?1")
            .bind(caller_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("get_profile: {e}")))?;
        row.as_ref()
            .map(|row| {
                let calls_used: i64 = col(row, "calls_used")?;
                Ok(PersonalityProfile {
                    caller_id: col(row, "caller_id")?,
                    parameter_values: json_col(row, "parameter_values")?,
                    calls_used: u32::try_from(calls_used).unwrap_or(u32::MAX),
                    last_updated_at: ts_col(row, "last_updated_at")?,
                })
            })
            .transpose()
    }

    async fn put_profile(&self, profile: PersonalityProfile) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO personality_profiles (caller_id, parameter_values, calls_used, last_updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(caller_id) DO UPDATE SET
                parameter_values = excluded.parameter_values,
                calls_used = excluded.calls_used,
                last_updated_at = excluded.last_updated_at
            "#,
        )
        .bind(&profile.caller_id)
        .bind(to_json(&profile.parameter_values)?)
        .bind(i64::from(profile.calls_used))
        .bind(ts(&profile.last_updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("put_profile {}: {e}", profile.caller_id)))?;
        Ok(())
    }

    async fn recent_memory_facts(
        &self,
        caller_id: &str,
        limit: usize,
    ) -> Result<Vec<MemoryFact>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM memory_facts
            WHERE caller_id = ?1
            ORDER BY extracted_at DESC, id ASC
            LIMIT ?2
            "#,
        )
        .bind(caller_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("recent_memory_facts: {e}")))?;

        rows.iter()
            .map(|row| {
                Ok(MemoryFact {
                    id: col(row, "id")?,
                    caller_id: col(row, "caller_id")?,
                    category: col(row, "category")?,
                    key: col(row, "key")?,
                    value: col(row, "value")?,
                    confidence: col(row, "confidence")?,
                    extracted_at: ts_col(row, "extracted_at")?,
                })
            })
            .collect()
    }

    async fn put_memory_fact(&self, fact: MemoryFact) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO memory_facts (id, caller_id, category, key, value, confidence, extracted_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                category = excluded.category,
                key = excluded.key,
                value = excluded.value,
                confidence = excluded.confidence,
                extracted_at = excluded.extracted_at
            "#,
        )
        .bind(&fact.id)
        .bind(&fact.caller_id)
        .bind(&fact.category)
        .bind(&fact.key)
        .bind(&fact.value)
        .bind(fact.confidence)
        .bind(ts(&fact.extracted_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("put_memory_fact {}: {e}", fact.id)))?;
        Ok(())
    }

    async fn enrollments(&self, caller_id: &str) -> Result<Vec<Enrollment>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM enrollments WHERE caller_id = ?1 ORDER BY enrolled_at, playbook_id",
        )
        .bind(caller_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("enrollments: {e}")))?;

        rows.iter()
            .map(|row| {
                Ok(Enrollment {
                    caller_id: col(row, "caller_id")?,
                    playbook_id: col(row, "playbook_id")?,
                    status: enum_col(row, "status")?,
                    current_module_id: col(row, "current_module_id")?,
                    completed_module_ids: json_col(row, "completed_module_ids")?,
                    enrolled_at: ts_col(row, "enrolled_at")?,
                })
            })
            .collect()
    }

    async fn put_enrollment(&self, enrollment: Enrollment) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO enrollments
                (caller_id, playbook_id, status, current_module_id, completed_module_ids, enrolled_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(caller_id, playbook_id) DO UPDATE SET
                status = excluded.status,
                current_module_id = excluded.current_module_id,
                completed_module_ids = excluded.completed_module_ids,
                enrolled_at = excluded.enrolled_at
            "#,
        )
        .bind(&enrollment.caller_id)
        .bind(&enrollment.playbook_id)
        .bind(enum_str(&enrollment.status)?)
        .bind(&enrollment.current_module_id)
        .bind(to_json(&enrollment.completed_module_ids)?)
        .bind(ts(&enrollment.enrolled_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("put_enrollment: {e}")))?;
        Ok(())
    }

    async fn get_playbook(&self, id: &str) -> Result<Option<Playbook>, StoreError> {
        let row = sqlx::query("SELECT * FROM playbooks WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("get_playbook: {e}")))?;
        row.as_ref()
            .map(|row| {
                Ok(Playbook {
                    id: col(row, "id")?,
                    name: col(row, "name")?,
                    domain: col(row, "domain")?,
                    status: enum_col(row, "status")?,
                    spec_ids: json_col(row, "spec_ids")?,
                })
            })
            .transpose()
    }

    async fn put_playbook(&self, playbook: Playbook) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO playbooks (id, name, domain, status, spec_ids)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                domain = excluded.domain,
                status = excluded.status,
                spec_ids = excluded.spec_ids
            "#,
        )
        .bind(&playbook.id)
        .bind(&playbook.name)
        .bind(&playbook.domain)
        .bind(enum_str(&playbook.status)?)
        .bind(to_json(&playbook.spec_ids)?)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("put_playbook {}: {e}", playbook.id)))?;
        Ok(())
    }

    async fn recent_scores(
        &self,
        caller_id: &str,
        parameter_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MeasurementScore>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM measurement_scores
            WHERE caller_id = ?1 AND parameter_id = ?2 AND scored_at >= ?3
            ORDER BY scored_at DESC, id ASC
            LIMIT ?4
            "#,
        )
        .bind(caller_id)
        .bind(parameter_id)
        .bind(ts(&since))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("recent_scores: {e}")))?;

        rows.iter()
            .map(|row| {
                Ok(MeasurementScore {
                    id: col(row, "id")?,
                    caller_id: col(row, "caller_id")?,
                    parameter_id: col(row, "parameter_id")?,
                    score: col(row, "score")?,
                    call_id: col(row, "call_id")?,
                    scored_at: ts_col(row, "scored_at")?,
                })
            })
            .collect()
    }

    async fn put_score(&self, score: MeasurementScore) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO measurement_scores (id, caller_id, parameter_id, score, call_id, scored_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                score = excluded.score,
                call_id = excluded.call_id,
                scored_at = excluded.scored_at
            "#,
        )
        .bind(&score.id)
        .bind(&score.caller_id)
        .bind(&score.parameter_id)
        .bind(score.score)
        .bind(&score.call_id)
        .bind(ts(&score.scored_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("put_score {}: {e}", score.id)))?;
        Ok(())
    }

    async fn upsert_attribute(&self, attribute: CallerAttribute) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO caller_attributes (caller_id, key, scope, value, source_spec, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(caller_id, key) DO UPDATE SET
                scope = excluded.scope,
                value = excluded.value,
                source_spec = excluded.source_spec,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&attribute.caller_id)
        .bind(&attribute.key)
        .bind(&attribute.scope)
        .bind(to_json(&attribute.value)?)
        .bind(&attribute.source_spec)
        .bind(ts(&attribute.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("upsert_attribute {}: {e}", attribute.key)))?;
        Ok(())
    }

    async fn attributes(&self, caller_id: &str) -> Result<Vec<CallerAttribute>, StoreError> {
        let rows = sqlx::query("SELECT * FROM caller_attributes WHERE caller_id = ?1 ORDER BY key")
            .bind(caller_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("attributes: {e}")))?;

        rows.iter()
            .map(|row| {
                Ok(CallerAttribute {
                    caller_id: col(row, "caller_id")?,
                    key: col(row, "key")?,
                    scope: col(row, "scope")?,
                    value: json_col(row, "value")?,
                    source_spec: col(row, "source_spec")?,
                    updated_at: ts_col(row, "updated_at")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl PromptStore for SqliteStore {
    async fn insert_prompt(&self, prompt: ComposedPrompt) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO composed_prompts
                (id, caller_id, trigger_call_id, prompt_text, voice_text, llm_prompt,
                 metadata, inputs_hash, status, composed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&prompt.id)
        .bind(&prompt.caller_id)
        .bind(&prompt.trigger_call_id)
        .bind(&prompt.prompt_text)
        .bind(&prompt.voice_text)
        .bind(to_json(&prompt.llm_prompt)?)
        .bind(to_json(&prompt.metadata)?)
        .bind(&prompt.inputs_hash)
        .bind(prompt.status.as_str())
        .bind(ts(&prompt.composed_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("insert_prompt {}: {e}", prompt.id)))?;
        Ok(())
    }

    async fn latest_prompt(&self, caller_id: &str) -> Result<Option<ComposedPrompt>, StoreError> {
        Ok(self.list_prompts(caller_id, 1).await?.into_iter().next())
    }

    async fn list_prompts(
        &self,
        caller_id: &str,
        limit: usize,
    ) -> Result<Vec<ComposedPrompt>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM composed_prompts
            WHERE caller_id = ?1
            ORDER BY composed_at DESC, iid DESC
            LIMIT ?2
            "#,
        )
        .bind(caller_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("list_prompts: {e}")))?;
        rows.iter().map(Self::row_to_prompt).collect()
    }
}
