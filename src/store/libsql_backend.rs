//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are stored as
//! fixed-width RFC 3339 text (millisecond precision, `Z` suffix) so that
//! the due/lease comparisons in SQL can compare them as strings.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::delivery::tracker::AttemptUpdate;
use crate::error::DatabaseError;
use crate::pipeline::types::{
    ChannelType, DashboardSummary, DeliveryAttempt, DeliveryQuery, DeliveryRecord,
    DeliveryStatus, DestinationChannel, ForwardRule, IncomingMessage, MessageQuery,
    RuleDestination, SimEndpoint, TrafficBucket,
};
use crate::store::migrations;
use crate::store::traits::Database;

const DEFAULT_LIST_LIMIT: usize = 100;
const MAX_LIST_LIMIT: usize = 1000;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format for timestamps.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn opt_ts(dt: &Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(ts(dt)),
        None => libsql::Value::Null,
    }
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_int(i: Option<i64>) -> libsql::Value {
    match i {
        Some(i) => libsql::Value::Integer(i),
        None => libsql::Value::Null,
    }
}

fn json_text(value: &serde_json::Value) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// Parse a JSON column, falling back to `{}` for unreadable content.
fn parse_json(s: &str, column: &str) -> serde_json::Value {
    serde_json::from_str(s).unwrap_or_else(|e| {
        warn!(column, "Unparseable JSON column, using empty object: {e}");
        serde_json::json!({})
    })
}

/// Parse a JSON column that must be readable for the row to be usable.
fn parse_json_strict(s: &str, column: &str) -> Result<serde_json::Value, DatabaseError> {
    serde_json::from_str(s)
        .map_err(|e| DatabaseError::Serialization(format!("Unparseable {column} column: {e}")))
}

fn clamp_limit(limit: Option<usize>) -> i64 {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT) as i64
}

/// Map a libsql error, surfacing UNIQUE violations as `Constraint`.
fn query_err(op: &str, e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.contains("UNIQUE constraint failed") {
        DatabaseError::Constraint(format!("{op}: {msg}"))
    } else {
        DatabaseError::Query(format!("{op}: {msg}"))
    }
}

fn text_col(row: &libsql::Row, idx: i32) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("column {idx}: {e}")))
}

fn int_col(row: &libsql::Row, idx: i32) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("column {idx}: {e}")))
}

fn opt_col(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

fn row_to_message(row: &libsql::Row) -> Result<IncomingMessage, DatabaseError> {
    let received: String = text_col(row, 5)?;
    let raw: String = text_col(row, 6)?;
    Ok(IncomingMessage {
        id: text_col(row, 0)?,
        endpoint_id: text_col(row, 1)?,
        from_number: text_col(row, 2)?,
        to_number: text_col(row, 3)?,
        body: text_col(row, 4)?,
        received_at: parse_datetime(&received),
        raw_payload: parse_json(&raw, "raw_payload"),
        processed: int_col(row, 7)? != 0,
    })
}

fn row_to_rule(row: &libsql::Row) -> Result<ForwardRule, DatabaseError> {
    let filters: String = text_col(row, 4)?;
    Ok(ForwardRule {
        id: text_col(row, 0)?,
        name: text_col(row, 1)?,
        is_enabled: int_col(row, 2)? != 0,
        priority: int_col(row, 3)?,
        filters: parse_json_strict(&filters, "filters")?,
        stop_processing: int_col(row, 5)? != 0,
    })
}

fn row_to_channel(row: &libsql::Row) -> Result<DestinationChannel, DatabaseError> {
    let type_str: String = text_col(row, 1)?;
    let channel_type: ChannelType = type_str.parse().map_err(DatabaseError::Serialization)?;
    let config: String = text_col(row, 4)?;
    Ok(DestinationChannel {
        id: text_col(row, 0)?,
        channel_type,
        name: text_col(row, 2)?,
        is_enabled: int_col(row, 3)? != 0,
        config: parse_json(&config, "config"),
    })
}

fn row_to_destination(row: &libsql::Row) -> Result<RuleDestination, DatabaseError> {
    let action_config: String = text_col(row, 5)?;
    Ok(RuleDestination {
        id: text_col(row, 0)?,
        rule_id: text_col(row, 1)?,
        channel_id: text_col(row, 2)?,
        is_enabled: int_col(row, 3)? != 0,
        override_text_template: opt_col(row, 4),
        action_config: parse_json(&action_config, "action_config"),
    })
}

fn row_to_endpoint(row: &libsql::Row) -> Result<SimEndpoint, DatabaseError> {
    let created: String = text_col(row, 7)?;
    Ok(SimEndpoint {
        id: text_col(row, 0)?,
        name: text_col(row, 1)?,
        phone_number: text_col(row, 2)?,
        imei: opt_col(row, 3),
        api_token: text_col(row, 4)?,
        is_active: int_col(row, 5)? != 0,
        last_seen_at: parse_optional_datetime(&opt_col(row, 6)),
        created_at: parse_datetime(&created),
    })
}

fn row_to_attempt(row: &libsql::Row) -> Result<DeliveryAttempt, DatabaseError> {
    let status_str: String = text_col(row, 4)?;
    let status: DeliveryStatus = status_str.parse().map_err(DatabaseError::Serialization)?;
    let retry_count: i64 = int_col(row, 8)?;
    let created: String = text_col(row, 13)?;
    Ok(DeliveryAttempt {
        id: text_col(row, 0)?,
        message_id: text_col(row, 1)?,
        rule_id: text_col(row, 2)?,
        channel_id: text_col(row, 3)?,
        status,
        provider_message_id: opt_col(row, 5),
        error: opt_col(row, 6),
        last_attempt_at: parse_optional_datetime(&opt_col(row, 7)),
        retry_count: u32::try_from(retry_count).unwrap_or(0),
        next_attempt_at: parse_optional_datetime(&opt_col(row, 9)),
        lease_owner: opt_col(row, 10),
        lease_until: parse_optional_datetime(&opt_col(row, 11)),
        version: int_col(row, 12)?,
        created_at: parse_datetime(&created),
    })
}

/// Drain a row cursor through `map`, skipping rows that fail to parse.
async fn collect_rows<T>(
    mut rows: libsql::Rows,
    what: &str,
    map: fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(Some(row)) = rows.next().await {
        match map(&row) {
            Ok(item) => out.push(item),
            Err(e) => warn!("Skipping {what} row: {e}"),
        }
    }
    out
}

async fn first_row<T>(
    mut rows: libsql::Rows,
    op: &str,
    map: fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Option<T>, DatabaseError> {
    match rows.next().await {
        Ok(Some(row)) => map(&row).map(Some),
        Ok(None) => Ok(None),
        Err(e) => Err(query_err(op, e)),
    }
}

// ── Trait implementation ────────────────────────────────────────────

const MESSAGE_COLUMNS: &str =
    "id, endpoint_id, from_number, to_number, body, received_at, raw_payload, processed";

const RULE_COLUMNS: &str = "id, name, is_enabled, priority, filters, stop_processing";

const CHANNEL_COLUMNS: &str = "id, type, name, is_enabled, config";

const DESTINATION_COLUMNS: &str =
    "id, rule_id, channel_id, is_enabled, override_text_template, action_config";

const ENDPOINT_COLUMNS: &str =
    "id, name, phone_number, imei, api_token, is_active, last_seen_at, created_at";

const ATTEMPT_COLUMNS: &str = "id, message_id, rule_id, channel_id, status, provider_message_id, error, last_attempt_at, retry_count, next_attempt_at, lease_owner, lease_until, version, created_at";

/// Attempt columns qualified with the `a` alias, for joins.
const ATTEMPT_COLUMNS_A: &str = "a.id, a.message_id, a.rule_id, a.channel_id, a.status, a.provider_message_id, a.error, a.last_attempt_at, a.retry_count, a.next_attempt_at, a.lease_owner, a.lease_until, a.version, a.created_at";

fn row_to_record(row: &libsql::Row) -> Result<DeliveryRecord, DatabaseError> {
    Ok(DeliveryRecord {
        attempt: row_to_attempt(row)?,
        channel_name: opt_col(row, 14),
        rule_name: opt_col(row, 15),
        message_content: opt_col(row, 16),
    })
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(&self, message: &IncomingMessage) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                params![
                    message.id.as_str(),
                    message.endpoint_id.as_str(),
                    message.from_number.as_str(),
                    message.to_number.as_str(),
                    message.body.as_str(),
                    ts(&message.received_at),
                    json_text(&message.raw_payload)?,
                    message.processed as i64,
                ],
            )
            .await
            .map_err(|e| query_err("insert_message", e))?;

        debug!(message_id = %message.id, endpoint = %message.endpoint_id, "Message stored");
        Ok(())
    }

    async fn get_message(&self, id: &str) -> Result<Option<IncomingMessage>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| query_err("get_message", e))?;
        first_row(rows, "get_message", row_to_message).await
    }

    async fn list_messages(
        &self,
        query: &MessageQuery,
    ) -> Result<Vec<IncomingMessage>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE (?1 IS NULL OR endpoint_id = ?1)
                       AND (?2 IS NULL OR processed = ?2)
                     ORDER BY received_at DESC, id DESC LIMIT ?3"
                ),
                params![
                    opt_text(query.endpoint_id.as_deref()),
                    opt_int(query.processed.map(i64::from)),
                    clamp_limit(query.limit),
                ],
            )
            .await
            .map_err(|e| query_err("list_messages", e))?;
        Ok(collect_rows(rows, "message", row_to_message).await)
    }

    async fn mark_routed(&self, message_id: &str, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE messages SET routed_at = ?2 WHERE id = ?1 AND routed_at IS NULL",
                params![message_id, ts(&at)],
            )
            .await
            .map_err(|e| query_err("mark_routed", e))?;
        Ok(())
    }

    async fn is_routed(&self, message_id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT routed_at IS NOT NULL FROM messages WHERE id = ?1",
                params![message_id],
            )
            .await
            .map_err(|e| query_err("is_routed", e))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(int_col(&row, 0)? != 0),
            Ok(None) => Err(DatabaseError::NotFound {
                entity: "message".into(),
                id: message_id.to_string(),
            }),
            Err(e) => Err(query_err("is_routed", e)),
        }
    }

    async fn list_stalled_messages(
        &self,
        received_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<IncomingMessage>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages m
                     WHERE processed = 0 AND received_at <= ?1
                       AND (routed_at IS NULL OR NOT EXISTS (
                           SELECT 1 FROM delivery_attempts a
                           WHERE a.message_id = m.id AND a.next_attempt_at IS NOT NULL
                       ))
                     ORDER BY received_at ASC LIMIT ?2"
                ),
                params![
                    ts(&received_before),
                    i64::try_from(limit.max(1)).unwrap_or(i64::MAX)
                ],
            )
            .await
            .map_err(|e| query_err("list_stalled_messages", e))?;
        Ok(collect_rows(rows, "message", row_to_message).await)
    }

    async fn mark_processed_if_settled(&self, message_id: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE messages SET processed = 1
             WHERE id = ?1 AND processed = 0 AND routed_at IS NOT NULL
               AND NOT EXISTS (
                   SELECT 1 FROM delivery_attempts
                   WHERE message_id = ?1 AND next_attempt_at IS NOT NULL
               )",
            params![message_id],
        )
        .await
        .map_err(|e| query_err("mark_processed_if_settled", e))?;

        let mut rows = conn
            .query("SELECT processed FROM messages WHERE id = ?1", params![message_id])
            .await
            .map_err(|e| query_err("mark_processed_if_settled", e))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(int_col(&row, 0)? != 0),
            Ok(None) => Err(DatabaseError::NotFound {
                entity: "message".into(),
                id: message_id.to_string(),
            }),
            Err(e) => Err(query_err("mark_processed_if_settled", e)),
        }
    }

    async fn traffic_by_hour(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<TrafficBucket>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT substr(received_at, 1, 13) AS hour, COUNT(*) FROM messages
                 WHERE received_at >= ?1 GROUP BY hour ORDER BY hour ASC",
                params![ts(&since)],
            )
            .await
            .map_err(|e| query_err("traffic_by_hour", e))?;

        let mut buckets = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let hour: String = text_col(&row, 0)?;
            let count: i64 = int_col(&row, 1)?;
            match chrono::NaiveDateTime::parse_from_str(&format!("{hour}:00:00"), "%Y-%m-%dT%H:%M:%S")
            {
                Ok(ndt) => buckets.push(TrafficBucket {
                    time: ndt.and_utc(),
                    sms_count: count.max(0) as u64,
                }),
                Err(e) => warn!(hour = %hour, "Skipping traffic bucket: {e}"),
            }
        }
        Ok(buckets)
    }

    async fn dashboard_summary(&self) -> Result<DashboardSummary, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT
                    (SELECT COUNT(*) FROM messages),
                    (SELECT COUNT(*) FROM messages WHERE processed = 0),
                    (SELECT COUNT(*) FROM delivery_attempts WHERE status = 'sent'),
                    (SELECT COUNT(*) FROM delivery_attempts WHERE status = 'failed' AND next_attempt_at IS NULL),
                    (SELECT COUNT(*) FROM delivery_attempts WHERE status = 'pending'),
                    (SELECT COUNT(*) FROM delivery_attempts WHERE status = 'failed' AND next_attempt_at IS NOT NULL)",
                (),
            )
            .await
            .map_err(|e| query_err("dashboard_summary", e))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(DashboardSummary::default()),
            Err(e) => return Err(query_err("dashboard_summary", e)),
        };
        let count = |idx| int_col(&row, idx).map(|n| n.max(0) as u64);
        Ok(DashboardSummary {
            messages_total: count(0)?,
            messages_unprocessed: count(1)?,
            deliveries_sent: count(2)?,
            deliveries_failed: count(3)?,
            deliveries_pending: count(4)?,
            retries_scheduled: count(5)?,
        })
    }

    // ── Rules ───────────────────────────────────────────────────────

    async fn create_rule(&self, rule: &ForwardRule) -> Result<(), DatabaseError> {
        let now = ts(&Utc::now());
        self.conn()
            .execute(
                "INSERT INTO rules (id, name, is_enabled, priority, filters, stop_processing, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    rule.id.as_str(),
                    rule.name.as_str(),
                    rule.is_enabled as i64,
                    rule.priority,
                    json_text(&rule.filters)?,
                    rule.stop_processing as i64,
                    now,
                ],
            )
            .await
            .map_err(|e| query_err("create_rule", e))?;
        debug!(rule_id = %rule.id, "Rule created");
        Ok(())
    }

    async fn get_rule(&self, id: &str) -> Result<Option<ForwardRule>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {RULE_COLUMNS} FROM rules WHERE id = ?1 AND deleted_at IS NULL"),
                params![id],
            )
            .await
            .map_err(|e| query_err("get_rule", e))?;
        first_row(rows, "get_rule", row_to_rule).await
    }

    async fn list_rules(&self) -> Result<Vec<ForwardRule>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM rules WHERE deleted_at IS NULL ORDER BY priority ASC, id ASC"
                ),
                (),
            )
            .await
            .map_err(|e| query_err("list_rules", e))?;
        Ok(collect_rows(rows, "rule", row_to_rule).await)
    }

    async fn update_rule(&self, rule: &ForwardRule) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE rules SET name = ?1, is_enabled = ?2, priority = ?3, filters = ?4,
                        stop_processing = ?5, updated_at = ?6
                 WHERE id = ?7 AND deleted_at IS NULL",
                params![
                    rule.name.as_str(),
                    rule.is_enabled as i64,
                    rule.priority,
                    json_text(&rule.filters)?,
                    rule.stop_processing as i64,
                    ts(&Utc::now()),
                    rule.id.as_str(),
                ],
            )
            .await
            .map_err(|e| query_err("update_rule", e))?;
        Ok(count > 0)
    }

    async fn delete_rule(&self, id: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let count = conn
            .execute(
                "UPDATE rules SET deleted_at = ?1, is_enabled = 0 WHERE id = ?2 AND deleted_at IS NULL",
                params![ts(&Utc::now()), id],
            )
            .await
            .map_err(|e| query_err("delete_rule", e))?;
        if count == 0 {
            return Ok(false);
        }
        conn.execute("DELETE FROM rule_destinations WHERE rule_id = ?1", params![id])
            .await
            .map_err(|e| query_err("delete_rule destinations", e))?;
        debug!(rule_id = %id, "Rule soft-deleted");
        Ok(true)
    }

    // ── Channels ────────────────────────────────────────────────────

    async fn create_channel(&self, channel: &DestinationChannel) -> Result<(), DatabaseError> {
        let now = ts(&Utc::now());
        self.conn()
            .execute(
                "INSERT INTO channels (id, type, name, is_enabled, config, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    channel.id.as_str(),
                    channel.channel_type.as_str(),
                    channel.name.as_str(),
                    channel.is_enabled as i64,
                    json_text(&channel.config)?,
                    now,
                ],
            )
            .await
            .map_err(|e| query_err("create_channel", e))?;
        debug!(channel_id = %channel.id, channel_type = %channel.channel_type, "Channel created");
        Ok(())
    }

    async fn get_channel(&self, id: &str) -> Result<Option<DestinationChannel>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = ?1 AND deleted_at IS NULL"
                ),
                params![id],
            )
            .await
            .map_err(|e| query_err("get_channel", e))?;
        first_row(rows, "get_channel", row_to_channel).await
    }

    async fn list_channels(&self) -> Result<Vec<DestinationChannel>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CHANNEL_COLUMNS} FROM channels WHERE deleted_at IS NULL ORDER BY name ASC, id ASC"
                ),
                (),
            )
            .await
            .map_err(|e| query_err("list_channels", e))?;
        Ok(collect_rows(rows, "channel", row_to_channel).await)
    }

    async fn update_channel(&self, channel: &DestinationChannel) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE channels SET type = ?1, name = ?2, is_enabled = ?3, config = ?4, updated_at = ?5
                 WHERE id = ?6 AND deleted_at IS NULL",
                params![
                    channel.channel_type.as_str(),
                    channel.name.as_str(),
                    channel.is_enabled as i64,
                    json_text(&channel.config)?,
                    ts(&Utc::now()),
                    channel.id.as_str(),
                ],
            )
            .await
            .map_err(|e| query_err("update_channel", e))?;
        Ok(count > 0)
    }

    async fn delete_channel(&self, id: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let count = conn
            .execute(
                "UPDATE channels SET deleted_at = ?1, is_enabled = 0 WHERE id = ?2 AND deleted_at IS NULL",
                params![ts(&Utc::now()), id],
            )
            .await
            .map_err(|e| query_err("delete_channel", e))?;
        if count == 0 {
            return Ok(false);
        }
        conn.execute("DELETE FROM rule_destinations WHERE channel_id = ?1", params![id])
            .await
            .map_err(|e| query_err("delete_channel destinations", e))?;
        debug!(channel_id = %id, "Channel soft-deleted");
        Ok(true)
    }

    // ── Rule destinations ───────────────────────────────────────────

    async fn create_rule_destination(&self, dest: &RuleDestination) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO rule_destinations (id, rule_id, channel_id, is_enabled, override_text_template, action_config, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    dest.id.as_str(),
                    dest.rule_id.as_str(),
                    dest.channel_id.as_str(),
                    dest.is_enabled as i64,
                    opt_text(dest.override_text_template.as_deref()),
                    json_text(&dest.action_config)?,
                    ts(&Utc::now()),
                ],
            )
            .await
            .map_err(|e| query_err("create_rule_destination", e))?;
        Ok(())
    }

    async fn get_rule_destination(
        &self,
        id: &str,
    ) -> Result<Option<RuleDestination>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {DESTINATION_COLUMNS} FROM rule_destinations WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| query_err("get_rule_destination", e))?;
        first_row(rows, "get_rule_destination", row_to_destination).await
    }

    async fn list_rule_destinations(
        &self,
        rule_id: Option<&str>,
    ) -> Result<Vec<RuleDestination>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {DESTINATION_COLUMNS} FROM rule_destinations
                     WHERE (?1 IS NULL OR rule_id = ?1) ORDER BY rowid ASC"
                ),
                params![opt_text(rule_id)],
            )
            .await
            .map_err(|e| query_err("list_rule_destinations", e))?;
        Ok(collect_rows(rows, "rule destination", row_to_destination).await)
    }

    async fn update_rule_destination(&self, dest: &RuleDestination) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE rule_destinations SET rule_id = ?1, channel_id = ?2, is_enabled = ?3,
                        override_text_template = ?4, action_config = ?5
                 WHERE id = ?6",
                params![
                    dest.rule_id.as_str(),
                    dest.channel_id.as_str(),
                    dest.is_enabled as i64,
                    opt_text(dest.override_text_template.as_deref()),
                    json_text(&dest.action_config)?,
                    dest.id.as_str(),
                ],
            )
            .await
            .map_err(|e| query_err("update_rule_destination", e))?;
        Ok(count > 0)
    }

    async fn delete_rule_destination(&self, id: &str) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute("DELETE FROM rule_destinations WHERE id = ?1", params![id])
            .await
            .map_err(|e| query_err("delete_rule_destination", e))?;
        Ok(count > 0)
    }

    // ── Endpoints ───────────────────────────────────────────────────

    async fn create_endpoint(&self, endpoint: &SimEndpoint) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO endpoints ({ENDPOINT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    endpoint.id.as_str(),
                    endpoint.name.as_str(),
                    endpoint.phone_number.as_str(),
                    opt_text(endpoint.imei.as_deref()),
                    endpoint.api_token.as_str(),
                    endpoint.is_active as i64,
                    opt_ts(&endpoint.last_seen_at),
                    ts(&endpoint.created_at),
                ],
            )
            .await
            .map_err(|e| query_err("create_endpoint", e))?;
        Ok(())
    }

    async fn get_endpoint(&self, id: &str) -> Result<Option<SimEndpoint>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {ENDPOINT_COLUMNS} FROM endpoints WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| query_err("get_endpoint", e))?;
        first_row(rows, "get_endpoint", row_to_endpoint).await
    }

    async fn get_endpoint_by_token(
        &self,
        token: &str,
    ) -> Result<Option<SimEndpoint>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {ENDPOINT_COLUMNS} FROM endpoints WHERE api_token = ?1"),
                params![token],
            )
            .await
            .map_err(|e| query_err("get_endpoint_by_token", e))?;
        first_row(rows, "get_endpoint_by_token", row_to_endpoint).await
    }

    async fn list_endpoints(&self) -> Result<Vec<SimEndpoint>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {ENDPOINT_COLUMNS} FROM endpoints ORDER BY created_at ASC"),
                (),
            )
            .await
            .map_err(|e| query_err("list_endpoints", e))?;
        Ok(collect_rows(rows, "endpoint", row_to_endpoint).await)
    }

    async fn update_endpoint(&self, endpoint: &SimEndpoint) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE endpoints SET name = ?1, phone_number = ?2, imei = ?3, api_token = ?4, is_active = ?5
                 WHERE id = ?6",
                params![
                    endpoint.name.as_str(),
                    endpoint.phone_number.as_str(),
                    opt_text(endpoint.imei.as_deref()),
                    endpoint.api_token.as_str(),
                    endpoint.is_active as i64,
                    endpoint.id.as_str(),
                ],
            )
            .await
            .map_err(|e| query_err("update_endpoint", e))?;
        Ok(count > 0)
    }

    async fn delete_endpoint(&self, id: &str) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute("DELETE FROM endpoints WHERE id = ?1", params![id])
            .await
            .map_err(|e| query_err("delete_endpoint", e))?;
        Ok(count > 0)
    }

    async fn touch_endpoint(&self, id: &str, seen_at: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE endpoints SET last_seen_at = ?1 WHERE id = ?2",
                params![ts(&seen_at), id],
            )
            .await
            .map_err(|e| query_err("touch_endpoint", e))?;
        Ok(())
    }

    // ── Delivery attempts ───────────────────────────────────────────

    async fn insert_attempt(&self, attempt: &DeliveryAttempt) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                &format!(
                    "INSERT INTO delivery_attempts ({ATTEMPT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                     ON CONFLICT (message_id, rule_id, channel_id) DO NOTHING"
                ),
                params![
                    attempt.id.as_str(),
                    attempt.message_id.as_str(),
                    attempt.rule_id.as_str(),
                    attempt.channel_id.as_str(),
                    attempt.status.as_str(),
                    opt_text(attempt.provider_message_id.as_deref()),
                    opt_text(attempt.error.as_deref()),
                    opt_ts(&attempt.last_attempt_at),
                    i64::from(attempt.retry_count),
                    opt_ts(&attempt.next_attempt_at),
                    opt_text(attempt.lease_owner.as_deref()),
                    opt_ts(&attempt.lease_until),
                    attempt.version,
                    ts(&attempt.created_at),
                ],
            )
            .await
            .map_err(|e| query_err("insert_attempt", e))?;

        if count == 0 {
            debug!(
                message_id = %attempt.message_id,
                rule_id = %attempt.rule_id,
                channel_id = %attempt.channel_id,
                "Attempt already exists, skipping"
            );
        }
        Ok(count > 0)
    }

    async fn get_attempt(&self, id: &str) -> Result<Option<DeliveryAttempt>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {ATTEMPT_COLUMNS} FROM delivery_attempts WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| query_err("get_attempt", e))?;
        first_row(rows, "get_attempt", row_to_attempt).await
    }

    async fn list_attempts_for_message(
        &self,
        message_id: &str,
    ) -> Result<Vec<DeliveryAttempt>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ATTEMPT_COLUMNS} FROM delivery_attempts WHERE message_id = ?1 ORDER BY rowid ASC"
                ),
                params![message_id],
            )
            .await
            .map_err(|e| query_err("list_attempts_for_message", e))?;
        Ok(collect_rows(rows, "attempt", row_to_attempt).await)
    }

    async fn list_deliveries(
        &self,
        query: &DeliveryQuery,
    ) -> Result<Vec<DeliveryRecord>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ATTEMPT_COLUMNS_A}, c.name, r.name, m.body
                     FROM delivery_attempts a
                     LEFT JOIN channels c ON c.id = a.channel_id
                     LEFT JOIN rules r ON r.id = a.rule_id
                     LEFT JOIN messages m ON m.id = a.message_id
                     WHERE (?1 IS NULL OR a.message_id = ?1)
                       AND (?2 IS NULL OR a.rule_id = ?2)
                       AND (?3 IS NULL OR a.channel_id = ?3)
                       AND (?4 IS NULL OR a.status = ?4)
                       AND (?5 IS NULL OR COALESCE(a.last_attempt_at, a.created_at) >= ?5)
                       AND (?6 IS NULL OR COALESCE(a.last_attempt_at, a.created_at) <= ?6)
                     ORDER BY COALESCE(a.last_attempt_at, a.created_at) DESC, a.rowid DESC
                     LIMIT ?7"
                ),
                params![
                    opt_text(query.message_id.as_deref()),
                    opt_text(query.rule_id.as_deref()),
                    opt_text(query.channel_id.as_deref()),
                    opt_text(query.status.as_ref().map(DeliveryStatus::as_str)),
                    opt_ts(&query.since),
                    opt_ts(&query.until),
                    clamp_limit(query.limit),
                ],
            )
            .await
            .map_err(|e| query_err("list_deliveries", e))?;
        Ok(collect_rows(rows, "delivery", row_to_record).await)
    }

    async fn claim_due_attempts(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryAttempt>, DatabaseError> {
        let conn = self.conn();
        let now_str = ts(&now);
        let rows = conn
            .query(
                &format!(
                    "SELECT {ATTEMPT_COLUMNS} FROM delivery_attempts
                     WHERE next_attempt_at IS NOT NULL AND next_attempt_at <= ?1
                       AND (lease_until IS NULL OR lease_until <= ?1)
                     ORDER BY next_attempt_at ASC LIMIT ?2"
                ),
                params![now_str.as_str(), limit.max(1) as i64],
            )
            .await
            .map_err(|e| query_err("claim_due_attempts", e))?;
        let candidates = collect_rows(rows, "attempt", row_to_attempt).await;

        let lease_str = ts(&lease_until);
        let mut claimed = Vec::with_capacity(candidates.len());
        for mut attempt in candidates {
            let count = conn
                .execute(
                    "UPDATE delivery_attempts
                     SET lease_owner = ?1, lease_until = ?2, version = version + 1
                     WHERE id = ?3 AND version = ?4",
                    params![owner, lease_str.as_str(), attempt.id.as_str(), attempt.version],
                )
                .await
                .map_err(|e| query_err("claim_due_attempts", e))?;
            if count != 1 {
                debug!(attempt_id = %attempt.id, "Lost claim race, skipping");
                continue;
            }
            attempt.lease_owner = Some(owner.to_string());
            attempt.lease_until = Some(lease_until);
            attempt.version += 1;
            claimed.push(attempt);
        }
        Ok(claimed)
    }

    async fn record_attempt_outcome(
        &self,
        update: &AttemptUpdate,
        owner: &str,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE delivery_attempts
                 SET status = ?1, provider_message_id = ?2, error = ?3, last_attempt_at = ?4,
                     retry_count = ?5, next_attempt_at = ?6, lease_owner = NULL, lease_until = NULL,
                     version = version + 1
                 WHERE id = ?7 AND lease_owner = ?8 AND version = ?9",
                params![
                    update.status.as_str(),
                    opt_text(update.provider_message_id.as_deref()),
                    opt_text(update.error.as_deref()),
                    ts(&update.last_attempt_at),
                    i64::from(update.retry_count),
                    opt_ts(&update.next_attempt_at),
                    update.id.as_str(),
                    owner,
                    update.version,
                ],
            )
            .await
            .map_err(|e| query_err("record_attempt_outcome", e))?;

        if count == 0 {
            warn!(
                attempt_id = %update.id,
                owner,
                version = update.version,
                "Outcome dropped, lease no longer held"
            );
        }
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    async fn unprocessed(db: &LibSqlBackend) -> Vec<IncomingMessage> {
        let query = MessageQuery {
            processed: Some(false),
            ..MessageQuery::default()
        };
        db.list_messages(&query).await.unwrap()
    }

    fn make_message(id: &str, received_at: DateTime<Utc>) -> IncomingMessage {
        IncomingMessage {
            id: id.into(),
            endpoint_id: "sim-1".into(),
            from_number: "+989121234567".into(),
            to_number: "+989120001122".into(),
            body: "ALERT: temp 46C".into(),
            received_at,
            raw_payload: json!({"signal": -71}),
            processed: false,
        }
    }

    fn make_rule(id: &str, priority: i64) -> ForwardRule {
        ForwardRule {
            id: id.into(),
            name: format!("rule {id}"),
            is_enabled: true,
            priority,
            filters: json!({"contains": "ALERT"}),
            stop_processing: false,
        }
    }

    fn make_channel(id: &str) -> DestinationChannel {
        DestinationChannel {
            id: id.into(),
            channel_type: ChannelType::Telegram,
            name: format!("channel {id}"),
            is_enabled: true,
            config: json!({"chat_id": "-100234234"}),
        }
    }

    fn make_destination(id: &str, rule: &str, channel: &str) -> RuleDestination {
        RuleDestination {
            id: id.into(),
            rule_id: rule.into(),
            channel_id: channel.into(),
            is_enabled: true,
            override_text_template: None,
            action_config: json!({"mute": true}),
        }
    }

    fn make_attempt(id: &str, message: &str, channel: &str, now: DateTime<Utc>) -> DeliveryAttempt {
        DeliveryAttempt {
            id: id.into(),
            message_id: message.into(),
            rule_id: "r1".into(),
            channel_id: channel.into(),
            status: DeliveryStatus::Pending,
            provider_message_id: None,
            error: None,
            last_attempt_at: None,
            retry_count: 0,
            next_attempt_at: Some(now),
            lease_owner: None,
            lease_until: None,
            version: 0,
            created_at: now,
        }
    }

    // ── Message tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn local_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("relay.db");

        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.insert_message(&make_message("m1", Utc::now())).await.unwrap();
            db.create_rule(&make_rule("r1", 1)).await.unwrap();
        }

        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(db.get_message("m1").await.unwrap().is_some());
        assert_eq!(db.list_rules().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn message_roundtrip() {
        let db = test_db().await;
        let msg = make_message("m1", Utc::now());
        db.insert_message(&msg).await.unwrap();

        let fetched = db.get_message("m1").await.unwrap().unwrap();
        assert_eq!(fetched.body, "ALERT: temp 46C");
        assert_eq!(fetched.raw_payload["signal"], -71);
        assert!(!fetched.processed);
        assert!(db.get_message("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_messages_filters_and_orders() {
        let db = test_db().await;
        let now = Utc::now();
        db.insert_message(&make_message("old", now - Duration::minutes(5)))
            .await
            .unwrap();
        let mut other = make_message("other", now);
        other.endpoint_id = "sim-2".into();
        db.insert_message(&other).await.unwrap();

        let all = db.list_messages(&MessageQuery::default()).await.unwrap();
        assert_eq!(all[0].id, "other");
        assert_eq!(all[1].id, "old");

        let sim1 = db
            .list_messages(&MessageQuery {
                endpoint_id: Some("sim-1".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(sim1.len(), 1);
        assert_eq!(sim1[0].id, "old");
    }

    #[tokio::test]
    async fn processed_waits_for_owed_dispatches() {
        let db = test_db().await;
        let now = Utc::now();
        db.insert_message(&make_message("m1", now)).await.unwrap();
        db.insert_attempt(&make_attempt("a1", "m1", "c1", now))
            .await
            .unwrap();

        assert!(!db.mark_processed_if_settled("m1").await.unwrap());
        db.mark_routed("m1", now).await.unwrap();
        assert!(!db.mark_processed_if_settled("m1").await.unwrap());
        assert_eq!(unprocessed(&db).await.len(), 1);

        let claimed = db
            .claim_due_attempts("w1", now, now + Duration::seconds(60), 10)
            .await
            .unwrap();
        let update = AttemptUpdate {
            id: claimed[0].id.clone(),
            status: DeliveryStatus::Sent,
            provider_message_id: Some("tg_msg_1".into()),
            error: None,
            last_attempt_at: now,
            retry_count: 0,
            next_attempt_at: None,
            version: claimed[0].version,
        };
        assert!(db.record_attempt_outcome(&update, "w1").await.unwrap());

        assert!(db.mark_processed_if_settled("m1").await.unwrap());
        assert!(unprocessed(&db).await.is_empty());
    }

    #[tokio::test]
    async fn routed_message_without_attempts_settles_immediately() {
        let db = test_db().await;
        let now = Utc::now();
        db.insert_message(&make_message("m1", now)).await.unwrap();
        // Unrouted messages never settle.
        assert!(!db.mark_processed_if_settled("m1").await.unwrap());
        assert!(!db.is_routed("m1").await.unwrap());

        db.mark_routed("m1", now).await.unwrap();
        assert!(db.is_routed("m1").await.unwrap());
        assert!(db.mark_processed_if_settled("m1").await.unwrap());
    }

    #[tokio::test]
    async fn stalled_messages_are_old_and_owe_nothing() {
        let db = test_db().await;
        let now = Utc::now();
        let old = now - Duration::minutes(10);
        // Routing never finished.
        db.insert_message(&make_message("unrouted", old)).await.unwrap();
        // Routed, but settling was never recorded.
        db.insert_message(&make_message("unsettled", old)).await.unwrap();
        db.mark_routed("unsettled", old).await.unwrap();
        // Routed with a retry still owed: the retry worker settles it.
        db.insert_message(&make_message("retrying", old)).await.unwrap();
        db.mark_routed("retrying", old).await.unwrap();
        db.insert_attempt(&make_attempt("a1", "retrying", "c1", old)).await.unwrap();
        // Too recent: its own pipeline run may still be going.
        db.insert_message(&make_message("fresh", now)).await.unwrap();

        let cutoff = now - Duration::minutes(1);
        let stalled = db.list_stalled_messages(cutoff, 10).await.unwrap();
        let ids: Vec<&str> = stalled.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"unrouted"));
        assert!(ids.contains(&"unsettled"));

        assert_eq!(db.list_stalled_messages(cutoff, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn traffic_groups_by_hour() {
        let db = test_db().await;
        let base = chrono::TimeZone::with_ymd_and_hms(&Utc, 2026, 3, 1, 8, 10, 0).unwrap();
        db.insert_message(&make_message("m1", base)).await.unwrap();
        db.insert_message(&make_message("m2", base + Duration::minutes(20)))
            .await
            .unwrap();
        db.insert_message(&make_message("m3", base + Duration::hours(2)))
            .await
            .unwrap();

        let buckets = db.traffic_by_hour(base - Duration::hours(1)).await.unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].sms_count, 2);
        assert_eq!(
            buckets[0].time,
            chrono::TimeZone::with_ymd_and_hms(&Utc, 2026, 3, 1, 8, 0, 0).unwrap()
        );
        assert_eq!(buckets[1].sms_count, 1);
    }

    // ── Rule / channel tests ────────────────────────────────────────

    #[tokio::test]
    async fn rules_ordered_and_soft_deleted() {
        let db = test_db().await;
        db.create_rule(&make_rule("b", 10)).await.unwrap();
        db.create_rule(&make_rule("a", 10)).await.unwrap();
        db.create_rule(&make_rule("z", 1)).await.unwrap();

        let ids: Vec<String> = db.list_rules().await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["z", "a", "b"]);

        db.create_channel(&make_channel("c1")).await.unwrap();
        db.create_rule_destination(&make_destination("rd1", "a", "c1"))
            .await
            .unwrap();

        assert!(db.delete_rule("a").await.unwrap());
        assert!(!db.delete_rule("a").await.unwrap());
        assert!(db.get_rule("a").await.unwrap().is_none());
        assert_eq!(db.list_rules().await.unwrap().len(), 2);
        assert!(db.list_rule_destinations(Some("a")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rule_with_corrupt_filters_is_skipped() {
        let db = test_db().await;
        db.create_rule(&make_rule("good", 1)).await.unwrap();
        db.create_rule(&make_rule("bad", 2)).await.unwrap();
        db.conn()
            .execute("UPDATE rules SET filters = '{\"contains\": ' WHERE id = 'bad'", ())
            .await
            .unwrap();

        let ids: Vec<String> = db.list_rules().await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["good"]);
        assert!(matches!(
            db.get_rule("bad").await,
            Err(DatabaseError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn update_rule_changes_fields() {
        let db = test_db().await;
        let mut rule = make_rule("r1", 10);
        db.create_rule(&rule).await.unwrap();

        rule.stop_processing = true;
        rule.filters = json!({});
        assert!(db.update_rule(&rule).await.unwrap());

        let fetched = db.get_rule("r1").await.unwrap().unwrap();
        assert!(fetched.stop_processing);
        assert_eq!(fetched.filters, json!({}));
        assert!(!db.update_rule(&make_rule("missing", 1)).await.unwrap());
    }

    #[tokio::test]
    async fn destinations_keep_insertion_order() {
        let db = test_db().await;
        db.create_rule(&make_rule("r1", 1)).await.unwrap();
        for c in ["c3", "c1", "c2"] {
            db.create_channel(&make_channel(c)).await.unwrap();
        }
        db.create_rule_destination(&make_destination("x", "r1", "c3")).await.unwrap();
        db.create_rule_destination(&make_destination("a", "r1", "c1")).await.unwrap();
        db.create_rule_destination(&make_destination("m", "r1", "c2")).await.unwrap();

        let ids: Vec<String> = db
            .list_rule_destinations(Some("r1"))
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["x", "a", "m"]);
    }

    #[tokio::test]
    async fn duplicate_destination_pair_is_constraint_error() {
        let db = test_db().await;
        db.create_rule(&make_rule("r1", 1)).await.unwrap();
        db.create_channel(&make_channel("c1")).await.unwrap();
        db.create_rule_destination(&make_destination("d1", "r1", "c1")).await.unwrap();
        let err = db
            .create_rule_destination(&make_destination("d2", "r1", "c1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }

    #[tokio::test]
    async fn channel_soft_delete_drops_destinations() {
        let db = test_db().await;
        db.create_rule(&make_rule("r1", 1)).await.unwrap();
        db.create_channel(&make_channel("c1")).await.unwrap();
        db.create_rule_destination(&make_destination("d1", "r1", "c1")).await.unwrap();

        assert!(db.delete_channel("c1").await.unwrap());
        assert!(db.get_channel("c1").await.unwrap().is_none());
        assert!(db.list_channels().await.unwrap().is_empty());
        assert!(db.get_rule_destination("d1").await.unwrap().is_none());
    }

    // ── Endpoint tests ──────────────────────────────────────────────

    #[tokio::test]
    async fn endpoint_crud_and_touch() {
        let db = test_db().await;
        let endpoint = SimEndpoint {
            id: "sim-1".into(),
            name: "Warehouse SIM".into(),
            phone_number: "+989120001122".into(),
            imei: None,
            api_token: "tok".into(),
            is_active: true,
            last_seen_at: None,
            created_at: Utc::now(),
        };
        db.create_endpoint(&endpoint).await.unwrap();

        let by_token = db.get_endpoint_by_token("tok").await.unwrap().unwrap();
        assert_eq!(by_token.id, "sim-1");
        assert!(db.get_endpoint_by_token("other").await.unwrap().is_none());

        let seen = Utc::now();
        db.touch_endpoint("sim-1", seen).await.unwrap();
        let fetched = db.get_endpoint("sim-1").await.unwrap().unwrap();
        assert!(fetched.last_seen_at.is_some());

        let mut updated = fetched.clone();
        updated.is_active = false;
        assert!(db.update_endpoint(&updated).await.unwrap());
        assert!(!db.get_endpoint("sim-1").await.unwrap().unwrap().is_active);

        assert!(db.delete_endpoint("sim-1").await.unwrap());
        assert!(db.list_endpoints().await.unwrap().is_empty());
    }

    // ── Attempt tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn insert_attempt_rejects_duplicate_triple() {
        let db = test_db().await;
        let now = Utc::now();
        db.insert_message(&make_message("m1", now)).await.unwrap();

        assert!(db.insert_attempt(&make_attempt("a1", "m1", "c1", now)).await.unwrap());
        assert!(!db.insert_attempt(&make_attempt("a2", "m1", "c1", now)).await.unwrap());
        assert!(db.get_attempt("a2").await.unwrap().is_none());
        assert_eq!(db.list_attempts_for_message("m1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claim_leases_due_attempts_once() {
        let db = test_db().await;
        let now = Utc::now();
        db.insert_message(&make_message("m1", now)).await.unwrap();
        db.insert_attempt(&make_attempt("due", "m1", "c1", now)).await.unwrap();
        let mut later = make_attempt("later", "m1", "c2", now);
        later.next_attempt_at = Some(now + Duration::minutes(10));
        db.insert_attempt(&later).await.unwrap();

        let lease = now + Duration::seconds(60);
        let first = db.claim_due_attempts("w1", now, lease, 10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, "due");
        assert_eq!(first[0].version, 1);
        assert_eq!(first[0].lease_owner.as_deref(), Some("w1"));

        // Still leased: a second worker gets nothing.
        let second = db.claim_due_attempts("w2", now, lease, 10).await.unwrap();
        assert!(second.is_empty());

        // Lease expired: reclaimable.
        let third = db
            .claim_due_attempts("w2", lease + Duration::seconds(1), lease + Duration::seconds(61), 10)
            .await
            .unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].version, 2);
    }

    #[tokio::test]
    async fn outcome_requires_current_lease() {
        let db = test_db().await;
        let now = Utc::now();
        db.insert_message(&make_message("m1", now)).await.unwrap();
        db.insert_attempt(&make_attempt("a1", "m1", "c1", now)).await.unwrap();
        db.claim_due_attempts("w1", now, now + Duration::seconds(60), 10)
            .await
            .unwrap();

        let mut update = AttemptUpdate {
            id: "a1".into(),
            status: DeliveryStatus::Failed,
            provider_message_id: None,
            error: Some("Timeout: 5000ms exceeded".into()),
            last_attempt_at: now,
            retry_count: 1,
            next_attempt_at: Some(now + Duration::seconds(30)),
            version: 0,
        };
        // Stale version from before the claim.
        assert!(!db.record_attempt_outcome(&update, "w1").await.unwrap());

        update.version = 1;
        assert!(!db.record_attempt_outcome(&update, "w2").await.unwrap());
        assert!(db.record_attempt_outcome(&update, "w1").await.unwrap());

        let stored = db.get_attempt("a1").await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Failed);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.version, 2);
        assert!(stored.lease_owner.is_none());
        assert!(stored.next_attempt_at.is_some());

        // The same write cannot land twice.
        assert!(!db.record_attempt_outcome(&update, "w1").await.unwrap());
    }

    #[tokio::test]
    async fn outcome_from_an_earlier_lease_of_the_same_owner_is_dropped() {
        let db = test_db().await;
        let now = Utc::now();
        db.insert_message(&make_message("m1", now)).await.unwrap();
        db.insert_attempt(&make_attempt("a1", "m1", "c1", now)).await.unwrap();

        let first = db
            .claim_due_attempts("w1", now, now + Duration::seconds(60), 10)
            .await
            .unwrap();
        // The lease lapses and the same owner claims again.
        let later = now + Duration::seconds(61);
        let second = db
            .claim_due_attempts("w1", later, later + Duration::seconds(60), 10)
            .await
            .unwrap();
        assert_eq!(second[0].version, first[0].version + 1);

        let stale = AttemptUpdate {
            id: "a1".into(),
            status: DeliveryStatus::Sent,
            provider_message_id: Some("old".into()),
            error: None,
            last_attempt_at: now,
            retry_count: 0,
            next_attempt_at: None,
            version: first[0].version,
        };
        assert!(!db.record_attempt_outcome(&stale, "w1").await.unwrap());
        assert!(db.get_attempt("a1").await.unwrap().unwrap().next_attempt_at.is_some());
    }

    #[tokio::test]
    async fn deliveries_are_denormalised() {
        let db = test_db().await;
        let now = Utc::now();
        db.insert_message(&make_message("m1", now)).await.unwrap();
        db.create_rule(&make_rule("r1", 1)).await.unwrap();
        db.create_channel(&make_channel("c1")).await.unwrap();
        db.insert_attempt(&make_attempt("a1", "m1", "c1", now)).await.unwrap();

        // A soft-deleted channel keeps its name in history.
        db.delete_channel("c1").await.unwrap();

        let records = db.list_deliveries(&DeliveryQuery::default()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].channel_name.as_deref(), Some("channel c1"));
        assert_eq!(records[0].rule_name.as_deref(), Some("rule r1"));
        assert_eq!(records[0].message_content.as_deref(), Some("ALERT: temp 46C"));

        let sent = db
            .list_deliveries(&DeliveryQuery {
                status: Some(DeliveryStatus::Sent),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(sent.is_empty());
    }

    #[tokio::test]
    async fn summary_counts() {
        let db = test_db().await;
        let now = Utc::now();
        db.insert_message(&make_message("m1", now)).await.unwrap();
        db.insert_message(&make_message("m2", now)).await.unwrap();
        db.insert_attempt(&make_attempt("a1", "m1", "c1", now)).await.unwrap();
        db.mark_routed("m2", now).await.unwrap();
        db.mark_processed_if_settled("m2").await.unwrap();

        let summary = db.dashboard_summary().await.unwrap();
        assert_eq!(summary.messages_total, 2);
        assert_eq!(summary.messages_unprocessed, 1);
        assert_eq!(summary.deliveries_pending, 1);
        assert_eq!(summary.deliveries_sent, 0);
    }
}
