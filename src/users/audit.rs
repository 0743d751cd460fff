//! Activity log: before/after diffs of tracked attributes.

use std::fmt;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::{types::Json, PgPool};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use super::capabilities::Auditable;

const LOG_NAME: &str = "default";
const REDACTED: &str = "********";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditEvent {
    Created,
    Updated,
    Deleted,
    Restored,
}

impl AuditEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditEvent::Created => "created",
            AuditEvent::Updated => "updated",
            AuditEvent::Deleted => "deleted",
            AuditEvent::Restored => "restored",
        }
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One activity log entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Activity {
    pub log_name: &'static str,
    pub description: String,
    pub event: AuditEvent,
    pub subject_type: &'static str,
    pub subject_id: String,
    pub causer_id: Option<Uuid>,
    /// `{"attributes": {...}}`, plus `"old"` for updates.
    pub properties: Value,
}

impl Activity {
    /// Entry for `event` on `subject`. For updates, `before` is the prior
    /// state and only changed attributes are kept; returns `None` when
    /// nothing changed.
    pub fn record<T: Auditable>(
        subject: &T,
        event: AuditEvent,
        before: Option<&T>,
        causer_id: Option<Uuid>,
    ) -> Option<Self> {
        let redacted = subject.redacted_attributes();
        let after = subject.audit_attributes();

        let mut attributes = Map::new();
        let mut old = Map::new();
        match before {
            Some(before) => {
                for ((name, new), (_, prev)) in after.into_iter().zip(before.audit_attributes()) {
                    if new != prev {
                        attributes.insert(name.to_owned(), redact(name, new, redacted));
                        old.insert(name.to_owned(), redact(name, prev, redacted));
                    }
                }
                if attributes.is_empty() {
                    return None;
                }
            }
            None => {
                for (name, value) in after {
                    attributes.insert(name.to_owned(), redact(name, value, redacted));
                }
            }
        }

        let mut properties = Map::new();
        properties.insert("attributes".into(), Value::Object(attributes));
        if before.is_some() {
            properties.insert("old".into(), Value::Object(old));
        }

        Some(Self {
            log_name: LOG_NAME,
            description: subject.audit_description(event.as_str()),
            event,
            subject_type: subject.subject_type(),
            subject_id: subject.subject_id(),
            causer_id,
            properties: Value::Object(properties),
        })
    }
}

fn redact(name: &str, value: Value, redacted: &[&str]) -> Value {
    if redacted.contains(&name) && !value.is_null() {
        Value::String(REDACTED.into())
    } else {
        value
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write(&self, activity: Activity) -> anyhow::Result<()>;
}

/// Writes to the `activity_log` table.
pub struct PgAuditSink {
    db: PgPool,
}

impl PgAuditSink {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn write(&self, activity: Activity) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO activity_log (log_name, description, event, subject_type, subject_id,
                                      causer_id, properties)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(activity.log_name)
        .bind(&activity.description)
        .bind(activity.event.as_str())
        .bind(activity.subject_type)
        .bind(&activity.subject_id)
        .bind(activity.causer_id)
        .bind(Json(&activity.properties))
        .execute(&self.db)
        .await
        .context("insert activity")?;
        Ok(())
    }
}

/// Emits activities as log events.
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn write(&self, activity: Activity) -> anyhow::Result<()> {
        info!(
            event = %activity.event,
            subject_type = activity.subject_type,
            subject_id = %activity.subject_id,
            causer_id = ?activity.causer_id,
            properties = %activity.properties,
            "{}",
            activity.description
        );
        Ok(())
    }
}

/// Keeps activities in memory.
#[derive(Default)]
pub struct MemoryAuditSink {
    entries: RwLock<Vec<Activity>>,
}

impl MemoryAuditSink {
    pub async fn entries(&self) -> Vec<Activity> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn write(&self, activity: Activity) -> anyhow::Result<()> {
        self.entries.write().await.push(activity);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::model::User;
    use serde_json::json;

    fn user() -> User {
        let mut user = User::new(Uuid::new_v4());
        user.username = "jdoe".into();
        user.email = "john@example.com".into();
        user.password_hash = "$argon2id$hash".into();
        user.firstname = Some("john".into());
        user
    }

    #[test]
    fn created_logs_every_fillable_attribute() {
        let user = user();
        let activity = Activity::record(&user, AuditEvent::Created, None, None).unwrap();
        assert_eq!(activity.description, "This user has been created");
        assert_eq!(activity.subject_type, "user");
        assert_eq!(activity.subject_id, user.id.to_string());
        assert_eq!(
            activity.properties,
            json!({
                "attributes": {
                    "username": "jdoe",
                    "email": "john@example.com",
                    "password": "********",
                    "firstname": "john",
                    "lastname": null,
                }
            })
        );
    }

    #[test]
    fn updated_logs_only_the_diff() {
        let before = user();
        let mut after = before.clone();
        after.lastname = Some("doe".into());
        after.password_hash = "$argon2id$other".into();
        let causer = Uuid::new_v4();

        let activity =
            Activity::record(&after, AuditEvent::Updated, Some(&before), Some(causer)).unwrap();
        assert_eq!(activity.causer_id, Some(causer));
        assert_eq!(
            activity.properties,
            json!({
                "attributes": { "password": "********", "lastname": "doe" },
                "old": { "password": "********", "lastname": null },
            })
        );
    }

    #[test]
    fn unchanged_update_is_not_logged() {
        let user = user();
        assert!(Activity::record(&user, AuditEvent::Updated, Some(&user), None).is_none());
    }

    #[tokio::test]
    async fn memory_sink_keeps_entries() {
        let sink = MemoryAuditSink::default();
        let activity = Activity::record(&user(), AuditEvent::Deleted, None, None).unwrap();
        sink.write(activity.clone()).await.unwrap();
        assert_eq!(sink.entries().await, vec![activity]);
        TracingAuditSink
            .write(Activity::record(&user(), AuditEvent::Restored, None, None).unwrap())
            .await
            .unwrap();
    }
}
