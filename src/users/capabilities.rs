//! Behaviours composed onto account records.

use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

/// Records carrying a deletion marker instead of being removed.
pub trait SoftDeletable {
    fn deleted_at(&self) -> Option<OffsetDateTime>;

    fn trashed(&self) -> bool {
        self.deleted_at().is_some()
    }
}

/// Records whose changes are written to the activity log.
pub trait Auditable {
    /// Kind of subject stored alongside each activity.
    fn subject_type(&self) -> &'static str;
    fn subject_id(&self) -> String;
    /// Human-readable line for an audit event such as `created`.
    fn audit_description(&self, event_name: &str) -> String;
    /// Tracked attributes, in declaration order.
    fn audit_attributes(&self) -> Vec<(&'static str, Value)>;
    /// Attributes whose values never reach the log.
    fn redacted_attributes(&self) -> &'static [&'static str] {
        &[]
    }
}

/// Records that can receive notifications.
pub trait Notifiable {
    fn route_notification_for_mail(&self) -> &str;
}

/// Source of primary keys assigned before insertion.
pub trait IdentifierGenerator: Send + Sync {
    fn generate(&self) -> Uuid;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UuidV4;

impl IdentifierGenerator for UuidV4 {
    fn generate(&self) -> Uuid {
        Uuid::new_v4()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_v4_generates_distinct_ids() {
        let ids = UuidV4;
        let a = ids.generate();
        let b = ids.generate();
        assert_ne!(a, b);
        assert_eq!(a.get_version_num(), 4);
    }
}
