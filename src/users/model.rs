use serde::Serialize;
use serde_json::{json, Map, Value};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use super::avatar::AvatarView;
use super::capabilities::{Auditable, Notifiable, SoftDeletable};
use super::repo::UserStore;
use super::roles::{AttachedRole, RoleRelation, RoleRequirement};
use super::rules::{rules_for, Flow, RuleSet};
use crate::auth::jwt::JwtSubject;
use crate::error::{AppError, AppResult};

/// Attributes that may be set from request input.
pub const FILLABLE: &[&str] = &["username", "email", "password", "firstname", "lastname"];

/// Attributes that never appear in an emitted representation.
pub const HIDDEN: &[&str] = &["password", "remember_token", "pivot"];

/// Account record in the `users` table.
///
/// `Serialize` leaves out every [`HIDDEN`] attribute and the raw avatar
/// filename; clients receive [`UserView`], which adds the computed fields.
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    #[sqlx(rename = "password")]
    pub password_hash: String,
    pub firstname: Option<String>,
    pub lastname: Option<String>,
    #[serde(skip_serializing)]
    pub avatar: Option<String>,
    #[serde(skip_serializing)]
    pub remember_token: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

impl User {
    /// Empty record with a pre-assigned id.
    pub fn new(id: Uuid) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id,
            username: String::new(),
            email: String::new(),
            password_hash: String::new(),
            firstname: None,
            lastname: None,
            avatar: None,
            remember_token: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Title-cased `firstname lastname`.
    pub fn fullname(&self) -> AppResult<String> {
        let firstname = self
            .firstname
            .as_deref()
            .ok_or(AppError::Precondition("firstname"))?;
        let joined = match self.lastname.as_deref() {
            Some(lastname) if !lastname.is_empty() => format!("{firstname} {lastname}"),
            _ => firstname.to_owned(),
        };
        Ok(title_case(&joined))
    }

    /// Avatar URLs under `base_url`, or `None` when no avatar is stored.
    pub fn avatar_view(&self, base_url: &str) -> Option<AvatarView> {
        self.avatar
            .as_deref()
            .filter(|filename| !filename.is_empty())
            .map(|filename| AvatarView::compose(base_url, self.id, filename))
    }

    pub fn validation_rules(flow: Flow) -> RuleSet {
        rules_for(flow)
    }

    pub fn roles<'a>(&self, store: &'a dyn UserStore) -> RoleRelation<'a> {
        RoleRelation::new(store, self.id)
    }

    pub async fn has_role(&self, store: &dyn UserStore, role_name: &str) -> anyhow::Result<bool> {
        let found = self.roles(store).first_named(&[role_name.to_owned()]).await?;
        Ok(found.is_some())
    }

    pub async fn has_any_role(
        &self,
        store: &dyn UserStore,
        role_names: &[String],
    ) -> anyhow::Result<bool> {
        let found = self.roles(store).first_named(role_names).await?;
        Ok(found.is_some())
    }

    /// `Ok(true)` when the user holds the required role(s), otherwise
    /// [`AppError::Unauthorized`] naming them.
    pub async fn authorize_roles(
        &self,
        store: &dyn UserStore,
        required: impl Into<RoleRequirement>,
    ) -> AppResult<bool> {
        let required = required.into();
        let allowed = match &required {
            RoleRequirement::One(name) => self.has_role(store, name).await?,
            RoleRequirement::Any(names) => self.has_any_role(store, names).await?,
        };
        if allowed {
            Ok(true)
        } else {
            tracing::debug!(user_id = %self.id, roles = ?required.names(), "role check denied");
            Err(AppError::Unauthorized(required.denial_message()))
        }
    }

    /// Value of a fillable attribute.
    pub fn attribute(&self, name: &str) -> Value {
        match name {
            "username" => json!(self.username),
            "email" => json!(self.email),
            "password" => json!(self.password_hash),
            "firstname" => json!(self.firstname),
            "lastname" => json!(self.lastname),
            _ => Value::Null,
        }
    }

    /// Set a fillable text attribute. Returns false for anything else.
    pub(crate) fn set_attribute(&mut self, name: &str, value: &str) -> bool {
        match name {
            "username" => self.username = value.to_owned(),
            "email" => self.email = value.to_owned(),
            "firstname" => self.firstname = Some(value.to_owned()),
            "lastname" => self.lastname = Some(value.to_owned()).filter(|v| !v.is_empty()),
            _ => return false,
        }
        true
    }
}

impl JwtSubject for User {
    fn identity_claim(&self) -> Uuid {
        self.id
    }

    fn custom_claims(&self) -> Map<String, Value> {
        Map::new()
    }
}

impl SoftDeletable for User {
    fn deleted_at(&self) -> Option<OffsetDateTime> {
        self.deleted_at
    }
}

impl Auditable for User {
    fn subject_type(&self) -> &'static str {
        "user"
    }

    fn subject_id(&self) -> String {
        self.id.to_string()
    }

    fn audit_description(&self, event_name: &str) -> String {
        format!("This user has been {event_name}")
    }

    fn audit_attributes(&self) -> Vec<(&'static str, Value)> {
        FILLABLE.iter().map(|&name| (name, self.attribute(name))).collect()
    }

    fn redacted_attributes(&self) -> &'static [&'static str] {
        HIDDEN
    }
}

impl Notifiable for User {
    fn route_notification_for_mail(&self) -> &str {
        &self.email
    }
}

/// Uppercase the first letter of every whitespace-separated word.
fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut word_start = true;
    for c in s.chars() {
        if word_start {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        word_start = c.is_whitespace();
    }
    out
}

/// Outward representation of a user.
#[derive(Debug, Clone, Serialize)]
pub struct UserView {
    #[serde(flatten)]
    pub user: User,
    pub fullname: String,
    pub avatar: Option<AvatarView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<AttachedRole>>,
}

impl UserView {
    pub fn new(user: User, base_url: &str) -> AppResult<Self> {
        Ok(Self {
            fullname: user.fullname()?,
            avatar: user.avatar_view(base_url),
            user,
            roles: None,
        })
    }

    pub fn with_roles(mut self, roles: Vec<AttachedRole>) -> Self {
        self.roles = Some(roles);
        self
    }
}
