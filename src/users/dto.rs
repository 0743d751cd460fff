use serde::Deserialize;
use serde_json::Value;

use super::repo::Scope;
use super::rules::{FieldValue, Fields};

/// A request field as sent. Values of the wrong JSON type are kept so the
/// rule set can report them per field instead of failing the whole body.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Typed<T> {
    Valid(T),
    Mistyped(Value),
}

impl<T> Typed<T> {
    pub fn valid(&self) -> Option<&T> {
        match self {
            Typed::Valid(v) => Some(v),
            Typed::Mistyped(_) => None,
        }
    }
}

impl<T> From<T> for Typed<T> {
    fn from(value: T) -> Self {
        Typed::Valid(value)
    }
}

impl From<&str> for Typed<String> {
    fn from(value: &str) -> Self {
        Typed::Valid(value.to_owned())
    }
}

fn text(value: &Option<Typed<String>>) -> FieldValue<'_> {
    match value {
        None => FieldValue::Missing,
        Some(Typed::Valid(s)) => FieldValue::Text(s),
        Some(Typed::Mistyped(v)) => FieldValue::Mistyped(v),
    }
}

fn ids(value: &Option<Typed<Vec<i64>>>) -> FieldValue<'_> {
    match value {
        None => FieldValue::Missing,
        Some(Typed::Valid(ids)) => FieldValue::Ids(ids),
        Some(Typed::Mistyped(v)) => FieldValue::Mistyped(v),
    }
}

fn valid_str(value: &Option<Typed<String>>) -> Option<&str> {
    value.as_ref().and_then(Typed::valid).map(String::as_str)
}

fn normalize_email(email: &mut Option<Typed<String>>) {
    if let Some(Typed::Valid(e)) = email {
        *e = e.trim().to_lowercase();
    }
}

/// Body of `POST /user`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateUserRequest {
    pub username: Option<Typed<String>>,
    pub email: Option<Typed<String>>,
    pub password: Option<Typed<String>>,
    pub password_confirmation: Option<Typed<String>>,
    pub firstname: Option<Typed<String>>,
    pub lastname: Option<Typed<String>>,
    pub roles: Option<Typed<Vec<i64>>>,
    /// `data:image/<type>;base64,<payload>`
    pub avatar: Option<Typed<String>>,
}

impl CreateUserRequest {
    pub fn normalize(&mut self) {
        normalize_email(&mut self.email);
    }

    pub fn avatar(&self) -> Option<&str> {
        valid_str(&self.avatar)
    }

    pub fn role_ids(&self) -> &[i64] {
        self.roles.as_ref().and_then(Typed::valid).map(Vec::as_slice).unwrap_or_default()
    }
}

impl Fields for CreateUserRequest {
    fn field(&self, name: &str) -> FieldValue<'_> {
        match name {
            "username" => text(&self.username),
            "email" => text(&self.email),
            "password" => text(&self.password),
            "password_confirmation" => text(&self.password_confirmation),
            "firstname" => text(&self.firstname),
            "lastname" => text(&self.lastname),
            "avatar" => text(&self.avatar),
            "roles" => ids(&self.roles),
            _ => FieldValue::Missing,
        }
    }
}

/// Body of `PATCH /user/{id}`. Every field is optional; roles are
/// assigned separately.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateUserRequest {
    pub username: Option<Typed<String>>,
    pub email: Option<Typed<String>>,
    pub password: Option<Typed<String>>,
    pub password_confirmation: Option<Typed<String>>,
    pub firstname: Option<Typed<String>>,
    pub lastname: Option<Typed<String>>,
    /// Empty string clears the stored avatar.
    pub avatar: Option<Typed<String>>,
}

impl UpdateUserRequest {
    pub fn normalize(&mut self) {
        normalize_email(&mut self.email);
    }

    pub fn avatar(&self) -> Option<&str> {
        valid_str(&self.avatar)
    }
}

impl Fields for UpdateUserRequest {
    fn field(&self, name: &str) -> FieldValue<'_> {
        match name {
            "username" => text(&self.username),
            "email" => text(&self.email),
            "password" => text(&self.password),
            "password_confirmation" => text(&self.password_confirmation),
            "firstname" => text(&self.firstname),
            "lastname" => text(&self.lastname),
            "avatar" => text(&self.avatar),
            _ => FieldValue::Missing,
        }
    }
}

/// Body of `PUT /user/{id}/roles`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssignRolesRequest {
    pub roles: Option<Typed<Vec<i64>>>,
}

impl AssignRolesRequest {
    pub fn role_ids(&self) -> &[i64] {
        self.roles.as_ref().and_then(Typed::valid).map(Vec::as_slice).unwrap_or_default()
    }
}

impl Fields for AssignRolesRequest {
    fn field(&self, name: &str) -> FieldValue<'_> {
        match name {
            "roles" => ids(&self.roles),
            _ => FieldValue::Missing,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trashed {
    With,
    Only,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub trashed: Option<Trashed>,
}

impl ListQuery {
    pub fn scope(&self) -> Scope {
        match self.trashed {
            None => Scope::Active,
            Some(Trashed::With) => Scope::WithTrashed,
            Some(Trashed::Only) => Scope::OnlyTrashed,
        }
    }
}
