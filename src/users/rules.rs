//! Declarative validation rules for account input and their evaluator.

use std::collections::BTreeMap;
use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::repo::UserStore;

lazy_static! {
    static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    pub static ref AVATAR_RE: Regex =
        Regex::new(r#"^data:image/([a-zA-Z]*);base64,([^"]*)$"#).unwrap();
}

/// A single validation constraint on a field.
#[derive(Debug, Clone)]
pub enum Rule {
    /// Stop checking the field after its first failure.
    Bail,
    /// Check the field only when the input carries it.
    Sometimes,
    /// Missing or empty values pass without further checks.
    Nullable,
    Required,
    Array,
    Max(usize),
    Min(usize),
    Email,
    /// Must equal `<field>_confirmation`.
    Confirmed,
    /// `column` selects the store's uniqueness check over active users.
    /// `table` only names the rule in its `unique:table,column` form.
    Unique {
        table: &'static str,
        column: &'static str,
    },
    /// Checked per element through the store's role lookup. `table` and
    /// `column` only name the rule in its `exists:table,column` form.
    Exists {
        table: &'static str,
        column: &'static str,
    },
    Pattern(&'static Regex),
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::Bail => f.write_str("bail"),
            Rule::Sometimes => f.write_str("sometimes"),
            Rule::Nullable => f.write_str("nullable"),
            Rule::Required => f.write_str("required"),
            Rule::Array => f.write_str("array"),
            Rule::Max(n) => write!(f, "max:{n}"),
            Rule::Min(n) => write!(f, "min:{n}"),
            Rule::Email => f.write_str("email"),
            Rule::Confirmed => f.write_str("confirmed"),
            Rule::Unique { table, column } => write!(f, "unique:{table},{column}"),
            Rule::Exists { table, column } => write!(f, "exists:{table},{column}"),
            Rule::Pattern(re) => write!(f, "regex:/{}/", re.as_str()),
        }
    }
}

/// Which flow a rule set guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Create,
    /// Profile edit; fields are optional and roles are not touched.
    Update,
    AssignRoles,
}

/// Field name to ordered rule list, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct RuleSet(Vec<(&'static str, Vec<Rule>)>);

impl RuleSet {
    fn field(mut self, name: &'static str, rules: Vec<Rule>) -> Self {
        self.0.push((name, rules));
        self
    }

    pub fn get(&self, field: &str) -> Option<&[Rule]> {
        self.0
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, rules)| rules.as_slice())
    }

    /// Rules of `field` joined with `|`.
    pub fn expression(&self, field: &str) -> Option<String> {
        self.get(field).map(|rules| {
            rules
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("|")
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &[Rule])> {
        self.0.iter().map(|(name, rules)| (*name, rules.as_slice()))
    }
}

const USERNAME_UNIQUE: Rule = Rule::Unique { table: "users", column: "username" };
const EMAIL_UNIQUE: Rule = Rule::Unique { table: "users", column: "email" };
const ROLE_EXISTS: Rule = Rule::Exists { table: "roles", column: "id" };

pub fn rules_for(flow: Flow) -> RuleSet {
    use Rule::*;

    match flow {
        Flow::Create => RuleSet::default()
            .field("username", vec![Bail, Required, Max(190), USERNAME_UNIQUE])
            .field("email", vec![Bail, Required, Max(190), Email, EMAIL_UNIQUE])
            .field("password", vec![Bail, Required, Max(32), Confirmed, Min(3)])
            .field("firstname", vec![Bail, Required, Max(190)])
            .field("lastname", vec![Max(190)])
            .field("roles", vec![Bail, Required, Array])
            .field("roles.*", vec![ROLE_EXISTS])
            .field("avatar", vec![Nullable, Pattern(&AVATAR_RE)]),
        Flow::Update => RuleSet::default()
            .field("username", vec![Sometimes, Bail, Required, Max(190), USERNAME_UNIQUE])
            .field("email", vec![Sometimes, Bail, Required, Max(190), Email, EMAIL_UNIQUE])
            .field("password", vec![Sometimes, Bail, Required, Max(32), Confirmed, Min(3)])
            .field("firstname", vec![Sometimes, Bail, Required, Max(190)])
            .field("lastname", vec![Max(190)])
            .field("avatar", vec![Nullable, Pattern(&AVATAR_RE)]),
        Flow::AssignRoles => RuleSet::default()
            .field("roles", vec![Bail, Required, Array])
            .field("roles.*", vec![ROLE_EXISTS]),
    }
}

/// Value of one input field as seen by the evaluator.
#[derive(Debug, Clone, Copy)]
pub enum FieldValue<'a> {
    Missing,
    Text(&'a str),
    Ids(&'a [i64]),
    /// Present, but not of the JSON type the field takes.
    Mistyped(&'a Value),
}

impl FieldValue<'_> {
    fn is_empty(&self) -> bool {
        match self {
            FieldValue::Missing => true,
            FieldValue::Text(s) => s.trim().is_empty(),
            FieldValue::Ids(ids) => ids.is_empty(),
            FieldValue::Mistyped(Value::String(s)) => s.trim().is_empty(),
            FieldValue::Mistyped(Value::Array(items)) => items.is_empty(),
            FieldValue::Mistyped(_) => false,
        }
    }
}

/// Input that can be checked against a [`RuleSet`].
pub trait Fields {
    fn field(&self, name: &str) -> FieldValue<'_>;
}

/// Failed rules, keyed by field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors(BTreeMap<String, Vec<String>>);

impl ValidationErrors {
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.entry(field.into()).or_default().push(message.into());
    }

    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.0.get(field).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields: Vec<_> = self.fields().collect();
        write!(f, "invalid fields: {}", fields.join(", "))
    }
}

impl std::error::Error for ValidationErrors {}

/// Evaluate `rules` over `input`.
///
/// `ignore` excludes one user from uniqueness checks, so a record can keep
/// its own username and email on update.
pub async fn validate(
    input: &(impl Fields + ?Sized),
    rules: &RuleSet,
    store: &dyn UserStore,
    ignore: Option<Uuid>,
) -> anyhow::Result<Result<(), ValidationErrors>> {
    let mut errors = ValidationErrors::default();

    for (field, field_rules) in rules.iter() {
        if let Some(parent) = field.strip_suffix(".*") {
            check_each(input, parent, field_rules, store, &mut errors).await?;
            continue;
        }

        let value = input.field(field);
        if field_rules.iter().any(|r| matches!(r, Rule::Sometimes))
            && matches!(value, FieldValue::Missing)
        {
            continue;
        }
        if field_rules.iter().any(|r| matches!(r, Rule::Nullable)) && value.is_empty() {
            continue;
        }
        let bail = field_rules.iter().any(|r| matches!(r, Rule::Bail));

        for rule in field_rules {
            if let Some(message) = check(input, field, value, rule, store, ignore).await? {
                errors.add(field, message);
                if bail {
                    break;
                }
            }
        }
    }

    Ok(if errors.is_empty() { Ok(()) } else { Err(errors) })
}

async fn check(
    input: &(impl Fields + ?Sized),
    field: &str,
    value: FieldValue<'_>,
    rule: &Rule,
    store: &dyn UserStore,
    ignore: Option<Uuid>,
) -> anyhow::Result<Option<String>> {
    let label = field.replace('_', " ");

    if let Rule::Required = rule {
        return Ok(value
            .is_empty()
            .then(|| format!("The {label} field is required.")));
    }
    // Absent values only answer to `required`.
    if value.is_empty() {
        return Ok(None);
    }

    let failed = match (rule, value) {
        (Rule::Array, FieldValue::Ids(_)) => None,
        (Rule::Array, FieldValue::Mistyped(v)) if v.is_array() => None,
        (Rule::Array, _) => Some(format!("The {label} must be an array.")),
        (
            Rule::Max(_)
            | Rule::Min(_)
            | Rule::Email
            | Rule::Confirmed
            | Rule::Unique { .. }
            | Rule::Pattern(_),
            FieldValue::Mistyped(_),
        ) => Some(format!("The {label} must be a string.")),
        (Rule::Max(n), FieldValue::Text(s)) => (s.chars().count() > *n)
            .then(|| format!("The {label} may not be greater than {n} characters.")),
        (Rule::Max(n), FieldValue::Ids(ids)) => (ids.len() > *n)
            .then(|| format!("The {label} may not have more than {n} items.")),
        (Rule::Min(n), FieldValue::Text(s)) => (s.chars().count() < *n)
            .then(|| format!("The {label} must be at least {n} characters.")),
        (Rule::Email, FieldValue::Text(s)) => (!EMAIL_RE.is_match(s))
            .then(|| format!("The {label} must be a valid email address.")),
        (Rule::Confirmed, FieldValue::Text(s)) => {
            let confirmation = input.field(&format!("{field}_confirmation"));
            (!matches!(confirmation, FieldValue::Text(c) if c == s))
                .then(|| format!("The {label} confirmation does not match."))
        }
        (Rule::Unique { column, .. }, FieldValue::Text(s)) => store
            .is_taken(column, s, ignore)
            .await?
            .then(|| format!("The {label} has already been taken.")),
        (Rule::Pattern(re), FieldValue::Text(s)) => {
            (!re.is_match(s)).then(|| format!("The {label} format is invalid."))
        }
        _ => None,
    };
    Ok(failed)
}

/// Apply element rules (`roles.*`) to every element of `parent`.
async fn check_each(
    input: &(impl Fields + ?Sized),
    parent: &str,
    rules: &[Rule],
    store: &dyn UserStore,
    errors: &mut ValidationErrors,
) -> anyhow::Result<()> {
    // Elements that are not integers can never name a row.
    let ids: Vec<Option<i64>> = match input.field(parent) {
        FieldValue::Ids(ids) => ids.iter().copied().map(Some).collect(),
        FieldValue::Mistyped(Value::Array(items)) => items.iter().map(Value::as_i64).collect(),
        _ => return Ok(()),
    };
    for rule in rules {
        if let Rule::Exists { .. } = rule {
            let candidates: Vec<i64> = ids.iter().flatten().copied().collect();
            let existing = store.existing_role_ids(&candidates).await?;
            for (i, id) in ids.iter().enumerate() {
                if !id.is_some_and(|id| existing.contains(&id)) {
                    errors.add(format!("{parent}.{i}"), format!("The selected {parent}.{i} is invalid."));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::mem::MemoryStore;
    use crate::users::model::User;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Input {
        text: HashMap<&'static str, &'static str>,
        roles: Option<Vec<i64>>,
        mistyped: HashMap<&'static str, Value>,
    }

    impl Fields for Input {
        fn field(&self, name: &str) -> FieldValue<'_> {
            if let Some(value) = self.mistyped.get(name) {
                return FieldValue::Mistyped(value);
            }
            if name == "roles" {
                return self
                    .roles
                    .as_deref()
                    .map_or(FieldValue::Missing, FieldValue::Ids);
            }
            self.text
                .get(name)
                .map_or(FieldValue::Missing, |v| FieldValue::Text(v))
        }
    }

    fn valid_create() -> Input {
        Input {
            text: HashMap::from([
                ("username", "jdoe"),
                ("email", "john@example.com"),
                ("password", "secret"),
                ("password_confirmation", "secret"),
                ("firstname", "john"),
            ]),
            roles: Some(vec![1]),
            ..Input::default()
        }
    }

    fn store() -> MemoryStore {
        MemoryStore::with_roles([(1, "admin"), (2, "editor")])
    }

    #[test]
    fn create_rules_read_like_the_declarations() {
        let rules = rules_for(Flow::Create);
        assert_eq!(
            rules.expression("username").unwrap(),
            "bail|required|max:190|unique:users,username"
        );
        assert_eq!(
            rules.expression("email").unwrap(),
            "bail|required|max:190|email|unique:users,email"
        );
        assert_eq!(
            rules.expression("password").unwrap(),
            "bail|required|max:32|confirmed|min:3"
        );
        assert_eq!(rules.expression("roles").unwrap(), "bail|required|array");
        assert_eq!(rules.expression("roles.*").unwrap(), "exists:roles,id");
        assert!(rules.expression("avatar").unwrap().starts_with("nullable|regex:"));
    }

    #[test]
    fn update_rules_do_not_require_roles() {
        let rules = User::validation_rules(Flow::Update);
        assert!(rules.get("roles").is_none());
        assert!(rules.expression("username").unwrap().starts_with("sometimes|"));
    }

    #[tokio::test]
    async fn valid_input_passes() {
        let store = store();
        let res = validate(&valid_create(), &rules_for(Flow::Create), &store, None)
            .await
            .unwrap();
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn missing_required_fields_are_reported() {
        let store = store();
        let errors = validate(&Input::default(), &rules_for(Flow::Create), &store, None)
            .await
            .unwrap()
            .unwrap_err();
        for field in ["username", "email", "password", "firstname", "roles"] {
            assert_eq!(
                errors.get(field).unwrap(),
                &[format!("The {field} field is required.")]
            );
        }
        assert!(errors.get("lastname").is_none());
        assert!(errors.get("avatar").is_none());
    }

    #[tokio::test]
    async fn empty_roles_are_rejected() {
        let store = store();
        let mut input = valid_create();
        input.roles = Some(vec![]);
        let errors = validate(&input, &rules_for(Flow::Create), &store, None)
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(errors.fields().collect::<Vec<_>>(), vec!["roles"]);
    }

    #[tokio::test]
    async fn unknown_role_ids_are_rejected_per_element() {
        let store = store();
        let mut input = valid_create();
        input.roles = Some(vec![1, 42]);
        let errors = validate(&input, &rules_for(Flow::AssignRoles), &store, None)
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(errors.get("roles.1").unwrap(), &["The selected roles.1 is invalid."]);
        assert!(errors.get("roles.0").is_none());
    }

    #[tokio::test]
    async fn password_bounds_and_confirmation() {
        let store = store();
        let rules = rules_for(Flow::Create);

        let mut input = valid_create();
        input.text.insert("password_confirmation", "other");
        let errors = validate(&input, &rules, &store, None).await.unwrap().unwrap_err();
        assert_eq!(
            errors.get("password").unwrap(),
            &["The password confirmation does not match."]
        );

        let mut input = valid_create();
        input.text.insert("password", "ab");
        input.text.insert("password_confirmation", "ab");
        let errors = validate(&input, &rules, &store, None).await.unwrap().unwrap_err();
        assert_eq!(
            errors.get("password").unwrap(),
            &["The password must be at least 3 characters."]
        );

        let long: &'static str = "x".repeat(33).leak();
        let mut input = valid_create();
        input.text.insert("password", long);
        input.text.insert("password_confirmation", long);
        let errors = validate(&input, &rules, &store, None).await.unwrap().unwrap_err();
        assert_eq!(
            errors.get("password").unwrap(),
            &["The password may not be greater than 32 characters."]
        );
    }

    #[tokio::test]
    async fn bail_stops_at_first_failure() {
        let store = store();
        let long: &'static str = format!("{}@example.com", "a".repeat(200)).leak();
        let mut input = valid_create();
        input.text.insert("email", long);
        let errors = validate(&input, &rules_for(Flow::Create), &store, None)
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(errors.get("email").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn email_and_avatar_formats() {
        let store = store();
        let mut input = valid_create();
        input.text.insert("email", "not-an-email");
        input.text.insert("avatar", "http://example.com/me.png");
        let errors = validate(&input, &rules_for(Flow::Create), &store, None)
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(
            errors.get("email").unwrap(),
            &["The email must be a valid email address."]
        );
        assert_eq!(errors.get("avatar").unwrap(), &["The avatar format is invalid."]);

        let mut input = valid_create();
        input.text.insert("avatar", "data:image/png;base64,iVBORw0KGgo=");
        assert!(validate(&input, &rules_for(Flow::Create), &store, None)
            .await
            .unwrap()
            .is_ok());
    }

    #[tokio::test]
    async fn update_checks_only_present_fields() {
        let store = store();
        let input = Input {
            text: HashMap::from([("lastname", "doe")]),
            ..Input::default()
        };
        assert!(validate(&input, &rules_for(Flow::Update), &store, None)
            .await
            .unwrap()
            .is_ok());

        let input = Input {
            text: HashMap::from([("firstname", "")]),
            ..Input::default()
        };
        let errors = validate(&input, &rules_for(Flow::Update), &store, None)
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(
            errors.get("firstname").unwrap(),
            &["The firstname field is required."]
        );
    }

    #[tokio::test]
    async fn mistyped_values_fail_their_type_rule() {
        let store = store();
        let mut input = valid_create();
        input.roles = None;
        input.text.remove("username");
        input.mistyped.insert("roles", serde_json::json!("admin"));
        input.mistyped.insert("username", serde_json::json!(123));
        input.mistyped.insert("lastname", serde_json::json!({ "a": 1 }));
        let errors = validate(&input, &rules_for(Flow::Create), &store, None)
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(errors.get("roles").unwrap(), &["The roles must be an array."]);
        assert_eq!(errors.get("username").unwrap(), &["The username must be a string."]);
        assert_eq!(errors.get("lastname").unwrap(), &["The lastname must be a string."]);
    }

    #[tokio::test]
    async fn non_integer_role_elements_are_invalid() {
        let store = store();
        let mut input = valid_create();
        input.roles = None;
        input.mistyped.insert("roles", serde_json::json!([1, "2", 2.5]));
        let errors = validate(&input, &rules_for(Flow::AssignRoles), &store, None)
            .await
            .unwrap()
            .unwrap_err();
        assert!(errors.get("roles").is_none());
        assert!(errors.get("roles.0").is_none());
        assert_eq!(errors.get("roles.1").unwrap(), &["The selected roles.1 is invalid."]);
        assert_eq!(errors.get("roles.2").unwrap(), &["The selected roles.2 is invalid."]);
    }

    #[test]
    fn errors_serialize_as_field_map() {
        let mut errors = ValidationErrors::default();
        errors.add("email", "The email has already been taken.");
        assert_eq!(
            serde_json::to_value(&errors).unwrap(),
            serde_json::json!({ "email": ["The email has already been taken."] })
        );
    }
}
