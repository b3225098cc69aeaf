//! Entity resolution
//!
//! Turns principal and resource identifiers into typed entities carrying the
//! attributes conditions and patterns are matched against: account ownership,
//! group memberships, tags, parents and delegation back-references.

pub mod cache;

pub use cache::{CachingEntityResolver, EntityCacheStats};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{AuthzError, Result};
use crate::types::{AccountId, PrincipalKind};

/// Kind of resolved entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    Role,
    Session,
    Resource,
}

impl EntityKind {
    /// Principal kind, if this entity can make requests
    pub fn principal_kind(self) -> Option<PrincipalKind> {
        match self {
            EntityKind::User => Some(PrincipalKind::User),
            EntityKind::Role => Some(PrincipalKind::Role),
            EntityKind::Session => Some(PrincipalKind::Session),
            EntityKind::Resource => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Role => "role",
            EntityKind::Session => "session",
            EntityKind::Resource => "resource",
        }
    }
}

/// A resolved principal or resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Entity identifier (e.g., "user:alice", "bucket:photos/cat.png")
    pub id: String,

    /// Entity kind
    pub kind: EntityKind,

    /// Owning account
    pub account: AccountId,

    /// Attributes (groups, tags, resource_type, department, ...)
    #[serde(default)]
    pub attributes: HashMap<String, Value>,

    /// Parent resource for hierarchical inheritance (folder -> file)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    /// Role (or session) this principal was assumed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_of: Option<String>,

    /// Session expiry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Entity {
    fn new(id: impl Into<String>, kind: EntityKind, account: impl Into<AccountId>) -> Self {
        Self {
            id: id.into(),
            kind,
            account: account.into(),
            attributes: HashMap::new(),
            parent: None,
            session_of: None,
            expires_at: None,
        }
    }

    /// Create a user principal
    pub fn user(id: impl Into<String>, account: impl Into<AccountId>) -> Self {
        Self::new(id, EntityKind::User, account)
    }

    /// Create a role principal
    pub fn role(id: impl Into<String>, account: impl Into<AccountId>) -> Self {
        Self::new(id, EntityKind::Role, account)
    }

    /// Create a session assumed from `session_of`
    pub fn session(
        id: impl Into<String>,
        account: impl Into<AccountId>,
        session_of: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let mut entity = Self::new(id, EntityKind::Session, account);
        entity.session_of = Some(session_of.into());
        entity.expires_at = Some(expires_at);
        entity
    }

    /// Create a resource
    pub fn resource(id: impl Into<String>, account: impl Into<AccountId>) -> Self {
        Self::new(id, EntityKind::Resource, account)
    }

    /// Add an attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Set the parent resource
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Set the delegation back-reference (used for role chaining)
    pub fn with_session_of(mut self, source: impl Into<String>) -> Self {
        self.session_of = Some(source.into());
        self
    }

    /// Whether this entity can make requests
    pub fn is_principal(&self) -> bool {
        self.kind.principal_kind().is_some()
    }

    /// Resource type: the `resource_type` attribute, else the id prefix
    pub fn resource_type(&self) -> &str {
        if let Some(Value::String(t)) = self.attributes.get("resource_type") {
            return t;
        }
        self.id.split(':').next().unwrap_or(self.kind.as_str())
    }

    /// Look up an attribute, including the built-ins `id`, `account`, `kind`
    /// and `type`
    pub fn attribute(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::String(self.id.clone())),
            "account" => Some(Value::String(self.account.clone())),
            "kind" => Some(Value::String(self.kind.as_str().to_string())),
            "type" => Some(Value::String(self.resource_type().to_string())),
            _ => self.attributes.get(name).cloned(),
        }
    }

    /// Whether attribute `name` equals `value`, or is a set containing it
    pub fn attribute_matches(&self, name: &str, value: &Value) -> bool {
        match self.attribute(name) {
            Some(Value::Array(items)) => items.iter().any(|item| item == value),
            Some(actual) => &actual == value,
            None => false,
        }
    }

    /// Whether a session has expired at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| exp <= now).unwrap_or(false)
    }
}

/// Resolves identifiers into entities
///
/// Implementations may block on I/O; failures for unknown ids must surface as
/// [`AuthzError::EntityNotFound`].
#[async_trait]
pub trait EntityResolver: Send + Sync {
    /// Resolve an entity by id
    async fn resolve(&self, id: &str) -> Result<Entity>;
}

/// In-memory entity directory
pub struct InMemoryEntityDirectory {
    entities: Arc<RwLock<HashMap<String, Entity>>>,
}

impl InMemoryEntityDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self {
            entities: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create a directory pre-populated with entities
    pub fn with_entities(entities: impl IntoIterator<Item = Entity>) -> Self {
        let map = entities.into_iter().map(|e| (e.id.clone(), e)).collect();
        Self {
            entities: Arc::new(RwLock::new(map)),
        }
    }

    /// Insert or replace an entity
    pub async fn insert(&self, entity: Entity) {
        let mut entities = self.entities.write().await;
        entities.insert(entity.id.clone(), entity);
    }

    /// Remove an entity
    pub async fn remove(&self, id: &str) -> Option<Entity> {
        let mut entities = self.entities.write().await;
        entities.remove(id)
    }

    /// Number of entities
    pub async fn len(&self) -> usize {
        self.entities.read().await.len()
    }

    /// Whether the directory is empty
    pub async fn is_empty(&self) -> bool {
        self.entities.read().await.is_empty()
    }
}

impl Default for InMemoryEntityDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityResolver for InMemoryEntityDirectory {
    async fn resolve(&self, id: &str) -> Result<Entity> {
        let entities = self.entities.read().await;
        entities
            .get(id)
            .cloned()
            .ok_or_else(|| AuthzError::EntityNotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_attributes() {
        let alice = Entity::user("user:alice", "111")
            .with_attribute("groups", json!(["eng", "oncall"]))
            .with_attribute("department", "engineering");

        assert_eq!(alice.attribute("account"), Some(json!("111")));
        assert_eq!(alice.attribute("kind"), Some(json!("user")));
        assert!(alice.attribute_matches("groups", &json!("oncall")));
        assert!(!alice.attribute_matches("groups", &json!("finance")));
        assert!(alice.attribute_matches("department", &json!("engineering")));
    }

    #[test]
    fn test_resource_type() {
        let photo = Entity::resource("bucket:photos/cat.png", "222");
        assert_eq!(photo.resource_type(), "bucket");

        let tagged = Entity::resource("obj-1", "222").with_attribute("resource_type", "object");
        assert_eq!(tagged.resource_type(), "object");
    }

    #[test]
    fn test_session_expiry() {
        let now = Utc::now();
        let session = Entity::session("session:s1", "111", "role:reader", now);
        assert!(session.is_expired_at(now));
        assert!(!session.is_expired_at(now - chrono::Duration::seconds(1)));
        assert!(!Entity::user("user:bob", "111").is_expired_at(now));
    }

    #[tokio::test]
    async fn test_directory_resolve() {
        let directory = InMemoryEntityDirectory::with_entities(vec![Entity::user("user:alice", "111")]);

        let alice = directory.resolve("user:alice").await.unwrap();
        assert_eq!(alice.kind, EntityKind::User);

        let missing = directory.resolve("user:ghost").await;
        assert_eq!(missing, Err(AuthzError::EntityNotFound("user:ghost".to_string())));
    }
}
