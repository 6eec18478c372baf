//! Access capability consumed by the WebSocket handshake.
//!
//! Authentication and project membership belong to the surrounding system.
//! The handshake only asks two questions: who does this token belong to, and
//! may that user see this project. Both calls are synchronous because they
//! run inside the tungstenite header callback.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Authenticated user id as issued by the session system.
pub type UserId = String;

pub trait AccessControl: Send + Sync {
    /// Resolve an access token to a user.
    fn authenticate(&self, token: &str) -> Result<UserId, AccessError>;

    /// Whether `user` may read and edit pages of `project_id`.
    fn can_access_project(&self, user: &str, project_id: Uuid) -> Result<bool, AccessError>;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AccessError {
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("access backend unavailable: {0}")]
    Backend(String),
}

// ─── Static Tables ───────────────────────────────────────────────────────────

/// `[access]` config section: the tables behind [`StaticAccess`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// token → user id
    pub tokens: HashMap<String, String>,
    /// user id → projects the user belongs to
    pub grants: HashMap<String, Vec<Uuid>>,
    /// Users allowed into every project
    pub admins: Vec<String>,
}

/// Table-driven [`AccessControl`] for single-node deployments and tests.
#[derive(Debug, Default)]
pub struct StaticAccess {
    tokens: HashMap<String, UserId>,
    grants: HashMap<UserId, HashSet<Uuid>>,
    admins: HashSet<UserId>,
}

impl StaticAccess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &AccessConfig) -> Self {
        let mut access = Self::new();
        for (token, user) in &config.tokens {
            access.tokens.insert(token.clone(), user.clone());
        }
        for (user, projects) in &config.grants {
            access
                .grants
                .entry(user.clone())
                .or_default()
                .extend(projects.iter().copied());
        }
        access.admins.extend(config.admins.iter().cloned());
        access
    }

    /// Builder-style: register a token for a user.
    pub fn with_token(mut self, token: impl Into<String>, user: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), user.into());
        self
    }

    /// Builder-style: grant a user access to a project.
    pub fn with_grant(mut self, user: impl Into<String>, project_id: Uuid) -> Self {
        self.grants.entry(user.into()).or_default().insert(project_id);
        self
    }

    pub fn with_admin(mut self, user: impl Into<String>) -> Self {
        self.admins.insert(user.into());
        self
    }
}

impl AccessControl for StaticAccess {
    fn authenticate(&self, token: &str) -> Result<UserId, AccessError> {
        self.tokens.get(token).cloned().ok_or(AccessError::InvalidToken)
    }

    fn can_access_project(&self, user: &str, project_id: Uuid) -> Result<bool, AccessError> {
        if self.admins.contains(user) {
            return Ok(true);
        }
        Ok(self
            .grants
            .get(user)
            .is_some_and(|projects| projects.contains(&project_id)))
    }
}

// ─── Origin Policy ───────────────────────────────────────────────────────────

/// Explicit Origin allow-list for browser upgrades.
///
/// - `"*"` admits any origin.
/// - Otherwise the `Origin` header must match an entry exactly
///   (scheme, host and port; trailing `/` ignored).
/// - Requests without an `Origin` header (non-browser clients) are admitted.
#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    any: bool,
    allowed: HashSet<String>,
}

impl OriginPolicy {
    pub fn new<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut policy = Self::default();
        for origin in origins {
            let origin = origin.as_ref().trim();
            if origin == "*" {
                policy.any = true;
            } else if !origin.is_empty() {
                policy.allowed.insert(normalize_origin(origin));
            }
        }
        policy
    }

    pub fn allow_any() -> Self {
        Self {
            any: true,
            allowed: HashSet::new(),
        }
    }

    pub fn permits(&self, origin: Option<&str>) -> bool {
        match origin {
            None => true,
            Some(_) if self.any => true,
            Some(origin) => self.allowed.contains(&normalize_origin(origin)),
        }
    }
}

fn normalize_origin(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}
