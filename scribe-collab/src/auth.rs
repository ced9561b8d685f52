//! Identity lookup for incoming connections.
//!
//! The gateway extracts a bearer token from the handshake and hands it to an
//! [`Authenticator`]. Issuing and validating sessions belongs to the host
//! application; this crate only consumes the resulting identity and its
//! permission set.

use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::net::SocketAddr;
use thiserror::Error;
use uuid::Uuid;

use crate::config::{AuthConfig, TokenEntry};
use crate::protocol::ErrorCode;

/// What a connection may do inside its room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    pub can_edit: bool,
    pub can_view: bool,
}

impl Permissions {
    pub const EDITOR: Permissions = Permissions {
        can_edit: true,
        can_view: true,
    };
    pub const VIEWER: Permissions = Permissions {
        can_edit: false,
        can_view: true,
    };
}

/// Authenticated user behind a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
    pub role: String,
    pub permissions: Permissions,
}

impl Identity {
    pub fn new(
        user_id: impl Into<String>,
        username: impl Into<String>,
        role: impl Into<String>,
        permissions: Permissions,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            role: role.into(),
            permissions,
        }
    }

    /// Fresh guest identity with a random user id.
    pub fn guest() -> Self {
        let id = Uuid::new_v4().simple().to_string();
        Self::new(format!("guest-{}", &id[..12]), "Guest", "guest", Permissions::EDITOR)
    }
}

impl From<&TokenEntry> for Identity {
    fn from(entry: &TokenEntry) -> Self {
        Identity::new(
            entry.user_id.clone(),
            entry.username.clone(),
            entry.role.clone(),
            Permissions {
                can_edit: entry.can_edit,
                can_view: entry.can_view,
            },
        )
    }
}

/// Handshake data an authenticator decides on.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub token: Option<String>,
    pub room_id: String,
    pub remote_addr: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing credentials")]
    MissingToken,
    #[error("invalid token")]
    InvalidToken,
    #[error("access to room {0} denied")]
    Forbidden(String),
    #[error("identity backend error: {0}")]
    Backend(String),
}

impl AuthError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AuthError::MissingToken | AuthError::InvalidToken => ErrorCode::Unauthenticated,
            AuthError::Forbidden(_) => ErrorCode::PermissionDenied,
            AuthError::Backend(_) => ErrorCode::InternalError,
        }
    }
}

/// Resolves handshake credentials to an identity.
pub trait Authenticator: Send + Sync {
    fn authenticate<'a>(
        &'a self,
        credentials: &'a Credentials,
    ) -> BoxFuture<'a, Result<Identity, AuthError>>;
}

/// Token table loaded from configuration.
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, Identity>,
    allow_anonymous: bool,
}

impl StaticTokenAuthenticator {
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            tokens: config
                .tokens
                .iter()
                .map(|entry| (entry.token.clone(), Identity::from(entry)))
                .collect(),
            allow_anonymous: config.allow_anonymous,
        }
    }

    /// Accept every connection as a fresh guest.
    pub fn anonymous() -> Self {
        Self {
            tokens: HashMap::new(),
            allow_anonymous: true,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }

    fn resolve(&self, token: Option<&str>) -> Result<Identity, AuthError> {
        match token {
            Some(token) if !token.is_empty() => self
                .tokens
                .get(token)
                .cloned()
                .ok_or(AuthError::InvalidToken),
            _ if self.allow_anonymous => Ok(Identity::guest()),
            _ => Err(AuthError::MissingToken),
        }
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn authenticate<'a>(
        &'a self,
        credentials: &'a Credentials,
    ) -> BoxFuture<'a, Result<Identity, AuthError>> {
        Box::pin(async move { self.resolve(credentials.token.as_deref()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials(token: Option<&str>) -> Credentials {
        Credentials {
            token: token.map(str::to_string),
            room_id: "room".into(),
            remote_addr: "127.0.0.1:4000".parse().unwrap(),
        }
    }

    fn config() -> AuthConfig {
        AuthConfig {
            allow_anonymous: false,
            tokens: vec![
                TokenEntry {
                    token: "t-alice".into(),
                    user_id: "alice".into(),
                    username: "Alice".into(),
                    role: "editor".into(),
                    can_edit: true,
                    can_view: true,
                },
                TokenEntry {
                    token: "t-bob".into(),
                    user_id: "bob".into(),
                    username: "Bob".into(),
                    role: "viewer".into(),
                    can_edit: false,
                    can_view: true,
                },
            ],
        }
    }

    #[tokio::test]
    async fn test_known_tokens_resolve() {
        let auth = StaticTokenAuthenticator::from_config(&config());

        let alice = auth.authenticate(&credentials(Some("t-alice"))).await.unwrap();
        assert_eq!(alice.user_id, "alice");
        assert_eq!(alice.permissions, Permissions::EDITOR);

        let bob = auth.authenticate(&credentials(Some("t-bob"))).await.unwrap();
        assert_eq!(bob.role, "viewer");
        assert_eq!(bob.permissions, Permissions::VIEWER);
    }

    #[tokio::test]
    async fn test_unknown_and_missing_tokens() {
        let auth = StaticTokenAuthenticator::from_config(&config());
        assert_eq!(
            auth.authenticate(&credentials(Some("nope"))).await,
            Err(AuthError::InvalidToken)
        );
        assert_eq!(
            auth.authenticate(&credentials(None)).await,
            Err(AuthError::MissingToken)
        );
        assert_eq!(AuthError::MissingToken.code(), ErrorCode::Unauthenticated);
        assert_eq!(
            AuthError::Forbidden("r".into()).code(),
            ErrorCode::PermissionDenied
        );
    }

    #[tokio::test]
    async fn test_anonymous_guests_are_distinct() {
        let auth = StaticTokenAuthenticator::anonymous();
        let a = auth.authenticate(&credentials(None)).await.unwrap();
        let b = auth.authenticate(&credentials(Some(""))).await.unwrap();
        assert_ne!(a.user_id, b.user_id);
        assert!(a.user_id.starts_with("guest-"));
        assert!(a.permissions.can_edit);
    }

    #[tokio::test]
    async fn test_invalid_token_rejected_even_with_anonymous() {
        let auth = StaticTokenAuthenticator::anonymous()
            .with_token("t", Identity::new("u", "U", "editor", Permissions::EDITOR));
        assert_eq!(
            auth.authenticate(&credentials(Some("wrong"))).await,
            Err(AuthError::InvalidToken)
        );
        assert_eq!(
            auth.authenticate(&credentials(Some("t"))).await.unwrap().user_id,
            "u"
        );
    }
}
