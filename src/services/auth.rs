//! Caller identities.
//!
//! Authentication is provided by the embedding application. The coordinator only needs the
//! identity of a caller and its roles, which an [`Authenticator`] derives from whatever
//! credentials the transport carries.

use std::collections::BTreeSet;

use async_trait::async_trait;
use derive_more::Display;

use crate::services::ServiceError;

/// A permission of a caller.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    /// May submit updates.
    #[display(fmt = "site")]
    Site,
    /// May submit updates and trigger aggregation rounds.
    #[display(fmt = "admin")]
    Admin,
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub identity: String,
    pub roles: BTreeSet<Role>,
}

impl Caller {
    pub fn new(identity: impl Into<String>, roles: impl IntoIterator<Item = Role>) -> Self {
        Self {
            identity: identity.into(),
            roles: roles.into_iter().collect(),
        }
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// Checks that the caller has at least one of `roles`.
    ///
    /// # Errors
    /// Fails with [`ServiceError::Forbidden`] naming the first of `roles` otherwise.
    pub fn require_any(&self, roles: &[Role]) -> Result<(), ServiceError> {
        if roles.iter().any(|role| self.has_role(*role)) {
            Ok(())
        } else {
            Err(ServiceError::Forbidden(
                self.identity.clone(),
                roles.first().copied().unwrap_or(Role::Admin),
            ))
        }
    }
}

#[async_trait]
/// Turns transport credentials into a [`Caller`].
pub trait Authenticator
where
    Self: Send + Sync,
{
    /// Authenticates the bearer of `credentials`.
    ///
    /// # Errors
    /// Fails with [`ServiceError::Unauthenticated`] if the credentials are missing or invalid.
    async fn authenticate(&self, credentials: Option<&str>) -> Result<Caller, ServiceError>;
}

/// An authenticator for development setups.
///
/// Every non-empty identity is accepted and granted all roles.
#[derive(Debug, Clone, Copy, Default)]
pub struct DevAuthenticator;

#[async_trait]
impl Authenticator for DevAuthenticator {
    async fn authenticate(&self, credentials: Option<&str>) -> Result<Caller, ServiceError> {
        match credentials.map(str::trim) {
            Some(identity) if !identity.is_empty() => {
                Ok(Caller::new(identity, [Role::Site, Role::Admin]))
            }
            _ => Err(ServiceError::Unauthenticated),
        }
    }
}
