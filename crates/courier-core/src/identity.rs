use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// Role carried by a verified token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Manager,
    Admin,
    SuperAdmin,
    Customer,
}

impl Role {
    /// Manager-class roles receive the unscoped broadcast view.
    pub fn is_manager_class(&self) -> bool {
        matches!(self, Self::Manager | Self::Admin | Self::SuperAdmin)
    }
}

/// An authenticated caller as produced by token verification. Customers may
/// be addressable only by email; account holders by user id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub role: Role,
    pub email: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing credentials")]
    MissingToken,
    #[error("invalid token")]
    InvalidToken,
}

/// Token verification is an external collaborator; implementations wrap
/// whatever identity provider the host system uses.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manager_class_roles() {
        assert!(Role::Manager.is_manager_class());
        assert!(Role::Admin.is_manager_class());
        assert!(Role::SuperAdmin.is_manager_class());
        assert!(!Role::Customer.is_manager_class());
    }

    #[test]
    fn role_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&Role::SuperAdmin).unwrap(),
            "\"super_admin\""
        );
    }
}
