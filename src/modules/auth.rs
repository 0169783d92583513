//! Mount-time authentication and permission levels.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What a session is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Permission {
    /// List, stat and read only
    ReadOnly,
    /// Everything, including changes to the tree
    ReadWrite,
}

impl Permission {
    pub fn can_write(self) -> bool {
        self == Permission::ReadWrite
    }
}

/// Credentials sent with a MOUNT request. Both fields may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn is_anonymous(&self) -> bool {
        self.user.is_empty()
    }
}

/// One configured user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub user: String,
    pub password: String,
    #[serde(default = "default_permission")]
    pub permission: Permission,
}

fn default_permission() -> Permission {
    Permission::ReadWrite
}

/// Why a mount was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("unknown user {0:?}")]
    UnknownUser(String),
    #[error("wrong password for user {0:?}")]
    BadPassword(String),
}

/// Decides who may mount and with which permission.
#[derive(Debug, Clone)]
pub struct Auth {
    accounts: Option<Vec<Account>>,
    read_only: bool,
}

impl Auth {
    /// Anyone may mount.
    pub fn open(read_only: bool) -> Self {
        Self {
            accounts: None,
            read_only,
        }
    }

    /// Only the listed accounts may mount.
    pub fn with_accounts(accounts: Vec<Account>, read_only: bool) -> Self {
        Self {
            accounts: Some(accounts),
            read_only,
        }
    }

    pub fn is_open(&self) -> bool {
        self.accounts.is_none()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Validates credentials and returns the session's permission.
    ///
    /// A read-only server never hands out write permission.
    pub fn authenticate(&self, credentials: &Credentials) -> Result<Permission, AuthError> {
        let granted = match &self.accounts {
            None => Permission::ReadWrite,
            Some(accounts) => {
                let account = accounts
                    .iter()
                    .find(|a| a.user == credentials.user)
                    .ok_or_else(|| AuthError::UnknownUser(credentials.user.clone()))?;
                if account.password != credentials.password {
                    return Err(AuthError::BadPassword(credentials.user.clone()));
                }
                account.permission
            }
        };
        if self.read_only {
            Ok(Permission::ReadOnly)
        } else {
            Ok(granted)
        }
    }
}

/// Loads accounts from a JSON file holding an array of
/// `{"user", "password", "permission"}` objects.
pub fn load_accounts(path: &Path) -> Result<Vec<Account>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading accounts file {}", path.display()))?;
    let accounts: Vec<Account> = serde_json::from_str(&content)
        .with_context(|| format!("parsing accounts file {}", path.display()))?;
    Ok(accounts)
}
