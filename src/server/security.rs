use std::collections::HashMap;

use crate::config::UserConfig;

/// Authenticates connections. Called once per connection.
pub trait SecurityManager: Send + Sync {
    fn validate_user(&self, user: Option<&str>, password: Option<&str>) -> bool;
}

/// Lets everyone in. Used when security is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllSecurityManager;

impl SecurityManager for AllowAllSecurityManager {
    fn validate_user(&self, _user: Option<&str>, _password: Option<&str>) -> bool {
        true
    }
}

/// Checks credentials against a fixed user list.
#[derive(Debug, Default, Clone)]
pub struct UserListSecurityManager {
    users: HashMap<String, String>,
}

impl UserListSecurityManager {
    pub fn new(users: &[UserConfig]) -> Self {
        Self {
            users: users
                .iter()
                .map(|u| (u.user.clone(), u.password.clone()))
                .collect(),
        }
    }

    pub fn add_user(&mut self, user: impl Into<String>, password: impl Into<String>) {
        self.users.insert(user.into(), password.into());
    }
}

impl SecurityManager for UserListSecurityManager {
    fn validate_user(&self, user: Option<&str>, password: Option<&str>) -> bool {
        match (user, password) {
            (Some(user), Some(password)) => self.users.get(user).is_some_and(|p| p == password),
            _ => false,
        }
    }
}
