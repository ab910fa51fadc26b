use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

/// Authenticated caller. Authentication itself happens upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub role: Role,
}

impl User {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            role: Role::User,
        }
    }

    pub fn admin(id: i64) -> Self {
        Self {
            id,
            role: Role::Admin,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Owner or admin
    pub fn can_control(&self, owner_id: i64) -> bool {
        self.id == owner_id || self.is_admin()
    }
}
