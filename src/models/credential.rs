use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exchange API key pair, stored encrypted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCredential {
    pub id: i64,
    pub user_id: i64,
    pub exchange: String,
    #[serde(skip_serializing)]
    pub api_key_encrypted: String,
    #[serde(skip_serializing)]
    pub secret_key_encrypted: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCredential {
    pub user_id: i64,
    pub exchange: String,
    pub api_key_encrypted: String,
    pub secret_key_encrypted: String,
    pub is_active: bool,
}
