use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// User record in the database.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub user_name: String,
    pub email: String,
    pub display_name: String,
    #[serde(skip_serializing)]
    pub password_hash: String, // Argon2 PHC string, not exposed in JSON
    pub created_at: OffsetDateTime,
}

/// Key/value claim attached to a user.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct UserClaim {
    pub claim_type: String,
    pub claim_value: String,
}

/// Fields needed to insert a user; the password is already hashed.
#[derive(Debug, Clone, Copy)]
pub struct NewUser<'a> {
    pub user_name: &'a str,
    pub email: &'a str,
    pub display_name: &'a str,
    pub password_hash: &'a str,
}

/// Lookup key for case-insensitive email and user name matching.
pub fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}
