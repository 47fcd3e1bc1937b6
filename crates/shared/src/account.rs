//! Account model
//!
//! Accounts are created and maintained by the external signup/login flow.
//! Billgate only reads them to identify the subscriber and their role.

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

/// A user account as stored in the `users` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Account {
    pub id: Uuid,
    pub email: String,
    pub is_staff: bool,
    pub is_superuser: bool,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub date_joined: OffsetDateTime,
}

impl Account {
    /// Staff and superusers bypass the subscription check
    pub fn is_elevated(&self) -> bool {
        self.is_staff || self.is_superuser
    }
}
