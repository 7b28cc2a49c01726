use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ids::UserId;

/// A learner together with the identity the remote platform knows them by.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformUser {
    pub id: UserId,
    pub username: String,
    pub access_token: String,
    pub token_expires_at: Option<DateTime<Utc>>,
}

impl PlatformUser {
    #[must_use]
    pub fn token_expired(&self, now: DateTime<Utc>) -> bool {
        self.token_expires_at.is_some_and(|at| at <= now)
    }
}

// Keep the access token out of logs.
impl std::fmt::Debug for PlatformUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformUser")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("access_token", &"<redacted>")
            .field("token_expires_at", &self.token_expires_at)
            .finish()
    }
}
