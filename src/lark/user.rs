use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ApiError;

/// Profiles fetched from the platform are trusted for this long.
pub const USER_INFO_TTL_SECS: i64 = 3600;

/// Where a cached profile came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UserInfoSource {
    /// Returned by the contact API.
    Platform,
    /// Made up from caller-supplied hints after the API failed. Not verified.
    Hint,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserInfo {
    pub open_id: String,
    pub union_id: Option<String>,
    pub name: String,
    pub description: String,
    pub fetched_at: DateTime<Utc>,
    pub source: UserInfoSource,
}

impl UserInfo {
    pub fn is_verified(&self) -> bool {
        self.source == UserInfoSource::Platform
    }

    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.is_verified() && now - self.fetched_at <= Duration::seconds(USER_INFO_TTL_SECS)
    }
}

/// The `data.user` object of the contact API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub union_id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[async_trait]
pub trait UserLookup: Send + Sync {
    async fn lookup_user(&self, open_id: &str) -> Result<UserProfile, ApiError>;
}

/// What the caller already knows about a user, used only if the API fails.
#[derive(Debug, Clone, Default)]
pub struct UserHint {
    pub union_id: Option<String>,
    pub name: Option<String>,
}

impl UserHint {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            union_id: None,
            name: Some(name.into()),
        }
    }

    /// A placeholder profile is only worth making when a name is known.
    fn name(&self) -> Option<&str> {
        self.name.as_deref().filter(|n| !n.is_empty())
    }
}

/// Per-open-id profile cache in front of the contact API.
pub struct UserDirectory {
    lookup: Arc<dyn UserLookup>,
    cache: Mutex<HashMap<String, UserInfo>>,
}

impl UserDirectory {
    pub fn new(lookup: Arc<dyn UserLookup>) -> Self {
        Self {
            lookup,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn find(&self, open_id: &str, hint: UserHint) -> Option<UserInfo> {
        self.find_at(open_id, hint, Utc::now()).await
    }

    /// Fresh cache hit, else the API, else a hint placeholder, else whatever
    /// stale entry is cached.
    pub async fn find_at(
        &self,
        open_id: &str,
        hint: UserHint,
        now: DateTime<Utc>,
    ) -> Option<UserInfo> {
        let cached = self.cached(open_id);
        if let Some(info) = cached.as_ref().filter(|i| i.is_fresh(now)) {
            return Some(info.clone());
        }

        match self.lookup.lookup_user(open_id).await {
            Ok(profile) => {
                debug!(open_id, "Fetched user profile");
                let info = UserInfo {
                    open_id: open_id.to_string(),
                    union_id: profile.union_id,
                    name: profile.name,
                    description: profile.description,
                    fetched_at: now,
                    source: UserInfoSource::Platform,
                };
                self.store(info.clone());
                Some(info)
            }
            Err(e) => {
                warn!(open_id, "User lookup failed: {}", e);
                let Some(name) = hint.name() else {
                    return cached;
                };
                let info = UserInfo {
                    open_id: open_id.to_string(),
                    name: name.to_string(),
                    union_id: hint.union_id,
                    description: String::new(),
                    fetched_at: now,
                    source: UserInfoSource::Hint,
                };
                self.store(info.clone());
                Some(info)
            }
        }
    }

    fn cached(&self, open_id: &str) -> Option<UserInfo> {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(open_id)
            .cloned()
    }

    fn store(&self, info: UserInfo) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(info.open_id.clone(), info);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    pub(crate) struct FakeLookup {
        pub calls: AtomicUsize,
        pub fail: AtomicBool,
    }

    impl FakeLookup {
        pub(crate) fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl UserLookup for FakeLookup {
        async fn lookup_user(&self, open_id: &str) -> Result<UserProfile, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(ApiError::Platform {
                    code: 41050,
                    msg: "no user authority".to_string(),
                });
            }
            Ok(UserProfile {
                union_id: Some(format!("on_{}", open_id)),
                name: format!("name of {}", open_id),
                description: "desc".to_string(),
            })
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[tokio::test]
    async fn test_cached_within_freshness_window() {
        let lookup = Arc::new(FakeLookup::new());
        let users = UserDirectory::new(lookup.clone());

        let first = users.find_at("ou_1", UserHint::default(), t0()).await.unwrap();
        assert!(first.is_verified());
        assert_eq!(first.name, "name of ou_1");

        users
            .find_at("ou_1", UserHint::default(), t0() + Duration::seconds(3600))
            .await
            .unwrap();
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);

        users
            .find_at("ou_1", UserHint::default(), t0() + Duration::seconds(3601))
            .await
            .unwrap();
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_api_failure_with_hint_is_unverified() {
        let lookup = Arc::new(FakeLookup::new());
        lookup.fail.store(true, Ordering::SeqCst);
        let users = UserDirectory::new(lookup.clone());

        let info = users
            .find_at("ou_2", UserHint::named("Alice"), t0())
            .await
            .unwrap();
        assert_eq!(info.name, "Alice");
        assert_eq!(info.source, UserInfoSource::Hint);
        assert!(!info.is_verified());

        // Hint entries never count as fresh.
        lookup.fail.store(false, Ordering::SeqCst);
        let info = users
            .find_at("ou_2", UserHint::default(), t0() + Duration::seconds(1))
            .await
            .unwrap();
        assert!(info.is_verified());
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_api_failure_without_hint_returns_stale_entry() {
        let lookup = Arc::new(FakeLookup::new());
        let users = UserDirectory::new(lookup.clone());
        users.find_at("ou_3", UserHint::default(), t0()).await;

        lookup.fail.store(true, Ordering::SeqCst);
        let stale = users
            .find_at("ou_3", UserHint::default(), t0() + Duration::seconds(7200))
            .await
            .unwrap();
        assert_eq!(stale.fetched_at, t0());

        assert!(users
            .find_at("ou_unknown", UserHint::default(), t0())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_hint_without_name_makes_no_profile() {
        let lookup = Arc::new(FakeLookup::new());
        lookup.fail.store(true, Ordering::SeqCst);
        let users = UserDirectory::new(lookup.clone());

        let union_only = UserHint {
            union_id: Some("on_1".to_string()),
            name: None,
        };
        assert!(users.find_at("ou_4", union_only, t0()).await.is_none());

        let blank_name = UserHint {
            union_id: Some("on_1".to_string()),
            name: Some(String::new()),
        };
        assert!(users.find_at("ou_4", blank_name, t0()).await.is_none());
        assert!(users.cached("ou_4").is_none());
    }
}
