//! External collaborators of the relay core.
//!
//! Authentication, the user directory and the recording store live in other
//! services; the relay only sees the traits below. In-memory implementations back
//! local runs and tests.

use crate::error::{RelayError, Result};
use crate::utils::unix_seconds;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use log::{debug, info};
use serde::Deserialize;
use shared::{
    AuthenticatedUser, Capability, Event, Lz4Codec, PacketCodec, RecordedLobby,
    RecordedLobbyHeader, ReplayFilter, UserRecord,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

#[async_trait]
pub trait AuthService: Send + Sync {
    /// Returns the identity behind a token, or `None` if the token is invalid.
    async fn validate_token(&self, token: &str) -> Option<AuthenticatedUser>;
    /// Issues a fresh token for an identity.
    async fn reissue_token(&self, user: &AuthenticatedUser) -> String;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user(&self, id: &str) -> Option<UserRecord>;
    async fn search_users_by_name(&self, query: &str) -> Vec<UserRecord>;
    async fn update_user_capabilities(&self, id: &str, capabilities: Vec<Capability>) -> Result<()>;
}

#[async_trait]
pub trait RecordingStore: Send + Sync {
    /// Lazily lists matching recordings. Dropping the stream stops the producer.
    async fn list_recorded_lobbies(
        &self,
        filter: ReplayFilter,
    ) -> BoxStream<'static, RecordedLobbyHeader>;
    async fn get_recorded_lobby(&self, id: &str) -> Option<RecordedLobby>;
}

/// Side channel feeding the recorder with lobby lifecycle and flushed event batches.
pub trait RecordingSink: Send + Sync {
    fn lobby_connected(&self, lobby_id: &str);
    fn lobby_disconnected(&self, lobby_id: &str);
    fn lobby_data(&self, lobby_id: &str, events: Vec<Event>);
}

/// Sink that only logs, used when no recorder is attached.
#[derive(Debug, Default)]
pub struct LogSink;

impl RecordingSink for LogSink {
    fn lobby_connected(&self, lobby_id: &str) {
        debug!("Recorder: lobby {} connected", lobby_id);
    }

    fn lobby_disconnected(&self, lobby_id: &str) {
        debug!("Recorder: lobby {} disconnected", lobby_id);
    }

    fn lobby_data(&self, lobby_id: &str, events: Vec<Event>) {
        debug!("Recorder: {} events for lobby {}", events.len(), lobby_id);
    }
}

/// Everything the router needs from outside the core.
#[derive(Clone)]
pub struct Services {
    pub auth: Arc<dyn AuthService>,
    pub directory: Arc<dyn UserDirectory>,
    pub recordings: Arc<dyn RecordingStore>,
    pub sink: Arc<dyn RecordingSink>,
    pub codec: Arc<dyn PacketCodec>,
}

impl Services {
    /// Empty in-memory collaborators with the default codec and a logging sink.
    pub fn in_memory() -> Self {
        let directory = Arc::new(InMemoryDirectory::default());
        Self {
            auth: Arc::new(TokenAuth::new(Arc::clone(&directory), TokenAuth::DEFAULT_LIFETIME)),
            directory,
            recordings: Arc::new(InMemoryRecordings::default()),
            sink: Arc::new(LogSink),
            codec: Arc::new(Lz4Codec),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    users: RwLock<HashMap<String, UserRecord>>,
}

impl InMemoryDirectory {
    pub async fn insert(&self, user: UserRecord) {
        self.users.write().await.insert(user.id.clone(), user);
    }
}

#[async_trait]
impl UserDirectory for InMemoryDirectory {
    async fn find_user(&self, id: &str) -> Option<UserRecord> {
        self.users.read().await.get(id).cloned()
    }

    async fn search_users_by_name(&self, query: &str) -> Vec<UserRecord> {
        let needle = query.to_lowercase();
        let mut found: Vec<UserRecord> = self
            .users
            .read()
            .await
            .values()
            .filter(|user| user.username.to_lowercase().contains(&needle))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.username.cmp(&b.username));
        found
    }

    async fn update_user_capabilities(&self, id: &str, capabilities: Vec<Capability>) -> Result<()> {
        let mut users = self.users.write().await;
        let user = users
            .get_mut(id)
            .ok_or_else(|| RelayError::unknown("user", id))?;
        user.capabilities = capabilities;
        Ok(())
    }
}

/// Opaque-token auth. Capabilities are copied into the token when it is issued,
/// so a token can go stale relative to the directory.
pub struct TokenAuth {
    directory: Arc<InMemoryDirectory>,
    tokens: RwLock<HashMap<String, AuthenticatedUser>>,
    lifetime: Duration,
}

impl TokenAuth {
    pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(30 * 24 * 60 * 60);

    pub fn new(directory: Arc<InMemoryDirectory>, lifetime: Duration) -> Self {
        Self {
            directory,
            tokens: RwLock::new(HashMap::new()),
            lifetime,
        }
    }

    /// Registers a token for an identity as-is.
    pub async fn insert_token(&self, token: &str, user: AuthenticatedUser) {
        self.tokens.write().await.insert(token.to_string(), user);
    }

    /// Issues a token for a directory user with the directory's current capabilities.
    pub async fn issue(&self, user_id: &str) -> Option<String> {
        let record = self.directory.find_user(user_id).await?;
        let user = AuthenticatedUser {
            id: record.id,
            username: record.username,
            capabilities: record.capabilities,
            expires_at: Some(unix_seconds() + self.lifetime.as_secs()),
        };
        Some(self.store_new(user).await)
    }

    async fn store_new(&self, user: AuthenticatedUser) -> String {
        let token = Uuid::new_v4().to_string();
        self.tokens.write().await.insert(token.clone(), user);
        token
    }
}

#[async_trait]
impl AuthService for TokenAuth {
    async fn validate_token(&self, token: &str) -> Option<AuthenticatedUser> {
        self.tokens.read().await.get(token).cloned()
    }

    async fn reissue_token(&self, user: &AuthenticatedUser) -> String {
        let capabilities = match self.directory.find_user(&user.id).await {
            Some(record) => record.capabilities,
            None => user.capabilities.clone(),
        };
        let fresh = AuthenticatedUser {
            capabilities,
            expires_at: Some(unix_seconds() + self.lifetime.as_secs()),
            ..user.clone()
        };
        self.store_new(fresh).await
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRecordings {
    lobbies: RwLock<Vec<RecordedLobby>>,
}

impl InMemoryRecordings {
    pub async fn insert(&self, lobby: RecordedLobby) {
        self.lobbies.write().await.push(lobby);
    }
}

#[async_trait]
impl RecordingStore for InMemoryRecordings {
    async fn list_recorded_lobbies(
        &self,
        filter: ReplayFilter,
    ) -> BoxStream<'static, RecordedLobbyHeader> {
        let headers: Vec<RecordedLobbyHeader> = self
            .lobbies
            .read()
            .await
            .iter()
            .map(|lobby| lobby.header.clone())
            .collect();

        // Producer task stops as soon as the consumer side is dropped.
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for header in headers.into_iter().filter(|h| filter.matches(h)) {
                if tx.send(header).await.is_err() {
                    debug!("Replay listing consumer went away, stopping producer");
                    return;
                }
            }
        });

        Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|header| (header, rx))
        }))
    }

    async fn get_recorded_lobby(&self, id: &str) -> Option<RecordedLobby> {
        self.lobbies
            .read()
            .await
            .iter()
            .find(|lobby| lobby.header.id == id)
            .cloned()
    }
}

/// Seed file for local runs.
#[derive(Debug, Deserialize)]
pub struct UsersFile {
    #[serde(default)]
    pub users: Vec<UserRecord>,
    #[serde(default)]
    pub tokens: Vec<SeedToken>,
    #[serde(default)]
    pub recordings: Vec<RecordedLobby>,
}

#[derive(Debug, Deserialize)]
pub struct SeedToken {
    pub token: String,
    pub user_id: String,
}

/// Builds in-memory collaborators from a seed file.
pub async fn load_users_file(path: &Path) -> Result<Services> {
    let raw = tokio::fs::read_to_string(path).await?;
    let seed: UsersFile = serde_json::from_str(&raw)?;
    Ok(seed_services(seed).await)
}

pub async fn seed_services(seed: UsersFile) -> Services {
    let directory = Arc::new(InMemoryDirectory::default());
    for user in seed.users {
        directory.insert(user).await;
    }

    let auth = Arc::new(TokenAuth::new(Arc::clone(&directory), TokenAuth::DEFAULT_LIFETIME));
    for seed_token in seed.tokens {
        match directory.find_user(&seed_token.user_id).await {
            Some(record) => {
                let user = AuthenticatedUser {
                    id: record.id,
                    username: record.username,
                    capabilities: record.capabilities,
                    expires_at: Some(unix_seconds() + TokenAuth::DEFAULT_LIFETIME.as_secs()),
                };
                auth.insert_token(&seed_token.token, user).await;
            }
            None => info!("Seed token for unknown user {} ignored", seed_token.user_id),
        }
    }

    let recordings = Arc::new(InMemoryRecordings::default());
    for lobby in seed.recordings {
        recordings.insert(lobby).await;
    }

    Services {
        auth,
        directory,
        recordings,
        sink: Arc::new(LogSink),
        codec: Arc::new(Lz4Codec),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use shared::ChunkSpan;
    use tokio_test::{assert_err, assert_ok};

    fn record(id: &str, name: &str, caps: Vec<Capability>) -> UserRecord {
        UserRecord {
            id: id.to_string(),
            username: name.to_string(),
            capabilities: caps,
        }
    }

    fn recording(id: &str, name: &str) -> RecordedLobby {
        RecordedLobby {
            header: RecordedLobbyHeader {
                id: id.to_string(),
                lobby_name: name.to_string(),
                mission_name: "Mission".to_string(),
                host_name: "Host".to_string(),
                player_names: vec![],
                recorded_at: 1_000,
            },
            chunks: vec![ChunkSpan { start: 0, length: 10 }],
        }
    }

    #[tokio::test]
    async fn test_directory_search_and_update() {
        let directory = InMemoryDirectory::default();
        directory.insert(record("1", "Maverick", vec![])).await;
        directory.insert(record("2", "Goose", vec![])).await;

        let found = directory.search_users_by_name("mav").await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "1");

        assert_ok!(directory.update_user_capabilities("2", vec![Capability::Admin]).await);
        assert_eq!(
            directory.find_user("2").await.map(|u| u.capabilities),
            Some(vec![Capability::Admin])
        );
        assert_err!(directory.update_user_capabilities("9", vec![]).await);
    }

    #[tokio::test]
    async fn test_token_auth_reissue_uses_directory_capabilities() {
        let directory = Arc::new(InMemoryDirectory::default());
        directory.insert(record("1", "Maverick", vec![Capability::Donor])).await;
        let auth = TokenAuth::new(Arc::clone(&directory), Duration::from_secs(60));

        let token = auth.issue("1").await.unwrap();
        let user = auth.validate_token(&token).await.unwrap();
        assert_eq!(user.capabilities, vec![Capability::Donor]);
        assert!(auth.validate_token("bogus").await.is_none());

        directory
            .update_user_capabilities("1", vec![Capability::Admin])
            .await
            .unwrap();
        let fresh = auth.reissue_token(&user).await;
        assert_ne!(fresh, token);
        let refreshed = auth.validate_token(&fresh).await.unwrap();
        assert_eq!(refreshed.capabilities, vec![Capability::Admin]);
    }

    #[tokio::test]
    async fn test_recording_listing_filters() {
        let store = InMemoryRecordings::default();
        store.insert(recording("r1", "24/7 BVR Arena")).await;
        store.insert(recording("r2", "Casual")).await;

        let filter = ReplayFilter {
            lobby_name: "arena".to_string(),
            ..Default::default()
        };
        let headers: Vec<_> = store.list_recorded_lobbies(filter).await.collect().await;
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].id, "r1");

        assert!(store.get_recorded_lobby("r2").await.is_some());
        assert!(store.get_recorded_lobby("r3").await.is_none());
    }

    #[tokio::test]
    async fn test_seed_services() {
        let seed: UsersFile = serde_json::from_str(
            r#"{
                "users": [{"id": "1", "username": "Admin", "capabilities": ["admin"]}],
                "tokens": [{"token": "t1", "user_id": "1"}, {"token": "t2", "user_id": "404"}]
            }"#,
        )
        .unwrap();
        let services = seed_services(seed).await;

        let user = services.auth.validate_token("t1").await.unwrap();
        assert_eq!(user.capabilities, vec![Capability::Admin]);
        assert!(services.auth.validate_token("t2").await.is_none());
    }
}
