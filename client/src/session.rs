//! Per-user session.
//!
//! A [`Session`] owns one [`SyncedCollection`] per entity kind and the change
//! feed they share. Dependencies are passed in explicitly; nothing is global.
//! Signing out releases every feed subscription.

use std::sync::Arc;

use tracing::info;

use crate::collection::SyncedCollection;
use crate::config::ClientConfig;
use crate::entities::{Goal, JournalEntry, Task, GOALS, JOURNAL_ENTRIES, TASKS};
use crate::error::{ConfigError, FeedError, SyncError};
use crate::feed::{ChangeFeed, FeedFilter};
use crate::http::HttpRemoteStore;
use crate::memory::MemoryBackend;
use crate::remote::RemoteStore;
use crate::ws::WebSocketFeed;

/// Remote stores for every entity kind of a session.
pub struct Remotes {
    pub tasks: Arc<dyn RemoteStore<Task>>,
    pub goals: Arc<dyn RemoteStore<Goal>>,
    pub journal_entries: Arc<dyn RemoteStore<JournalEntry>>,
}

impl Remotes {
    /// Tables of an in-memory backend.
    pub fn memory(backend: &MemoryBackend) -> Self {
        Self {
            tasks: Arc::new(backend.store::<Task>(TASKS)),
            goals: Arc::new(backend.store::<Goal>(GOALS)),
            journal_entries: Arc::new(backend.store::<JournalEntry>(JOURNAL_ENTRIES)),
        }
    }

    /// REST endpoints of the reference server.
    pub fn http(config: &ClientConfig) -> Result<Self, ConfigError> {
        let client = config.http_client()?;
        let api_url = config.api_url.as_str();
        Ok(Self {
            tasks: Arc::new(HttpRemoteStore::<Task>::with_client(client.clone(), api_url, TASKS)),
            goals: Arc::new(HttpRemoteStore::<Goal>::with_client(client.clone(), api_url, GOALS)),
            journal_entries: Arc::new(HttpRemoteStore::<JournalEntry>::with_client(
                client,
                api_url,
                JOURNAL_ENTRIES,
            )),
        })
    }
}

/// Errors opening a session against a server.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Feed(#[from] FeedError),
}

pub struct Session {
    user_id: String,
    feed: Arc<dyn ChangeFeed>,
    pub tasks: SyncedCollection<Task>,
    pub goals: SyncedCollection<Goal>,
    pub journal_entries: SyncedCollection<JournalEntry>,
}

impl Session {
    pub fn new(user_id: impl Into<String>, remotes: Remotes, feed: Arc<dyn ChangeFeed>) -> Self {
        Self {
            user_id: user_id.into(),
            feed,
            tasks: SyncedCollection::new(TASKS, remotes.tasks),
            goals: SyncedCollection::new(GOALS, remotes.goals),
            journal_entries: SyncedCollection::new(JOURNAL_ENTRIES, remotes.journal_entries),
        }
    }

    /// A session over an in-memory backend, which is also the feed.
    pub fn in_memory(user_id: impl Into<String>, backend: &MemoryBackend) -> Self {
        Self::new(user_id, Remotes::memory(backend), Arc::new(backend.clone()))
    }

    /// A session against the reference server: REST for writes, one
    /// WebSocket connection for the feed.
    pub async fn connect(
        config: &ClientConfig,
        user_id: impl Into<String>,
    ) -> Result<Self, ConnectError> {
        let remotes = Remotes::http(config)?;
        let feed = WebSocketFeed::connect(&config.feed_url).await?;
        Ok(Self::new(user_id, remotes, Arc::new(feed)))
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Load every collection and subscribe to this user's changes.
    ///
    /// Feeds are attached before loading so nothing committed in between is
    /// missed. Events that arrive while a list is in flight are merged again
    /// over its rows.
    pub async fn start(&self) -> Result<(), SyncError> {
        let filter = FeedFilter::eq("user_id", self.user_id.as_str());

        self.tasks
            .attach_feed(Arc::clone(&self.feed), Some(filter.clone()))
            .await?;
        self.goals
            .attach_feed(Arc::clone(&self.feed), Some(filter.clone()))
            .await?;
        self.journal_entries
            .attach_feed(Arc::clone(&self.feed), Some(filter))
            .await?;

        self.tasks.load().await?;
        self.goals.load().await?;
        self.journal_entries.load().await?;

        info!(user_id = %self.user_id, "session started");
        Ok(())
    }

    /// Release every feed subscription. Every collection is detached even if
    /// one fails; the first failure is returned.
    pub async fn sign_out(self) -> Result<(), SyncError> {
        let results = [
            self.tasks.detach_feed().await,
            self.goals.detach_feed().await,
            self.journal_entries.detach_feed().await,
        ];

        info!(user_id = %self.user_id, "session signed out");
        results.into_iter().collect()
    }
}
