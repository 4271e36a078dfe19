//! Per-chat persistence of timed effects.
//!
//! Each chat's effects live in `{dir}/chat-{hex(chat_id)}.json`; the hex name
//! is unique per chat id and the snapshot carries the real id. A chat is
//! checked out under a per-chat lock and written back on commit, so two
//! activation calls for the same chat never interleave. Different chats
//! don't contend.

use super::effects::TimedEffects;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Stored form of one chat's effects
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectsSnapshot {
    pub chat_id: String,
    pub saved_at: DateTime<Utc>,
    pub effects: TimedEffects,
}

/// A chat's effects, held under that chat's lock until committed or dropped
pub struct ChatEffects {
    chat_id: String,
    path: PathBuf,
    pub effects: TimedEffects,
    _guard: OwnedMutexGuard<()>,
}

impl ChatEffects {
    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    /// Write the effects back and release the chat lock
    pub async fn commit(self) -> Result<()> {
        let snapshot = EffectsSnapshot {
            chat_id: self.chat_id.clone(),
            saved_at: Utc::now(),
            effects: self.effects,
        };

        let content = serde_json::to_string_pretty(&snapshot)?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;

        debug!("Saved timed effects for chat {}", self.chat_id);
        Ok(())
    }
}

/// Directory of per-chat effect snapshots, with one lock per chat
pub struct TimedEffectsStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TimedEffectsStore {
    /// Open a store rooted at `dir`, creating it if needed
    pub async fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).await?;
        Ok(Self {
            dir: dir.to_path_buf(),
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Lock a chat and load its effects.
    ///
    /// A missing file yields empty effects; so does a corrupt one, with a
    /// warning, since stale timers must never block a turn.
    pub async fn checkout(&self, chat_id: &str) -> Result<ChatEffects> {
        let guard = self.lock_chat(chat_id).await;

        let path = self.path_of(chat_id);
        let effects = if path.exists() {
            let content = fs::read_to_string(&path).await?;
            match serde_json::from_str::<EffectsSnapshot>(&content) {
                Ok(snapshot) => snapshot.effects,
                Err(e) => {
                    warn!("Failed to parse timed effects for chat {}: {}", chat_id, e);
                    TimedEffects::default()
                }
            }
        } else {
            TimedEffects::default()
        };

        Ok(ChatEffects {
            chat_id: chat_id.to_string(),
            path,
            effects,
            _guard: guard,
        })
    }

    /// List the ids of chats that have stored effects
    pub async fn list_chats(&self) -> Result<Vec<String>> {
        let mut chats = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path).await?;
            match serde_json::from_str::<EffectsSnapshot>(&content) {
                Ok(snapshot) => chats.push(snapshot.chat_id),
                Err(e) => warn!("Skipping unreadable snapshot {:?}: {}", path, e),
            }
        }
        chats.sort();
        Ok(chats)
    }

    /// Forget a chat's effects, e.g. when the chat is deleted.
    ///
    /// Waits for any checkout of the chat to be committed or dropped first.
    pub async fn remove(&self, chat_id: &str) -> Result<bool> {
        let guard = self.lock_chat(chat_id).await;

        let path = self.path_of(chat_id);
        let removed = if path.exists() {
            fs::remove_file(&path).await?;
            info!("Removed timed effects for chat {}", chat_id);
            true
        } else {
            false
        };

        drop(guard);
        self.prune_idle_locks().await;
        Ok(removed)
    }

    /// Acquire the lock of `chat_id`, creating it on first use
    async fn lock_chat(&self, chat_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Self::retain_busy(&mut locks);
            locks.entry(chat_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    async fn prune_idle_locks(&self) {
        let mut locks = self.locks.lock().await;
        Self::retain_busy(&mut locks);
    }

    /// Drop locks nobody holds or waits on.
    ///
    /// Clones are only taken under the map lock, so a count of one means the
    /// map holds the sole reference.
    fn retain_busy(locks: &mut HashMap<String, Arc<Mutex<()>>>) {
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    fn path_of(&self, chat_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(chat_id)))
    }

    #[cfg(test)]
    async fn lock_count(&self) -> usize {
        self.locks.lock().await.len()
    }
}

/// Hex-encode a chat id into a file stem; distinct ids never collide
fn file_stem(chat_id: &str) -> String {
    format!("chat-{}", hex::encode(chat_id.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorebook::EntryHash;
    use crate::timed::TimedEffect;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_commit_and_reload() {
        let dir = TempDir::new().unwrap();
        let store = TimedEffectsStore::new(dir.path()).await.unwrap();

        let mut chat = store.checkout("chat/1").await.unwrap();
        assert!(chat.effects.is_empty());
        chat.effects.sticky.insert(
            "book.1".into(),
            TimedEffect {
                hash: EntryHash(42),
                start: 3,
                end: 5,
                protected: false,
            },
        );
        chat.commit().await.unwrap();

        let chat = store.checkout("chat/1").await.unwrap();
        assert_eq!(chat.effects.sticky["book.1"].end, 5);
        drop(chat);

        assert_eq!(store.list_chats().await.unwrap(), vec!["chat/1"]);
        assert!(store.remove("chat/1").await.unwrap());
        assert!(!store.remove("chat/1").await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_file_yields_empty_effects() {
        let dir = TempDir::new().unwrap();
        let store = TimedEffectsStore::new(dir.path()).await.unwrap();
        let path = dir.path().join(format!("{}.json", file_stem("bad")));
        std::fs::write(path, "{not json").unwrap();

        let chat = store.checkout("bad").await.unwrap();
        assert!(chat.effects.is_empty());
        drop(chat);
        assert!(store.list_chats().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_similar_chat_ids_stay_separate() {
        let dir = TempDir::new().unwrap();
        let store = TimedEffectsStore::new(dir.path()).await.unwrap();

        let mut slashed = store.checkout("room/1").await.unwrap();
        slashed.effects.sticky.insert(
            "book.1".into(),
            TimedEffect {
                hash: EntryHash(1),
                start: 1,
                end: 3,
                protected: false,
            },
        );

        // Different id, so no contention with the held checkout
        let underscored = tokio::time::timeout(Duration::from_secs(1), store.checkout("room_1"))
            .await
            .expect("room_1 must not wait on room/1")
            .unwrap();
        slashed.commit().await.unwrap();
        underscored.commit().await.unwrap();

        let chat = store.checkout("room_1").await.unwrap();
        assert!(chat.effects.is_empty());
        drop(chat);
        let chat = store.checkout("room/1").await.unwrap();
        assert!(chat.effects.sticky.contains_key("book.1"));
        drop(chat);

        assert_eq!(store.list_chats().await.unwrap(), vec!["room/1", "room_1"]);
    }

    #[tokio::test]
    async fn test_remove_waits_for_checkout() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(TimedEffectsStore::new(dir.path()).await.unwrap());

        let held = store.checkout("c").await.unwrap();
        held.commit().await.unwrap();
        let held = store.checkout("c").await.unwrap();

        let removing = {
            let store = store.clone();
            tokio::spawn(async move { store.remove("c").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!removing.is_finished());

        let second = {
            let store = store.clone();
            tokio::spawn(async move { store.checkout("c").await.map(|chat| chat.effects) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        drop(held);
        assert!(removing.await.unwrap().unwrap());
        assert!(second.await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_idle_locks_are_pruned() {
        let dir = TempDir::new().unwrap();
        let store = TimedEffectsStore::new(dir.path()).await.unwrap();

        for id in ["a", "b", "c"] {
            drop(store.checkout(id).await.unwrap());
        }
        let held = store.checkout("d").await.unwrap();
        assert_eq!(store.lock_count().await, 1);

        drop(held);
        store.remove("d").await.unwrap();
        assert_eq!(store.lock_count().await, 0);
    }

    #[tokio::test]
    async fn test_same_chat_is_serialized() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(TimedEffectsStore::new(dir.path()).await.unwrap());

        let held = store.checkout("c").await.unwrap();
        let waiting = {
            let store = store.clone();
            tokio::spawn(async move { store.checkout("c").await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        // Other chats are independent
        let other = tokio::time::timeout(Duration::from_secs(1), store.checkout("d")).await;
        assert!(other.is_ok());

        drop(held);
        waiting.await.unwrap().unwrap();
    }
}
