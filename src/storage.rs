use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf, sync::Arc};
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};
use tracing::{debug, info, warn};

use crate::{
    audio::player::PlayHistory,
    bot::client::{ChatKind, ChatRef},
    sources::Track,
};

const TEMP_FILE_SUFFIX: &str = ".tmp";

pub const TRACKS_FILE: &str = "tracks.json";
pub const CHATS_FILE: &str = "chats.json";

/// Manager de almacenamiento basado en archivos JSON
#[derive(Debug)]
pub struct JsonStorage {
    data_dir: PathBuf,
}

impl JsonStorage {
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        // Crear directorio de datos si no existe
        fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("cannot create {}", data_dir.display()))?;

        // Verificar que se puede escribir antes de arrancar nada
        let probe = data_dir.join(".write_probe");
        fs::write(&probe, b"ok")
            .await
            .with_context(|| format!("data dir {} is not writable", data_dir.display()))?;
        fs::remove_file(&probe).await.ok();

        info!("📁 Storage inicializado en: {}", data_dir.display());

        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    /// Loads a collection; a missing file yields the default value.
    pub async fn load<T>(&self, name: &str) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        let path = self.data_dir.join(name);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("📂 {} no existe, usando valores por defecto", name);
                return Ok(T::default());
            }
            Err(e) => return Err(e).with_context(|| format!("cannot read {}", path.display())),
        };

        serde_json::from_str(&content).with_context(|| format!("corrupt JSON in {}", path.display()))
    }

    /// Writes a collection atomically (temp file + rename).
    pub async fn save<T>(&self, name: &str, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let path = self.data_dir.join(name);
        let temp = self.data_dir.join(format!("{}{}", name, TEMP_FILE_SUFFIX));

        let content = serde_json::to_vec_pretty(value)?;
        fs::write(&temp, content)
            .await
            .with_context(|| format!("cannot write {}", temp.display()))?;
        fs::rename(&temp, &path)
            .await
            .with_context(|| format!("cannot replace {}", path.display()))?;
        Ok(())
    }

    /// Appends one JSON document as a line (JSON Lines).
    pub async fn append_line<T>(&self, name: &str, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let path = self.data_dir.join(name);
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("cannot open {}", path.display()))?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Metadata de un track con contadores de reproducción
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackRecord {
    pub track: Track,
    pub play_count: u64,
    pub added_at: DateTime<Utc>,
    pub last_played: Option<DateTime<Utc>>,
}

/// Persistent track metadata and play counts, kept apart from queue state.
pub struct TrackLibrary {
    records: RwLock<HashMap<String, TrackRecord>>,
    storage: Arc<JsonStorage>,
    persist_lock: Mutex<()>,
}

impl TrackLibrary {
    pub async fn load(storage: Arc<JsonStorage>) -> Result<Self> {
        let records: HashMap<String, TrackRecord> = storage.load(TRACKS_FILE).await?;
        if !records.is_empty() {
            info!("📂 Cargados {} tracks", records.len());
        }

        Ok(Self {
            records: RwLock::new(records),
            storage,
            persist_lock: Mutex::new(()),
        })
    }

    /// Stores or refreshes the metadata of a track.
    pub async fn remember(&self, track: &Track) -> Result<()> {
        {
            let mut records = self.records.write();
            records
                .entry(track.id.clone())
                .and_modify(|record| record.track = track.clone())
                .or_insert_with(|| TrackRecord {
                    track: track.clone(),
                    play_count: 0,
                    added_at: Utc::now(),
                    last_played: None,
                });
        }
        self.persist().await
    }

    pub fn get(&self, id: &str) -> Option<TrackRecord> {
        self.records.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Most played first; ties broken by title.
    pub fn top_tracks(&self, limit: usize) -> Vec<TrackRecord> {
        let mut records: Vec<TrackRecord> = self
            .records
            .read()
            .values()
            .filter(|r| r.play_count > 0)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            b.play_count
                .cmp(&a.play_count)
                .then_with(|| a.track.title.cmp(&b.track.title))
        });
        records.truncate(limit);
        records
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.records.read().clone();
        self.storage.save(TRACKS_FILE, &snapshot).await
    }
}

#[async_trait::async_trait]
impl PlayHistory for TrackLibrary {
    async fn record_play(&self, track: &Track) -> Result<()> {
        {
            let mut records = self.records.write();
            let record = records.entry(track.id.clone()).or_insert_with(|| TrackRecord {
                track: track.clone(),
                play_count: 0,
                added_at: Utc::now(),
                last_played: None,
            });
            record.play_count += 1;
            record.last_played = Some(Utc::now());
        }
        self.persist().await
    }
}

/// Chat conocido por el bot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnownChat {
    pub id: i64,
    pub kind: ChatKind,
    pub title: Option<String>,
    pub first_seen: DateTime<Utc>,
}

/// Every chat the bot has seen; global bans fan out over its group chats.
pub struct ChatDirectory {
    chats: RwLock<HashMap<i64, KnownChat>>,
    storage: Arc<JsonStorage>,
    persist_lock: Mutex<()>,
}

impl ChatDirectory {
    pub async fn load(storage: Arc<JsonStorage>) -> Result<Self> {
        let chats: Vec<KnownChat> = storage.load(CHATS_FILE).await?;
        if !chats.is_empty() {
            info!("📂 Cargados {} chats conocidos", chats.len());
        }

        Ok(Self {
            chats: RwLock::new(chats.into_iter().map(|c| (c.id, c)).collect()),
            storage,
            persist_lock: Mutex::new(()),
        })
    }

    /// Records the chat; returns true when something changed on disk.
    pub async fn register(&self, chat: &ChatRef) -> Result<bool> {
        let changed = {
            let mut chats = self.chats.write();
            match chats.get_mut(&chat.id) {
                Some(known) if known.title == chat.title && known.kind == chat.kind => false,
                Some(known) => {
                    known.title = chat.title.clone();
                    known.kind = chat.kind;
                    true
                }
                None => {
                    chats.insert(
                        chat.id,
                        KnownChat {
                            id: chat.id,
                            kind: chat.kind,
                            title: chat.title.clone(),
                            first_seen: Utc::now(),
                        },
                    );
                    true
                }
            }
        };

        if changed {
            debug!("📝 Chat registrado: {} ({:?})", chat.id, chat.kind);
            self.persist().await?;
        }
        Ok(changed)
    }

    /// Drops a chat the bot can no longer reach.
    pub async fn forget(&self, chat_id: i64) -> Result<()> {
        if self.chats.write().remove(&chat_id).is_some() {
            warn!("🗑️ Chat {} eliminado del directorio", chat_id);
            self.persist().await?;
        }
        Ok(())
    }

    pub fn group_chats(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .chats
            .read()
            .values()
            .filter(|c| matches!(c.kind, ChatKind::Group | ChatKind::Supergroup))
            .map(|c| c.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.chats.read().len()
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let mut snapshot: Vec<KnownChat> = self.chats.read().values().cloned().collect();
        snapshot.sort_by_key(|c| c.id);
        self.storage.save(CHATS_FILE, &snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn storage() -> (tempfile::TempDir, Arc<JsonStorage>) {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::new(dir.path().to_path_buf()).await.unwrap();
        (dir, Arc::new(storage))
    }

    fn group(id: i64, title: &str) -> ChatRef {
        ChatRef { id, kind: ChatKind::Supergroup, title: Some(title.to_string()) }
    }

    #[tokio::test]
    async fn missing_files_load_as_defaults() {
        let (_dir, storage) = storage().await;
        let value: HashMap<String, u32> = storage.load("nothing.json").await.unwrap();
        assert!(value.is_empty());
    }

    #[tokio::test]
    async fn save_replaces_atomically_and_leaves_no_temp_file() {
        let (dir, storage) = storage().await;
        storage.save("numbers.json", &vec![1, 2, 3]).await.unwrap();
        storage.save("numbers.json", &vec![4]).await.unwrap();

        let loaded: Vec<u32> = storage.load("numbers.json").await.unwrap();
        assert_eq!(loaded, vec![4]);
        assert!(!dir.path().join("numbers.json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_files_are_reported() {
        let (dir, storage) = storage().await;
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        assert!(storage.load::<Vec<u32>>("bad.json").await.is_err());
    }

    #[tokio::test]
    async fn append_line_writes_json_lines() {
        let (dir, storage) = storage().await;
        storage.append_line("log.jsonl", &serde_json::json!({"n": 1})).await.unwrap();
        storage.append_line("log.jsonl", &serde_json::json!({"n": 2})).await.unwrap();

        let content = std::fs::read_to_string(dir.path().join("log.jsonl")).unwrap();
        assert_eq!(content, "{\"n\":1}\n{\"n\":2}\n");
    }

    #[tokio::test]
    async fn play_counts_survive_a_reload() {
        let (_dir, storage) = storage().await;
        let library = TrackLibrary::load(storage.clone()).await.unwrap();

        let a = Track::new("a", "Alpha", "https://youtu.be/a").with_duration(100);
        let b = Track::new("b", "Beta", "https://youtu.be/b");
        library.remember(&a).await.unwrap();
        library.record_play(&a).await.unwrap();
        library.record_play(&a).await.unwrap();
        library.record_play(&b).await.unwrap();

        let reloaded = TrackLibrary::load(storage).await.unwrap();
        let top: Vec<(String, u64)> = reloaded
            .top_tracks(5)
            .into_iter()
            .map(|r| (r.track.id, r.play_count))
            .collect();
        assert_eq!(top, vec![("a".to_string(), 2), ("b".to_string(), 1)]);
    }

    #[tokio::test]
    async fn only_group_chats_are_fan_out_targets() {
        let (_dir, storage) = storage().await;
        let chats = ChatDirectory::load(storage.clone()).await.unwrap();

        assert!(chats.register(&group(-100, "Music")).await.unwrap());
        assert!(!chats.register(&group(-100, "Music")).await.unwrap());
        chats
            .register(&ChatRef { id: 5, kind: ChatKind::Private, title: None })
            .await
            .unwrap();
        chats
            .register(&ChatRef { id: -7, kind: ChatKind::Group, title: Some("Old".into()) })
            .await
            .unwrap();

        assert_eq!(chats.group_chats(), vec![-100, -7]);

        chats.forget(-7).await.unwrap();
        let reloaded = ChatDirectory::load(storage).await.unwrap();
        assert_eq!(reloaded.group_chats(), vec![-100]);
        assert_eq!(reloaded.len(), 2);
    }
}
