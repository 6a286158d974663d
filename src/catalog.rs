//! Catalog stores: the read-only source of playlists, songs and lyrics.
//!
//! The session handler only talks to the [`CatalogStore`] trait. Two stores
//! are provided: [`FsCatalog`], which maps playlists to directories under a
//! root, and [`MemoryCatalog`], an insertion-ordered in-memory catalog.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncRead;
use tracing::debug;

use crate::constants::LYRICS_EXTENSION;
use crate::{Error, Result};

/// An opened song: its size and a reader over its bytes.
pub struct Resource {
    pub len: u64,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource").field("len", &self.len).finish()
    }
}

/// Read-only access to the catalog.
///
/// Implementations report every lookup failure, including I/O failures, as
/// [`Error::NotFound`] so that a broken entry never tears down a session.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Playlist names, in a stable order.
    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Song names of a playlist, in a stable order.
    async fn list_items(&self, collection: &str) -> Result<Vec<String>>;

    /// Open a song for streaming.
    async fn open_resource(&self, collection: &str, item: &str) -> Result<Resource>;

    /// Lyrics of a song.
    async fn lyrics_for(&self, collection: &str, item: &str) -> Result<String>;
}

/// Catalog backed by a directory tree: `root/<playlist>/<song>`, with the
/// lyrics of `song.mp3` stored as `song.txt` next to it.
#[derive(Debug, Clone)]
pub struct FsCatalog {
    root: PathBuf,
}

impl FsCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsCatalog { root: root.into() }
    }

    fn collection_dir(&self, collection: &str) -> Result<PathBuf> {
        check_name(collection, "playlist")?;
        Ok(self.root.join(collection))
    }

    fn item_path(&self, collection: &str, item: &str) -> Result<PathBuf> {
        check_name(item, "song")?;
        Ok(self.collection_dir(collection)?.join(item))
    }

    /// Sorted names of the visible entries of `dir` that satisfy `keep`.
    async fn sorted_entries<F>(dir: &Path, what: &str, keep: F) -> Result<Vec<String>>
    where
        F: Fn(&std::fs::FileType, &str) -> bool,
    {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| lookup_error(what, e))?;

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| lookup_error(what, e))?
        {
            let Ok(name) = entry.file_name().into_string() else {
                debug!(path = %entry.path().display(), "skipping non UTF-8 catalog entry");
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let file_type = entry.file_type().await.map_err(|e| lookup_error(what, e))?;
            if keep(&file_type, &name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl CatalogStore for FsCatalog {
    async fn list_collections(&self) -> Result<Vec<String>> {
        Self::sorted_entries(&self.root, "catalog root", |ft, _| ft.is_dir()).await
    }

    async fn list_items(&self, collection: &str) -> Result<Vec<String>> {
        let dir = self.collection_dir(collection)?;
        let what = format!("playlist {collection}");
        Self::sorted_entries(&dir, &what, |ft, name| {
            ft.is_file() && !is_lyrics_file(name)
        })
        .await
    }

    async fn open_resource(&self, collection: &str, item: &str) -> Result<Resource> {
        let path = self.item_path(collection, item)?;
        let what = format!("song {item} in playlist {collection}");

        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| lookup_error(&what, e))?;
        if !metadata.is_file() {
            return Err(Error::NotFound(what));
        }
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| lookup_error(&what, e))?;

        Ok(Resource {
            len: metadata.len(),
            reader: Box::new(file),
        })
    }

    async fn lyrics_for(&self, collection: &str, item: &str) -> Result<String> {
        let path = self.item_path(collection, item)?;
        let what = format!("lyrics for {item} in playlist {collection}");
        tokio::fs::read_to_string(lyrics_path(&path))
            .await
            .map_err(|e| lookup_error(&what, e))
    }
}

/// Path of the lyrics file belonging to a song: the media extension is
/// replaced by the lyrics extension.
pub fn lyrics_path(song: &Path) -> PathBuf {
    song.with_extension(LYRICS_EXTENSION)
}

fn is_lyrics_file(name: &str) -> bool {
    Path::new(name)
        .extension()
        .is_some_and(|ext| ext == LYRICS_EXTENSION)
}

/// Reject names that would escape the catalog root.
fn check_name(name: &str, kind: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if invalid {
        return Err(Error::NotFound(format!("{kind} {name:?}")));
    }
    Ok(())
}

fn lookup_error(what: &str, err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::NotFound => Error::NotFound(what.to_string()),
        _ => Error::NotFound(format!("{what} ({err})")),
    }
}

#[derive(Debug, Clone)]
struct MemorySong {
    name: String,
    data: Bytes,
    lyrics: Option<String>,
}

#[derive(Debug, Clone)]
struct MemoryPlaylist {
    name: String,
    songs: Vec<MemorySong>,
}

/// In-memory catalog that keeps playlists and songs in insertion order.
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    playlists: Vec<MemoryPlaylist>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an empty playlist if it does not exist yet.
    pub fn with_playlist(mut self, playlist: &str) -> Self {
        self.playlist_mut(playlist);
        self
    }

    /// Add a song, creating its playlist when needed.
    pub fn with_song(mut self, playlist: &str, song: &str, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let songs = &mut self.playlist_mut(playlist).songs;
        match songs.iter_mut().find(|s| s.name == song) {
            Some(existing) => existing.data = data,
            None => songs.push(MemorySong {
                name: song.to_string(),
                data,
                lyrics: None,
            }),
        }
        self
    }

    /// Attach lyrics to a song, creating an empty song when needed.
    pub fn with_lyrics(mut self, playlist: &str, song: &str, lyrics: &str) -> Self {
        let songs = &mut self.playlist_mut(playlist).songs;
        match songs.iter_mut().find(|s| s.name == song) {
            Some(existing) => existing.lyrics = Some(lyrics.to_string()),
            None => songs.push(MemorySong {
                name: song.to_string(),
                data: Bytes::new(),
                lyrics: Some(lyrics.to_string()),
            }),
        }
        self
    }

    fn playlist_mut(&mut self, name: &str) -> &mut MemoryPlaylist {
        let pos = match self.playlists.iter().position(|p| p.name == name) {
            Some(pos) => pos,
            None => {
                self.playlists.push(MemoryPlaylist {
                    name: name.to_string(),
                    songs: Vec::new(),
                });
                self.playlists.len() - 1
            }
        };
        &mut self.playlists[pos]
    }

    fn playlist(&self, name: &str) -> Result<&MemoryPlaylist> {
        self.playlists
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| Error::NotFound(format!("playlist {name}")))
    }

    fn song(&self, playlist: &str, song: &str) -> Result<&MemorySong> {
        self.playlist(playlist)?
            .songs
            .iter()
            .find(|s| s.name == song)
            .ok_or_else(|| Error::NotFound(format!("song {song} in playlist {playlist}")))
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn list_collections(&self) -> Result<Vec<String>> {
        Ok(self.playlists.iter().map(|p| p.name.clone()).collect())
    }

    async fn list_items(&self, collection: &str) -> Result<Vec<String>> {
        Ok(self
            .playlist(collection)?
            .songs
            .iter()
            .map(|s| s.name.clone())
            .collect())
    }

    async fn open_resource(&self, collection: &str, item: &str) -> Result<Resource> {
        let song = self.song(collection, item)?;
        Ok(Resource {
            len: song.data.len() as u64,
            reader: Box::new(io::Cursor::new(song.data.clone())),
        })
    }

    async fn lyrics_for(&self, collection: &str, item: &str) -> Result<String> {
        self.song(collection, item)?
            .lyrics
            .clone()
            .ok_or_else(|| Error::NotFound(format!("lyrics for {item} in playlist {collection}")))
    }
}
