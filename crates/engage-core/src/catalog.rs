//! Catalog collaborator port
//!
//! The catalog confirms that a (video, playlist) pair exists and supplies the
//! facts needed for coverage estimation. Playlist CRUD and privacy rules live
//! behind this port, outside the engine.

use crate::error::CatalogError;
use crate::types::{PlaylistId, VideoId, VideoInfo};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::fmt::Debug;

/// Read-only catalog port
#[async_trait]
pub trait Catalog: Send + Sync + Debug {
    /// Video info when `video_id` exists and belongs to `playlist_id`
    async fn resolve(
        &self,
        video_id: &VideoId,
        playlist_id: &PlaylistId,
    ) -> Result<Option<VideoInfo>, CatalogError>;

    /// Video info regardless of playlist
    async fn video_info(&self, video_id: &VideoId) -> Result<Option<VideoInfo>, CatalogError>;
}

/// In-process catalog
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    videos: DashMap<VideoId, VideoInfo>,
    playlists: DashMap<PlaylistId, HashSet<VideoId>>,
}

impl InMemoryCatalog {
    /// Create empty catalog
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a video in a playlist
    pub fn insert(&self, playlist_id: PlaylistId, info: VideoInfo) {
        self.playlists
            .entry(playlist_id)
            .or_default()
            .insert(info.video_id.clone());
        self.videos.insert(info.video_id.clone(), info);
    }

    /// Drop a video from a playlist
    pub fn remove_from_playlist(&self, playlist_id: PlaylistId, video_id: &VideoId) {
        if let Some(mut videos) = self.playlists.get_mut(&playlist_id) {
            videos.remove(video_id);
        }
    }

    /// Number of known videos
    #[inline]
    #[must_use]
    pub fn video_count(&self) -> usize {
        self.videos.len()
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn resolve(
        &self,
        video_id: &VideoId,
        playlist_id: &PlaylistId,
    ) -> Result<Option<VideoInfo>, CatalogError> {
        let listed = self
            .playlists
            .get(playlist_id)
            .is_some_and(|videos| videos.contains(video_id));
        if !listed {
            return Ok(None);
        }
        Ok(self.videos.get(video_id).map(|v| v.value().clone()))
    }

    async fn video_info(&self, video_id: &VideoId) -> Result<Option<VideoInfo>, CatalogError> {
        Ok(self.videos.get(video_id).map(|v| v.value().clone()))
    }
}
