//! Playback session bookkeeping: what is playing, since when, and what comes
//! next.

use std::path::PathBuf;

use serde::Serialize;
use tokio::time::Instant;

use crate::playback::encoder::EncoderSource;
use crate::types::PlaybackMode;

/// What a session plays, independent of seek position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SourceRef {
    #[serde(rename_all = "camelCase")]
    Live { sample_rate: u32, channels: u16 },
    File { path: PathBuf },
    Remote { url: String },
}

impl SourceRef {
    /// Short human-readable description for events and logs.
    pub fn describe(&self) -> String {
        match self {
            Self::Live {
                sample_rate,
                channels,
            } => format!("live:{}Hz/{}ch", sample_rate, channels),
            Self::File { path } => path.display().to_string(),
            Self::Remote { url } => url.clone(),
        }
    }

    /// Encoder input for this source. `resolved_url` replaces the remote URL
    /// when the resolver produced one.
    pub fn to_encoder_source(&self, seek_ms: u64, resolved_url: Option<String>) -> EncoderSource {
        match self {
            Self::Live {
                sample_rate,
                channels,
            } => EncoderSource::Live {
                sample_rate: *sample_rate,
                channels: *channels,
            },
            Self::File { path } => EncoderSource::File {
                path: path.clone(),
                seek_ms,
            },
            Self::Remote { url } => EncoderSource::Remote {
                url: resolved_url.unwrap_or_else(|| url.clone()),
            },
        }
    }
}

/// The session currently holding the encoder.
#[derive(Debug, Clone)]
pub struct PlaybackSession {
    pub id: String,
    pub mode: PlaybackMode,
    pub source: SourceRef,
    /// Position in the source at which the encoder was started.
    pub base_offset_ms: u64,
    pub started_at: Instant,
    /// Encoder child generation backing this session.
    pub generation: u64,
}

impl PlaybackSession {
    pub fn new(mode: PlaybackMode, source: SourceRef, base_offset_ms: u64, generation: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            mode,
            source,
            base_offset_ms,
            started_at: Instant::now(),
            generation,
        }
    }

    /// `base_offset + (now - started_at)`.
    pub fn elapsed_ms(&self) -> u64 {
        self.base_offset_ms + self.started_at.elapsed().as_millis() as u64
    }
}

/// A paused session, resumable by seeking to `resume_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PausedSession {
    pub mode: PlaybackMode,
    pub source: SourceRef,
    pub resume_ms: u64,
}

/// Ordered tracks with a cursor.
///
/// `current_index` is `-1` before the first track and always below `len`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistQueue {
    tracks: Vec<PathBuf>,
    current_index: isize,
    looping: bool,
}

impl PlaylistQueue {
    /// Returns `None` for an empty track list.
    pub fn new(tracks: Vec<PathBuf>, looping: bool) -> Option<Self> {
        if tracks.is_empty() {
            return None;
        }
        Some(Self {
            tracks,
            current_index: -1,
            looping,
        })
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn looping(&self) -> bool {
        self.looping
    }

    pub fn current_index(&self) -> isize {
        self.current_index
    }

    pub fn current(&self) -> Option<&PathBuf> {
        usize::try_from(self.current_index)
            .ok()
            .and_then(|i| self.tracks.get(i))
    }

    /// Moves to the next track, wrapping when looping. Returns `None` (and
    /// leaves the cursor alone) when the queue is exhausted.
    pub fn advance(&mut self) -> Option<&PathBuf> {
        let next = self.current_index + 1;
        if next < self.tracks.len() as isize {
            self.current_index = next;
        } else if self.looping {
            self.current_index = 0;
        } else {
            return None;
        }
        self.current()
    }

    /// Moves to the previous track, wrapping when looping. At the first
    /// track of a non-looping queue the cursor stays put.
    pub fn previous(&mut self) -> Option<&PathBuf> {
        if self.current_index > 0 {
            self.current_index -= 1;
        } else if self.looping {
            self.current_index = self.tracks.len() as isize - 1;
        } else {
            self.current_index = 0;
        }
        self.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(n: usize, looping: bool) -> PlaylistQueue {
        let tracks = (0..n).map(|i| PathBuf::from(format!("/t/{}.mp3", i))).collect();
        PlaylistQueue::new(tracks, looping).unwrap()
    }

    #[test]
    fn empty_queue_is_rejected() {
        assert!(PlaylistQueue::new(Vec::new(), true).is_none());
    }

    #[test]
    fn advance_stops_at_end_without_loop() {
        let mut q = queue(2, false);
        assert_eq!(q.current_index(), -1);
        assert_eq!(q.advance(), Some(&PathBuf::from("/t/0.mp3")));
        assert_eq!(q.advance(), Some(&PathBuf::from("/t/1.mp3")));
        assert_eq!(q.advance(), None);
        assert_eq!(q.current_index(), 1);
    }

    #[test]
    fn advance_wraps_when_looping() {
        let mut q = queue(2, true);
        q.advance();
        q.advance();
        assert_eq!(q.advance(), Some(&PathBuf::from("/t/0.mp3")));
    }

    #[test]
    fn previous_clamps_or_wraps() {
        let mut q = queue(3, false);
        q.advance();
        assert_eq!(q.previous(), Some(&PathBuf::from("/t/0.mp3")));

        let mut q = queue(3, true);
        q.advance();
        assert_eq!(q.previous(), Some(&PathBuf::from("/t/2.mp3")));
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_includes_base_offset() {
        let session = PlaybackSession::new(
            PlaybackMode::File,
            SourceRef::File {
                path: "/t/a.mp3".into(),
            },
            4_000,
            1,
        );
        tokio::time::advance(std::time::Duration::from_millis(2_500)).await;
        assert_eq!(session.elapsed_ms(), 6_500);
    }

    #[test]
    fn remote_source_prefers_resolved_url() {
        let source = SourceRef::Remote {
            url: "https://example.com/watch?v=1".into(),
        };
        assert_eq!(
            source.to_encoder_source(0, Some("https://cdn.example.com/a.m4a".into())),
            EncoderSource::Remote {
                url: "https://cdn.example.com/a.m4a".into()
            }
        );
    }
}
