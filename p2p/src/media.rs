use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Metadata for one media track. The media itself never travels through the
/// room.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStream {
    pub id: String,
    #[serde(default)]
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            tracks: Vec::new(),
        }
    }

    pub fn with_track(mut self, track: MediaTrack) -> Self {
        self.add_track(track);
        self
    }

    /// Add a track, replacing any track with the same id.
    pub fn add_track(&mut self, track: MediaTrack) {
        self.tracks.retain(|t| t.id != track.id);
        self.tracks.push(track);
    }

    pub fn remove_track(&mut self, track_id: &str) -> bool {
        let before = self.tracks.len();
        self.tracks.retain(|t| t.id != track_id);
        self.tracks.len() != before
    }
}

/// Attach/detach notices sent on the reserved `__media` action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum MediaNotice {
    AddStream { stream: MediaStream },
    RemoveStream { stream_id: String },
    AddTrack { stream: MediaStream, track: MediaTrack },
    RemoveTrack { stream_id: String, track_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: &str, kind: TrackKind) -> MediaTrack {
        MediaTrack {
            id: id.into(),
            kind,
        }
    }

    #[test]
    fn tracks_are_unique_by_id() {
        let mut stream = MediaStream::new("cam")
            .with_track(track("t1", TrackKind::Video))
            .with_track(track("t1", TrackKind::Audio));
        assert_eq!(stream.tracks.len(), 1);
        assert_eq!(stream.tracks[0].kind, TrackKind::Audio);

        assert!(stream.remove_track("t1"));
        assert!(!stream.remove_track("t1"));
    }

    #[test]
    fn notice_wire_shape() {
        let notice = MediaNotice::AddTrack {
            stream: MediaStream::new("cam"),
            track: track("t1", TrackKind::Video),
        };
        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(json["op"], "add_track");
        assert_eq!(json["track"]["kind"], "video");
    }
}
