use serde::{Deserialize, Serialize};

/// Where the bytes of a track live.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MediaSource {
    /// File on the local media root.
    #[default]
    Local,
    /// File hosted in the user's Dropbox.
    Dropbox,
}

impl MediaSource {
    /// Value stored in the `tracks.source` column.
    pub fn as_str(self) -> &'static str {
        match self {
            MediaSource::Local => "local",
            MediaSource::Dropbox => "dropbox",
        }
    }

    /// Parse the `tracks.source` column value.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "local" => Some(MediaSource::Local),
            "dropbox" => Some(MediaSource::Dropbox),
            _ => None,
        }
    }
}

/// Artist row with its denormalized aggregates.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtistSummary {
    pub id: i64,
    pub title: String,
    pub album_count: i64,
    pub track_count: i64,
    /// Sum of the durations of the artist's tracks.
    pub total_duration_ms: i64,
    /// Sum of the playback counts of the artist's tracks.
    pub playback_count: i64,
}

/// Album row with its denormalized aggregates.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlbumSummary {
    pub id: i64,
    pub title: String,
    pub artist_id: i64,
    /// Album artist title.
    pub artist: String,
    pub year: Option<i32>,
    pub track_count: i64,
    pub total_duration_ms: i64,
    pub playback_count: i64,
    pub cover_art_path: Option<String>,
}

/// Track row joined with its artist, album and genre titles.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackSummary {
    pub id: i64,
    /// Absolute path for local tracks, `dropbox:` URI for remote ones.
    pub uri: String,
    pub source: MediaSource,
    pub file_name: String,
    pub title: Option<String>,
    pub artist_id: i64,
    pub artist: String,
    pub album_id: i64,
    pub album: String,
    pub genre: Option<String>,
    pub track_number: Option<u32>,
    pub disc_number: Option<u32>,
    pub year: Option<i32>,
    pub duration_ms: i64,
    pub format: Option<String>,
    pub playback_count: i64,
    pub last_played_ms: Option<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenreSummary {
    pub id: i64,
    pub name: String,
    pub track_count: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlaylistSummary {
    pub id: i64,
    pub name: String,
    pub track_count: i64,
    pub total_duration_ms: i64,
    pub created_ms: i64,
    pub updated_ms: i64,
}

/// Row counts across the whole library.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LibraryStats {
    pub artists: i64,
    pub albums: i64,
    pub tracks: i64,
    pub genres: i64,
    pub playlists: i64,
    pub total_duration_ms: i64,
}

/// Repeat behaviour applied when the queue runs out.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    #[default]
    Off,
    /// Replay the current track.
    One,
    /// Wrap around to the start of the queue.
    All,
}

impl RepeatMode {
    /// Next mode in the Off -> All -> One -> Off cycle.
    pub fn cycle(self) -> Self {
        match self {
            RepeatMode::Off => RepeatMode::All,
            RepeatMode::All => RepeatMode::One,
            RepeatMode::One => RepeatMode::Off,
        }
    }
}

/// Persisted playback queue and cursor.
///
/// `queue` holds track ids in play order. When shuffle is on,
/// `original_queue` keeps the order the queue had before shuffling so it
/// can be restored.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NowPlayingState {
    #[serde(default)]
    pub queue: Vec<i64>,
    #[serde(default)]
    pub original_queue: Vec<i64>,
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub position_ms: u64,
    #[serde(default)]
    pub shuffle: bool,
    #[serde(default)]
    pub repeat: RepeatMode,
    /// Wall-clock time of the last save (ms since epoch).
    #[serde(default)]
    pub saved_ms: i64,
}

/// Equalizer and effect settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EqualizerSettings {
    pub enabled: bool,
    /// Selected preset, `None` for a custom band layout.
    pub preset: Option<u16>,
    /// Per-band gain in millibels.
    pub band_levels: Vec<i16>,
    /// Bass boost strength, 0..=1000.
    pub bass_boost: u16,
    /// Virtualizer strength, 0..=1000.
    pub virtualizer: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_source_round_trips_column_value() {
        for source in [MediaSource::Local, MediaSource::Dropbox] {
            assert_eq!(MediaSource::parse(source.as_str()), Some(source));
        }
        assert_eq!(MediaSource::parse("ftp"), None);
    }

    #[test]
    fn repeat_mode_cycles_through_all_modes() {
        assert_eq!(RepeatMode::Off.cycle(), RepeatMode::All);
        assert_eq!(RepeatMode::All.cycle(), RepeatMode::One);
        assert_eq!(RepeatMode::One.cycle(), RepeatMode::Off);
    }

    #[test]
    fn now_playing_state_tolerates_missing_fields() {
        let state: NowPlayingState =
            serde_json::from_str(r#"{"queue":[3,1],"index":1}"#).expect("parse state");
        assert_eq!(state.queue, vec![3, 1]);
        assert_eq!(state.index, 1);
        assert_eq!(state.repeat, RepeatMode::Off);
        assert!(!state.shuffle);
    }
}
