//! Persisted playback queue (`now_playing.json`) and queue arithmetic.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use medialib_types::{NowPlayingState, RepeatMode};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::library_db::now_ms;

pub const NOW_PLAYING_FILE: &str = "now_playing.json";

/// `previous` restarts the current track instead past this point.
const RESTART_THRESHOLD_MS: u64 = 3_000;

/// Queue navigation over a [`NowPlayingState`].
pub trait QueueCursor {
    /// Replace the queue and start at `start` (clamped).
    fn set_queue<R: Rng + ?Sized>(&mut self, ids: Vec<i64>, start: usize, rng: &mut R);
    fn current(&self) -> Option<i64>;
    /// Move to the track that plays after the current one.
    fn advance(&mut self) -> Option<i64>;
    fn previous(&mut self) -> Option<i64>;
    fn set_shuffle<R: Rng + ?Sized>(&mut self, on: bool, rng: &mut R);
    fn cycle_repeat(&mut self) -> RepeatMode;
    fn set_position(&mut self, position_ms: u64);
    /// Drop ids not in `existing`; returns how many entries were removed.
    fn retain_existing(&mut self, existing: &HashSet<i64>) -> usize;
}

impl QueueCursor for NowPlayingState {
    fn set_queue<R: Rng + ?Sized>(&mut self, ids: Vec<i64>, start: usize, rng: &mut R) {
        self.index = if ids.is_empty() { 0 } else { start.min(ids.len() - 1) };
        self.original_queue = ids.clone();
        self.queue = ids;
        self.position_ms = 0;
        if self.shuffle {
            shuffle_keeping_current(self, rng);
        }
    }

    fn current(&self) -> Option<i64> {
        self.queue.get(self.index).copied()
    }

    fn advance(&mut self) -> Option<i64> {
        if self.queue.is_empty() {
            return None;
        }
        self.position_ms = 0;
        match self.repeat {
            RepeatMode::One => {}
            RepeatMode::All => self.index = (self.index + 1) % self.queue.len(),
            RepeatMode::Off => {
                if self.index + 1 >= self.queue.len() {
                    return None;
                }
                self.index += 1;
            }
        }
        self.current()
    }

    fn previous(&mut self) -> Option<i64> {
        if self.queue.is_empty() {
            return None;
        }
        if self.position_ms <= RESTART_THRESHOLD_MS {
            if self.index > 0 {
                self.index -= 1;
            } else if self.repeat == RepeatMode::All {
                self.index = self.queue.len() - 1;
            }
        }
        self.position_ms = 0;
        self.current()
    }

    fn set_shuffle<R: Rng + ?Sized>(&mut self, on: bool, rng: &mut R) {
        if on == self.shuffle {
            return;
        }
        self.shuffle = on;
        if on {
            self.original_queue = self.queue.clone();
            shuffle_keeping_current(self, rng);
        } else {
            let current = self.current();
            self.queue = std::mem::take(&mut self.original_queue);
            self.original_queue = self.queue.clone();
            self.index = current
                .and_then(|id| self.queue.iter().position(|&queued| queued == id))
                .unwrap_or(0);
        }
    }

    fn cycle_repeat(&mut self) -> RepeatMode {
        self.repeat = self.repeat.cycle();
        self.repeat
    }

    fn set_position(&mut self, position_ms: u64) {
        self.position_ms = position_ms;
    }

    fn retain_existing(&mut self, existing: &HashSet<i64>) -> usize {
        let before = self.queue.len();
        let current = self.current();
        let removed_before_index = self.queue[..self.index.min(before)]
            .iter()
            .filter(|id| !existing.contains(id))
            .count();

        self.queue.retain(|id| existing.contains(id));
        self.original_queue.retain(|id| existing.contains(id));

        if self.queue.is_empty() {
            self.index = 0;
            self.position_ms = 0;
        } else if current.is_some_and(|id| existing.contains(&id)) {
            self.index -= removed_before_index;
        } else {
            self.index = (self.index - removed_before_index).min(self.queue.len() - 1);
            self.position_ms = 0;
        }
        before - self.queue.len()
    }
}

/// Shuffle the queue with the current track moved to the front.
fn shuffle_keeping_current<R: Rng + ?Sized>(state: &mut NowPlayingState, rng: &mut R) {
    let Some(current) = state.current() else {
        return;
    };
    let mut rest: Vec<i64> = state
        .queue
        .iter()
        .enumerate()
        .filter(|(pos, _)| *pos != state.index)
        .map(|(_, id)| *id)
        .collect();
    rest.shuffle(rng);
    state.queue = std::iter::once(current).chain(rest).collect();
    state.index = 0;
}

fn same_entries(a: &[i64], b: &[i64]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort_unstable();
    b.sort_unstable();
    a == b
}

/// JSON file holding the now-playing state.
#[derive(Clone, Debug)]
pub struct NowPlayingStore {
    path: PathBuf,
}

impl NowPlayingStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(NOW_PLAYING_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing files load as the default state; unreadable JSON is logged
    /// and replaced by the default.
    pub fn load(&self) -> Result<NowPlayingState> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(NowPlayingState::default());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read now playing {:?}", self.path));
            }
        };
        let mut state: NowPlayingState = match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "discarding corrupt now playing state");
                return Ok(NowPlayingState::default());
            }
        };
        if state.index >= state.queue.len() {
            state.index = 0;
        }
        if !state.shuffle || !same_entries(&state.original_queue, &state.queue) {
            state.original_queue = state.queue.clone();
        }
        Ok(state)
    }

    /// Write through a temp file so readers never see a partial document.
    pub fn save(&self, state: &mut NowPlayingState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create data dir {:?}", parent))?;
        }
        state.saved_ms = now_ms();
        let json = serde_json::to_string_pretty(state).context("serialize now playing")?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).with_context(|| format!("write {:?}", tmp))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replace now playing {:?}", self.path))?;
        tracing::debug!(path = %self.path.display(), queue = state.queue.len(), "saved now playing");
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove now playing {:?}", self.path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn queued(ids: &[i64], start: usize) -> NowPlayingState {
        let mut state = NowPlayingState::default();
        state.set_queue(ids.to_vec(), start, &mut rng());
        state
    }

    fn temp_store(label: &str) -> NowPlayingStore {
        let dir = std::env::temp_dir().join(format!(
            "medialib-now-playing-{label}-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        NowPlayingStore::new(&dir)
    }

    #[test]
    fn advance_honours_repeat_modes() {
        let mut state = queued(&[1, 2, 3], 2);
        assert_eq!(state.advance(), None);
        assert_eq!(state.current(), Some(3));

        state.repeat = RepeatMode::All;
        assert_eq!(state.advance(), Some(1));

        state.repeat = RepeatMode::One;
        assert_eq!(state.advance(), Some(1));
        assert_eq!(state.advance(), Some(1));
    }

    #[test]
    fn previous_restarts_late_in_track() {
        let mut state = queued(&[1, 2, 3], 1);
        state.set_position(10_000);
        assert_eq!(state.previous(), Some(2));
        assert_eq!(state.position_ms, 0);
        assert_eq!(state.previous(), Some(1));
        assert_eq!(state.previous(), Some(1));

        state.repeat = RepeatMode::All;
        assert_eq!(state.previous(), Some(3));
    }

    #[test]
    fn set_queue_clamps_start() {
        let state = queued(&[4, 5], 9);
        assert_eq!(state.current(), Some(5));
        let empty = queued(&[], 3);
        assert_eq!(empty.current(), None);
    }

    #[test]
    fn shuffle_keeps_current_first_and_restores_order() {
        let ids: Vec<i64> = (1..=20).collect();
        let mut state = queued(&ids, 4);
        state.set_shuffle(true, &mut rng());

        assert_eq!(state.index, 0);
        assert_eq!(state.current(), Some(5));
        let mut sorted = state.queue.clone();
        sorted.sort();
        assert_eq!(sorted, ids);

        state.advance();
        let playing = state.current().expect("current");
        state.set_shuffle(false, &mut rng());
        assert_eq!(state.queue, ids);
        assert_eq!(state.current(), Some(playing));
    }

    #[test]
    fn set_queue_while_shuffled_shuffles_new_queue() {
        let mut state = NowPlayingState {
            shuffle: true,
            ..NowPlayingState::default()
        };
        let ids: Vec<i64> = (10..30).collect();
        state.set_queue(ids.clone(), 3, &mut rng());
        assert_eq!(state.current(), Some(13));
        assert_eq!(state.original_queue, ids);
    }

    #[test]
    fn retain_existing_tracks_current_entry() {
        let mut state = queued(&[1, 2, 3, 4, 5], 3);
        let removed = state.retain_existing(&HashSet::from([1, 3, 4, 5]));
        assert_eq!(removed, 1);
        assert_eq!(state.current(), Some(4));

        state.set_position(1234);
        state.retain_existing(&HashSet::from([1, 3]));
        assert_eq!(state.queue, vec![1, 3]);
        assert_eq!(state.current(), Some(3));
        assert_eq!(state.position_ms, 0);

        state.retain_existing(&HashSet::new());
        assert_eq!(state.current(), None);
    }

    #[test]
    fn cycle_repeat_walks_modes() {
        let mut state = NowPlayingState::default();
        assert_eq!(state.cycle_repeat(), RepeatMode::All);
        assert_eq!(state.cycle_repeat(), RepeatMode::One);
        assert_eq!(state.cycle_repeat(), RepeatMode::Off);
    }

    #[test]
    fn store_round_trips_and_tolerates_missing_or_corrupt_files() {
        let store = temp_store("roundtrip");
        assert_eq!(store.load().expect("missing"), NowPlayingState::default());

        let mut state = queued(&[7, 8, 9], 1);
        state.set_position(4200);
        state.repeat = RepeatMode::All;
        store.save(&mut state).expect("save");
        assert!(state.saved_ms > 0);
        assert_eq!(store.load().expect("load"), state);

        std::fs::write(store.path(), b"{not json").expect("corrupt");
        assert_eq!(store.load().expect("corrupt"), NowPlayingState::default());

        store.clear().expect("clear");
        store.clear().expect("clear missing");
        assert!(!store.path().exists());
    }

    #[test]
    fn load_repairs_shuffled_state_without_original_order() {
        let store = temp_store("shuffle-repair");
        std::fs::create_dir_all(store.path().parent().expect("parent")).expect("dir");
        std::fs::write(store.path(), r#"{"queue":[3,1,2],"index":1,"shuffle":true}"#).expect("write");

        let mut state = store.load().expect("load");
        assert_eq!(state.original_queue, vec![3, 1, 2]);
        state.set_shuffle(false, &mut rng());
        assert_eq!(state.queue, vec![3, 1, 2]);
        assert_eq!(state.current(), Some(1));

        std::fs::write(
            store.path(),
            r#"{"queue":[3,1,2],"original_queue":[1,2,3,4],"index":0,"shuffle":true}"#,
        )
        .expect("write mismatched");
        assert_eq!(store.load().expect("load").original_queue, vec![3, 1, 2]);

        std::fs::write(
            store.path(),
            r#"{"queue":[3,1,2],"original_queue":[1,2,3],"index":0,"shuffle":true}"#,
        )
        .expect("write consistent");
        assert_eq!(store.load().expect("load").original_queue, vec![1, 2, 3]);
    }

    #[test]
    fn load_clamps_out_of_range_index() {
        let store = temp_store("clamp");
        std::fs::create_dir_all(store.path().parent().expect("parent")).expect("dir");
        std::fs::write(store.path(), r#"{"queue":[1,2],"index":5}"#).expect("write");
        let state = store.load().expect("load");
        assert_eq!(state.index, 0);
        assert_eq!(state.original_queue, vec![1, 2]);
    }
}
