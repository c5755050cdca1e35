use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use medialib::config::{self, LibraryConfig};
use medialib::equalizer;
use medialib::events::EventBus;
use medialib::library_service::{self, LibraryService};
use medialib::now_playing::{NowPlayingStore, QueueCursor};
use medialib::track_dao::TrackFilter;
use medialib::{watcher, LibraryDb};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "medialib", version)]
struct Args {
    /// Optional config file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Media library root directory
    #[arg(long, global = true)]
    media_dir: Option<PathBuf>,

    /// Library database file
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan the media root and sync the library
    Scan,
    /// Scan once, then keep the library in sync with the media root
    Watch,
    Artists {
        #[arg(long)]
        search: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    Albums {
        /// Only albums of this album artist id
        #[arg(long)]
        artist: Option<i64>,
        #[arg(long)]
        search: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    Tracks {
        #[arg(long)]
        album: Option<i64>,
        #[arg(long)]
        artist: Option<i64>,
        #[arg(long)]
        genre: Option<i64>,
        #[arg(long)]
        search: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    Genres,
    Stats,
    /// Count one playback of a track
    Played { track_id: i64 },
    /// Most played tracks
    Top {
        #[arg(long, default_value_t = 25)]
        limit: i64,
    },
    /// Most recently added tracks
    Recent {
        #[arg(long, default_value_t = 25)]
        limit: i64,
    },
    DeleteTrack { track_id: i64 },
    /// Edit album title, album artist or year
    UpdateAlbum {
        album_id: i64,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        artist: Option<String>,
        #[arg(long)]
        year: Option<i32>,
    },
    /// Merge duplicate artists and albums
    Dedupe,
    /// Report aggregate drift, orphans and duplicates
    Check,
    /// Merge duplicates, re-sum aggregates and prune orphans
    Repair,
    /// Import Dropbox-hosted tracks from a JSON manifest
    ImportRemote {
        manifest: PathBuf,
        /// Delete Dropbox tracks missing from the manifest
        #[arg(long)]
        prune: bool,
    },
    Playlist {
        #[command(subcommand)]
        action: PlaylistCommand,
    },
    NowPlaying {
        #[command(subcommand)]
        action: NowPlayingCommand,
    },
    Equalizer {
        #[command(subcommand)]
        action: EqualizerCommand,
    },
}

#[derive(Subcommand, Debug)]
enum PlaylistCommand {
    Create { name: String },
    Rename { id: i64, name: String },
    Delete { id: i64 },
    Add { id: i64, track_ids: Vec<i64> },
    Remove { id: i64, track_id: i64 },
    /// Move the entry at position FROM to position TO (0-based)
    Move { id: i64, from: i64, to: i64 },
    Show { id: i64 },
    List,
}

#[derive(Subcommand, Debug)]
enum NowPlayingCommand {
    Show,
    /// Replace the queue with tracks, an album or a playlist
    Queue {
        track_ids: Vec<i64>,
        #[arg(long)]
        album: Option<i64>,
        #[arg(long)]
        playlist: Option<i64>,
        #[arg(long, default_value_t = 0)]
        start: usize,
    },
    Next,
    Previous,
    Shuffle {
        #[arg(action = clap::ArgAction::Set)]
        on: bool,
    },
    /// Cycle repeat off -> all -> one
    Repeat,
    Seek { position_ms: u64 },
    Clear,
}

#[derive(Subcommand, Debug)]
enum EqualizerCommand {
    Show,
    Set {
        #[arg(long)]
        enabled: Option<bool>,
        /// Built-in preset name
        #[arg(long)]
        preset: Option<String>,
        /// Band index (0-based) to change, used with --level
        #[arg(long, requires = "level")]
        band: Option<usize>,
        /// Band gain in millibels
        #[arg(long, allow_hyphen_values = true)]
        level: Option<i16>,
        #[arg(long)]
        bass_boost: Option<u16>,
        #[arg(long)]
        virtualizer: Option<u16>,
    },
    /// Print the platform effect settings strings
    Export,
    /// Apply one or more effect settings strings
    Import { settings: Vec<String> },
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,medialib=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let (cfg, cfg_path) = config::load_config(args.config.as_ref())?;
    let paths = Paths::resolve(&args, &cfg);

    match args.command {
        Command::Scan => {
            let service = paths.service(&cfg)?;
            print_json(&service.scan()?)
        }
        Command::Watch => run_watch(&paths, &cfg),
        Command::Artists { search, limit, offset } => {
            print_json(&paths.db()?.list_artists(search.as_deref(), limit, offset)?)
        }
        Command::Albums { artist, search, limit, offset } => {
            print_json(&paths.db()?.list_albums(artist, search.as_deref(), limit, offset)?)
        }
        Command::Tracks { album, artist, genre, search, limit, offset } => {
            let filter = TrackFilter {
                album_id: album,
                artist_id: artist,
                genre_id: genre,
                search,
                limit,
                offset,
            };
            print_json(&paths.db()?.list_tracks(&filter)?)
        }
        Command::Genres => print_json(&paths.db()?.list_genres()?),
        Command::Stats => print_json(&paths.db()?.stats()?),
        Command::Played { track_id } => {
            let db = paths.db()?;
            if !db.record_playback(track_id)? {
                return Err(anyhow::anyhow!("track {track_id} not found"));
            }
            print_json(&db.track_by_id(track_id)?)
        }
        Command::Top { limit } => print_json(&paths.db()?.most_played(limit)?),
        Command::Recent { limit } => print_json(&paths.db()?.recently_added(limit)?),
        Command::DeleteTrack { track_id } => {
            let deleted = paths
                .db()?
                .delete_track(track_id)?
                .ok_or_else(|| anyhow::anyhow!("track {track_id} not found"))?;
            print_json(&deleted)
        }
        Command::UpdateAlbum { album_id, title, artist, year } => {
            let db = paths.db()?;
            let target = db
                .update_album(album_id, title.as_deref(), artist.as_deref(), year)?
                .ok_or_else(|| anyhow::anyhow!("album {album_id} not found"))?;
            print_json(&db.album_by_id(target)?)
        }
        Command::Dedupe => print_json(&paths.db()?.merge_all_duplicates()?),
        Command::Check => {
            let issues = paths.db()?.check_integrity()?;
            if !issues.is_empty() {
                tracing::warn!(count = issues.len(), "library integrity issues found");
            }
            print_json(&issues)
        }
        Command::Repair => {
            let db = paths.db()?;
            let merged = db.merge_all_duplicates()?;
            db.recompute_aggregates()?;
            let pruned = db.prune_orphans()?;
            let remaining = db.check_integrity()?;
            print_json(&serde_json::json!({
                "merged": merged,
                "pruned": pruned,
                "remaining_issues": remaining,
            }))
        }
        Command::ImportRemote { manifest, prune } => {
            let tracks = library_service::load_remote_manifest(&manifest)?;
            let service = paths.service(&cfg)?;
            print_json(&service.import_remote(&tracks, prune)?)
        }
        Command::Playlist { action } => run_playlist(&paths.db()?, action),
        Command::NowPlaying { action } => run_now_playing(&paths, action),
        Command::Equalizer { action } => run_equalizer(&cfg, cfg_path.as_ref(), action),
    }
}

/// Media root, database and data dir resolved from flags over config.
struct Paths {
    media_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    data_dir: Option<PathBuf>,
}

impl Paths {
    fn resolve(args: &Args, cfg: &LibraryConfig) -> Self {
        let media_dir = args
            .media_dir
            .clone()
            .or_else(|| config::media_dir_from_config(cfg).ok());
        let db_path = args.db.clone().or_else(|| {
            media_dir
                .as_deref()
                .map(|media| config::db_path_from_config(cfg, media))
        });
        let data_dir = media_dir
            .as_deref()
            .map(|media| config::data_dir_from_config(cfg, media));
        Self {
            media_dir,
            db_path,
            data_dir,
        }
    }

    fn media_dir(&self) -> Result<&PathBuf> {
        self.media_dir
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("media_dir is required; set it in config or pass --media-dir"))
    }

    fn data_dir(&self) -> Result<&PathBuf> {
        self.data_dir
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("data dir unknown; set media_dir or data_dir"))
    }

    fn db(&self) -> Result<LibraryDb> {
        let path = self
            .db_path
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("database path unknown; pass --db or --media-dir"))?;
        LibraryDb::open(path).with_context(|| format!("open library db {:?}", path))
    }

    fn service(&self, cfg: &LibraryConfig) -> Result<LibraryService> {
        let media_dir = self.media_dir()?;
        let service = LibraryService::new(
            self.db()?,
            media_dir,
            config::scan_options_from_config(cfg),
            EventBus::new(),
        )?;
        Ok(service.with_covers_dir(self.data_dir()?.join("covers")))
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{json}");
    Ok(())
}

fn run_watch(paths: &Paths, cfg: &LibraryConfig) -> Result<()> {
    let service = paths.service(cfg)?;
    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })
    .context("install ctrl-c handler")?;

    let mut events = service.events().subscribe();
    std::thread::spawn(move || loop {
        match events.blocking_recv() {
            Ok(event) => {
                if let Ok(line) = serde_json::to_string(&event) {
                    println!("{line}");
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event printer lagged");
            }
            Err(RecvError::Closed) => break,
        }
    });

    let report = service.scan()?;
    tracing::info!(
        inserted = report.inserted,
        updated = report.updated,
        removed = report.removed,
        "initial scan complete"
    );
    watcher::watch_library(&service, config::debounce_from_config(cfg), shutdown_rx)
}

fn run_playlist(db: &LibraryDb, action: PlaylistCommand) -> Result<()> {
    match action {
        PlaylistCommand::Create { name } => {
            let id = db.create_playlist(&name)?;
            print_json(&db.playlist_by_id(id)?)
        }
        PlaylistCommand::Rename { id, name } => {
            require(db.rename_playlist(id, &name)?, "playlist", id)?;
            print_json(&db.playlist_by_id(id)?)
        }
        PlaylistCommand::Delete { id } => {
            require(db.delete_playlist(id)?, "playlist", id)?;
            print_json(&serde_json::json!({ "deleted": id }))
        }
        PlaylistCommand::Add { id, track_ids } => {
            let added = db.add_tracks_to_playlist(id, &track_ids)?;
            print_json(&serde_json::json!({ "added": added, "playlist": db.playlist_by_id(id)? }))
        }
        PlaylistCommand::Remove { id, track_id } => {
            require(db.remove_track_from_playlist(id, track_id)?, "playlist entry", track_id)?;
            print_json(&db.playlist_tracks(id)?)
        }
        PlaylistCommand::Move { id, from, to } => {
            if !db.move_playlist_track(id, from, to)? {
                return Err(anyhow::anyhow!("positions {from} -> {to} out of range"));
            }
            print_json(&db.playlist_tracks(id)?)
        }
        PlaylistCommand::Show { id } => {
            let playlist = db
                .playlist_by_id(id)?
                .ok_or_else(|| anyhow::anyhow!("playlist {id} not found"))?;
            print_json(&serde_json::json!({
                "playlist": playlist,
                "tracks": db.playlist_tracks(id)?,
            }))
        }
        PlaylistCommand::List => print_json(&db.list_playlists()?),
    }
}

fn require(found: bool, what: &str, id: i64) -> Result<()> {
    if found {
        Ok(())
    } else {
        Err(anyhow::anyhow!("{what} {id} not found"))
    }
}

fn run_now_playing(paths: &Paths, action: NowPlayingCommand) -> Result<()> {
    let store = NowPlayingStore::new(paths.data_dir()?);
    let db = paths.db()?;
    let mut state = store.load()?;
    let existing: HashSet<i64> = db.existing_track_ids(&state.queue)?;
    let dropped = state.retain_existing(&existing);
    if dropped > 0 {
        tracing::info!(dropped, "dropped deleted tracks from queue");
    }
    let mut rng = rand::rng();

    match action {
        NowPlayingCommand::Show => {}
        NowPlayingCommand::Queue { track_ids, album, playlist, start } => {
            let ids = match (album, playlist) {
                (Some(album_id), _) => db
                    .list_tracks(&TrackFilter {
                        album_id: Some(album_id),
                        ..TrackFilter::default()
                    })?
                    .into_iter()
                    .map(|track| track.id)
                    .collect(),
                (None, Some(playlist_id)) => db
                    .playlist_tracks(playlist_id)?
                    .into_iter()
                    .map(|track| track.id)
                    .collect(),
                (None, None) => {
                    let found = db.existing_track_ids(&track_ids)?;
                    track_ids.into_iter().filter(|id| found.contains(id)).collect()
                }
            };
            state.set_queue(ids, start, &mut rng);
        }
        NowPlayingCommand::Next => {
            if state.advance().is_none() {
                tracing::info!("end of queue");
            }
        }
        NowPlayingCommand::Previous => {
            state.previous();
        }
        NowPlayingCommand::Shuffle { on } => state.set_shuffle(on, &mut rng),
        NowPlayingCommand::Repeat => {
            state.cycle_repeat();
        }
        NowPlayingCommand::Seek { position_ms } => state.set_position(position_ms),
        NowPlayingCommand::Clear => {
            store.clear()?;
            return print_json(&serde_json::json!({ "cleared": true }));
        }
    }

    store.save(&mut state)?;
    let current = match state.current() {
        Some(id) => db.track_by_id(id)?,
        None => None,
    };
    print_json(&serde_json::json!({ "state": state, "current": current }))
}

fn run_equalizer(cfg: &LibraryConfig, cfg_path: Option<&PathBuf>, action: EqualizerCommand) -> Result<()> {
    let mut settings = config::equalizer_from_config(cfg);
    match action {
        EqualizerCommand::Show => return print_json(&settings),
        EqualizerCommand::Export => {
            return print_json(&serde_json::json!({
                "equalizer": equalizer::to_settings_string(&settings),
                "bass_boost": equalizer::bass_boost_string(&settings),
                "virtualizer": equalizer::virtualizer_string(&settings),
            }));
        }
        EqualizerCommand::Set { enabled, preset, band, level, bass_boost, virtualizer } => {
            if let Some(enabled) = enabled {
                settings.enabled = enabled;
            }
            if let Some(name) = preset {
                let index = equalizer::preset_index(&name)
                    .ok_or_else(|| anyhow::anyhow!("unknown equalizer preset {name:?}"))?;
                equalizer::apply_preset(&mut settings, index)?;
            }
            if let (Some(band), Some(level)) = (band, level) {
                equalizer::set_band_level(&mut settings, band, level)?;
            }
            if let Some(strength) = bass_boost {
                settings.bass_boost = equalizer::clamp_strength(strength);
            }
            if let Some(strength) = virtualizer {
                settings.virtualizer = equalizer::clamp_strength(strength);
            }
        }
        EqualizerCommand::Import { settings: raw } => {
            for entry in &raw {
                equalizer::apply_effect_string(&mut settings, entry)?;
            }
        }
    }

    let path = cfg_path
        .ok_or_else(|| anyhow::anyhow!("saving equalizer settings needs a config file; pass --config"))?;
    config::update_equalizer_settings(path, &settings)?;
    print_json(&settings)
}
