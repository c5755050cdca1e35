//! Music library store: artists, albums and tracks with denormalized
//! duration and playback aggregates, plus playlists, the persisted
//! now-playing queue and equalizer settings.

pub mod album_dao;
pub mod artist_dao;
pub mod config;
pub mod equalizer;
pub mod events;
pub mod genre_dao;
pub mod library;
pub mod library_db;
pub mod library_service;
pub mod now_playing;
pub mod playlist_dao;
pub mod track_dao;
pub mod watcher;

pub use library_db::LibraryDb;
pub use library_service::LibraryService;
