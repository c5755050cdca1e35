//! Media root scanning.
//!
//! Walks the media root depth-first, probes each supported file with
//! symphonia and hands the tags plus filesystem metadata to a callback.

use std::ffi::OsStr;
use std::fs::{self, File};
use std::path::Path;

use anyhow::{Context, Result};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, MetadataRevision, StandardTagKey, StandardVisualKey};
use symphonia::core::probe::Hint;

use crate::library_db::VARIOUS_ARTISTS;

pub const DEFAULT_EXTENSIONS: &[&str] = &[
    "flac", "wav", "aiff", "aif", "mp3", "m4a", "aac", "alac", "ogg", "oga", "opus",
];

#[derive(Clone, Debug)]
pub struct ScanOptions {
    /// Lowercase extensions without the dot.
    pub extensions: Vec<String>,
    /// Files with a known duration below this are skipped.
    pub min_duration_ms: u64,
    pub follow_symlinks: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            extensions: DEFAULT_EXTENSIONS.iter().map(|ext| ext.to_string()).collect(),
            min_duration_ms: 0,
            follow_symlinks: false,
        }
    }
}

impl ScanOptions {
    pub fn is_supported(&self, ext: &str) -> bool {
        let ext = ext.to_ascii_lowercase();
        self.extensions.iter().any(|known| *known == ext)
    }

    pub fn is_supported_path(&self, path: &Path) -> bool {
        path.extension()
            .and_then(OsStr::to_str)
            .is_some_and(|ext| self.is_supported(ext))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub dirs: usize,
    pub files: usize,
    pub skipped: usize,
}

#[derive(Clone, Debug, Default)]
pub struct TrackMeta {
    pub duration_ms: Option<u64>,
    pub sample_rate: Option<u32>,
    pub album: Option<String>,
    pub artist: Option<String>,
    pub album_artist: Option<String>,
    pub compilation: bool,
    pub title: Option<String>,
    pub genre: Option<String>,
    pub track_number: Option<u32>,
    pub disc_number: Option<u32>,
    pub year: Option<i32>,
    pub format: Option<String>,
    pub cover_art: Option<CoverArt>,
}

/// Embedded picture bytes, stored as-is.
#[derive(Clone, Debug)]
pub struct CoverArt {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl CoverArt {
    pub fn extension(&self) -> &'static str {
        match self.mime_type.as_str() {
            "image/png" => "png",
            "image/webp" => "webp",
            "image/gif" => "gif",
            _ => "jpg",
        }
    }
}

const MAX_COVER_ART_BYTES: usize = 5_000_000;

/// Progress reported around each directory that holds supported files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirProgress {
    Start,
    /// Files handed to the track callback; skipped files are not counted.
    Finish { tracks: usize },
}

/// Scan `root`, invoking `on_track` per kept file and `on_dir` around each
/// directory holding supported files.
pub fn scan_library_with_meta<F, D>(
    root: &Path,
    options: &ScanOptions,
    mut on_track: F,
    mut on_dir: D,
) -> Result<ScanSummary>
where
    F: FnMut(&Path, &str, &TrackMeta, &fs::Metadata),
    D: FnMut(&Path, DirProgress),
{
    let root = root
        .canonicalize()
        .with_context(|| format!("canonicalize root {:?}", root))?;
    if !root.is_dir() {
        return Err(anyhow::anyhow!("root is not a directory: {:?}", root));
    }

    tracing::info!(root = %root.display(), "scanning library");
    let mut summary = ScanSummary::default();
    scan_dir(&root, &root, options, &mut summary, &mut on_track, &mut on_dir)?;
    tracing::info!(
        root = %root.display(),
        dirs = summary.dirs,
        files = summary.files,
        skipped = summary.skipped,
        "library scan complete"
    );
    Ok(summary)
}

fn scan_dir<F, D>(
    root: &Path,
    dir: &Path,
    options: &ScanOptions,
    summary: &mut ScanSummary,
    on_track: &mut F,
    on_dir: &mut D,
) -> Result<()>
where
    F: FnMut(&Path, &str, &TrackMeta, &fs::Metadata),
    D: FnMut(&Path, DirProgress),
{
    let mut dirs = Vec::new();
    let mut files = Vec::new();

    for entry in fs::read_dir(dir).with_context(|| format!("read_dir {:?}", dir))? {
        let entry = entry.context("read_dir entry")?;
        let path = entry.path();
        if is_hidden(&path) {
            continue;
        }
        let file_type = entry.file_type().context("read_dir entry type")?;
        if file_type.is_symlink() && !options.follow_symlinks {
            continue;
        }
        if path.is_dir() {
            dirs.push(path);
        } else if path.is_file() && options.is_supported_path(&path) {
            if !file_type.is_symlink() {
                files.push(path);
                continue;
            }
            // Linked files are stored under their target, which must sit inside the root.
            let target = path
                .canonicalize()
                .with_context(|| format!("canonicalize {:?}", path))?;
            if target.starts_with(root) && options.is_supported_path(&target) {
                files.push(target);
            } else {
                tracing::debug!(path = %path.display(), "skipping link outside library root");
            }
        }
    }

    dirs.sort_by_key(|path| sort_name(path));
    files.sort_by(|a, b| sort_name(a).cmp(&sort_name(b)).then_with(|| a.cmp(b)));
    files.dedup();

    if !files.is_empty() {
        summary.dirs += 1;
        on_dir(dir, DirProgress::Start);
        let mut kept = 0;
        for path in &files {
            let fs_meta = match fs::metadata(path) {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            let meta = probe_track(path)?;
            if meta
                .duration_ms
                .is_some_and(|duration| duration < options.min_duration_ms)
            {
                tracing::debug!(path = %path.display(), "skipping short file");
                summary.skipped += 1;
                continue;
            }
            let file_name = path
                .file_name()
                .and_then(OsStr::to_str)
                .unwrap_or("<unknown>");
            on_track(path, file_name, &meta, &fs_meta);
            summary.files += 1;
            kept += 1;
        }
        on_dir(dir, DirProgress::Finish { tracks: kept });
    }

    for path in dirs {
        let canon = path
            .canonicalize()
            .with_context(|| format!("canonicalize {:?}", path))?;
        // Links leading out of the root, or back into an ancestor, are not walked.
        if canon.starts_with(root) && !dir.starts_with(&canon) {
            scan_dir(root, &canon, options, summary, on_track, on_dir)?;
        }
    }

    Ok(())
}

fn sort_name(path: &Path) -> String {
    path.file_name()
        .and_then(OsStr::to_str)
        .unwrap_or("")
        .to_lowercase()
}

pub(crate) fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(OsStr::to_str)
        .is_some_and(|name| name.starts_with('.'))
}

/// Probe tags and stream parameters of one file.
///
/// Files symphonia cannot read still yield a `TrackMeta` with the format
/// taken from the extension.
pub fn probe_track(path: &Path) -> Result<TrackMeta> {
    let ext = path
        .extension()
        .and_then(OsStr::to_str)
        .unwrap_or("")
        .to_ascii_lowercase();
    if ext.is_empty() {
        return Err(anyhow::anyhow!("file has no extension: {:?}", path));
    }
    Ok(probe_track_meta(path, &ext))
}

fn probe_track_meta(path: &Path, ext_hint: &str) -> TrackMeta {
    let mut meta = TrackMeta {
        format: Some(ext_hint.to_ascii_uppercase()),
        ..TrackMeta::default()
    };

    let file = match File::open(path) {
        Ok(file) => file,
        Err(_) => return meta,
    };
    let mut hint = Hint::new();
    hint.with_extension(ext_hint);

    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let mut probed = match symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    ) {
        Ok(probed) => probed,
        Err(err) => {
            tracing::debug!(path = %path.display(), error = %err, "probe failed");
            return meta;
        }
    };

    if let Some(track) = probed.format.default_track() {
        let params = &track.codec_params;
        meta.sample_rate = params.sample_rate;
        if let (Some(frames), Some(rate)) = (params.n_frames, params.sample_rate) {
            if rate > 0 {
                meta.duration_ms = Some(frames.saturating_mul(1000) / rate as u64);
            }
        }
    }

    // Tags may sit in the container (probed.metadata) or the format reader.
    if let Some(rev) = probed.format.metadata().current() {
        apply_revision(&mut meta, rev);
    }
    if let Some(rev) = probed.metadata.get().as_ref().and_then(|m| m.current()) {
        apply_revision(&mut meta, rev);
    }

    if meta.compilation {
        meta.album_artist = Some(VARIOUS_ARTISTS.to_string());
    } else if meta.album_artist.is_none() {
        meta.album_artist = meta.artist.clone();
    }

    meta
}

fn apply_revision(meta: &mut TrackMeta, rev: &MetadataRevision) {
    for tag in rev.tags() {
        let value = tag.value.to_string();
        match tag.std_key {
            Some(StandardTagKey::Album) => fill(&mut meta.album, || Some(value)),
            Some(StandardTagKey::AlbumArtist) => fill(&mut meta.album_artist, || Some(value)),
            Some(StandardTagKey::Artist) => fill(&mut meta.artist, || Some(value)),
            Some(StandardTagKey::TrackTitle) => fill(&mut meta.title, || Some(value)),
            Some(StandardTagKey::Genre) => fill(&mut meta.genre, || parse_genre_tag(&value)),
            Some(StandardTagKey::TrackNumber) => fill(&mut meta.track_number, || parse_u32_tag(&value)),
            Some(StandardTagKey::DiscNumber) => fill(&mut meta.disc_number, || parse_u32_tag(&value)),
            Some(StandardTagKey::Date) => fill(&mut meta.year, || parse_i32_tag(&value)),
            Some(StandardTagKey::Compilation) => {
                meta.compilation = meta.compilation || parse_bool_tag(&value);
            }
            _ => {}
        }
    }
    if meta.cover_art.is_none() {
        meta.cover_art = select_cover_art(rev);
    }
}

fn fill<T>(slot: &mut Option<T>, value: impl FnOnce() -> Option<T>) {
    if slot.is_none() {
        *slot = value();
    }
}

fn parse_u32_tag(raw: &str) -> Option<u32> {
    raw.split('/')
        .next()
        .and_then(|s| s.trim().parse::<u32>().ok())
}

fn parse_i32_tag(raw: &str) -> Option<i32> {
    raw.split('-')
        .next()
        .and_then(|s| s.trim().parse::<i32>().ok())
}

fn parse_bool_tag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y"
    )
}

/// ID3v1-style numeric genres (`(17)`) and blank values carry no usable name.
fn parse_genre_tag(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let numeric = trimmed
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
        .unwrap_or(trimmed);
    if trimmed.is_empty() || numeric.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(trimmed.to_string())
}

fn select_cover_art(rev: &MetadataRevision) -> Option<CoverArt> {
    let visual = rev
        .visuals()
        .iter()
        .find(|visual| visual.usage == Some(StandardVisualKey::FrontCover))
        .or_else(|| rev.visuals().first())?;
    if visual.data.len() > MAX_COVER_ART_BYTES {
        return None;
    }
    Some(CoverArt {
        mime_type: visual.media_type.clone(),
        data: visual.data.to_vec(),
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;

    /// Write a mono 16-bit PCM WAV of `duration_ms` silence at 8 kHz.
    pub(crate) fn write_pcm_wav(path: &Path, duration_ms: u32) {
        let sample_rate: u32 = 8_000;
        let frames = sample_rate * duration_ms / 1000;
        let data_len = frames * 2;
        let mut bytes = Vec::with_capacity(44 + data_len as usize);
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(b"fmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&sample_rate.to_le_bytes());
        bytes.extend_from_slice(&(sample_rate * 2).to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        bytes.resize(44 + data_len as usize, 0);
        std::fs::write(path, bytes).expect("write wav");
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::write_pcm_wav;
    use super::*;

    fn temp_root(label: &str) -> std::path::PathBuf {
        let root = std::env::temp_dir().join(format!(
            "medialib-scan-{label}-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&root).expect("create root");
        root
    }

    #[test]
    fn scan_options_match_extensions_case_insensitively() {
        let options = ScanOptions::default();
        assert!(options.is_supported("FLAC"));
        assert!(options.is_supported("opus"));
        assert!(!options.is_supported("txt"));
        assert!(options.is_supported_path(Path::new("/m/a.Mp3")));
        assert!(!options.is_supported_path(Path::new("/m/README")));
    }

    #[test]
    fn probe_sets_format_from_extension_for_unreadable_file() {
        let root = temp_root("probe");
        let track = root.join("song.flac");
        std::fs::write(&track, b"test").expect("write");

        let meta = probe_track(&track).expect("probe");
        assert_eq!(meta.format, Some("FLAC".to_string()));
        assert_eq!(meta.duration_ms, None);
        assert!(probe_track(&root.join("noext")).is_err());
    }

    #[test]
    fn scan_walks_sorted_and_skips_hidden_and_unsupported() {
        let root = temp_root("walk");
        std::fs::create_dir_all(root.join("b")).expect("b");
        std::fs::create_dir_all(root.join("A")).expect("A");
        std::fs::create_dir_all(root.join(".medialib")).expect("hidden dir");
        std::fs::write(root.join("b/2.flac"), b"x").expect("b/2");
        std::fs::write(root.join("b/1.mp3"), b"x").expect("b/1");
        std::fs::write(root.join("A/song.ogg"), b"x").expect("A/song");
        std::fs::write(root.join("A/cover.jpg"), b"x").expect("cover");
        std::fs::write(root.join(".medialib/x.flac"), b"x").expect("hidden file");

        let mut seen = Vec::new();
        let mut dir_events = Vec::new();
        let summary = scan_library_with_meta(
            &root,
            &ScanOptions::default(),
            |_path, file_name, _meta, _fs| seen.push(file_name.to_string()),
            |dir, progress| {
                let name = dir.file_name().and_then(OsStr::to_str).unwrap_or("").to_string();
                dir_events.push((name, progress));
            },
        )
        .expect("scan");

        assert_eq!(seen, vec!["song.ogg", "1.mp3", "2.flac"]);
        assert_eq!(
            dir_events,
            vec![
                ("A".to_string(), DirProgress::Start),
                ("A".to_string(), DirProgress::Finish { tracks: 1 }),
                ("b".to_string(), DirProgress::Start),
                ("b".to_string(), DirProgress::Finish { tracks: 2 })
            ]
        );
        assert_eq!(summary, ScanSummary { dirs: 2, files: 3, skipped: 0 });
    }

    #[test]
    fn scan_rejects_missing_root() {
        let root = temp_root("missing").join("nope");
        assert!(scan_library_with_meta(&root, &ScanOptions::default(), |_, _, _, _| {}, |_, _| {}).is_err());
    }

    #[test]
    fn probe_reads_wav_duration() {
        let root = temp_root("probe-wav");
        let track = root.join("tone.wav");
        write_pcm_wav(&track, 1000);
        let meta = probe_track(&track).expect("probe");
        assert_eq!(meta.duration_ms, Some(1000));
        assert_eq!(meta.sample_rate, Some(8_000));
    }

    #[test]
    fn scan_skips_short_files_and_keeps_unknown_durations() {
        let root = temp_root("min-duration");
        write_pcm_wav(&root.join("long.wav"), 1000);
        write_pcm_wav(&root.join("short.wav"), 10);
        std::fs::write(root.join("stub.flac"), b"not audio").expect("stub");
        let options = ScanOptions {
            min_duration_ms: 500,
            ..ScanOptions::default()
        };

        let mut seen = Vec::new();
        let mut progress = Vec::new();
        let summary = scan_library_with_meta(
            &root,
            &options,
            |_path, file_name, meta, _fs| seen.push((file_name.to_string(), meta.duration_ms)),
            |_dir, event| progress.push(event),
        )
        .expect("scan");

        assert_eq!(
            seen,
            vec![("long.wav".to_string(), Some(1000)), ("stub.flac".to_string(), None)]
        );
        assert_eq!(summary, ScanSummary { dirs: 1, files: 2, skipped: 1 });
        assert_eq!(progress, vec![DirProgress::Start, DirProgress::Finish { tracks: 2 }]);
    }

    #[test]
    fn directory_with_only_skipped_files_still_finishes() {
        let root = temp_root("all-skipped");
        std::fs::create_dir_all(root.join("shorts")).expect("shorts");
        write_pcm_wav(&root.join("shorts/blip.wav"), 10);
        let options = ScanOptions {
            min_duration_ms: 1000,
            ..ScanOptions::default()
        };

        let mut progress = Vec::new();
        let summary = scan_library_with_meta(&root, &options, |_, _, _, _| {}, |_dir, event| {
            progress.push(event)
        })
        .expect("scan");

        assert_eq!(summary.skipped, 1);
        assert_eq!(progress, vec![DirProgress::Start, DirProgress::Finish { tracks: 0 }]);
    }

    #[cfg(unix)]
    #[test]
    fn followed_file_links_must_resolve_inside_root() {
        let root = temp_root("links").canonicalize().expect("canonical root");
        let outside = temp_root("links-outside");
        std::fs::write(outside.join("secret.flac"), b"x").expect("outside file");
        std::fs::write(root.join("real.flac"), b"x").expect("real file");
        std::os::unix::fs::symlink(outside.join("secret.flac"), root.join("link.flac"))
            .expect("outside link");
        std::os::unix::fs::symlink(root.join("real.flac"), root.join("alias.flac"))
            .expect("inside link");
        let options = ScanOptions {
            follow_symlinks: true,
            ..ScanOptions::default()
        };

        let mut seen = Vec::new();
        scan_library_with_meta(&root, &options, |path, _, _, _| seen.push(path.to_path_buf()), |_, _| {})
            .expect("scan");
        assert_eq!(seen, vec![root.join("real.flac")]);

        let mut unfollowed = Vec::new();
        scan_library_with_meta(
            &root,
            &ScanOptions::default(),
            |path, _, _, _| unfollowed.push(path.to_path_buf()),
            |_, _| {},
        )
        .expect("scan without links");
        assert_eq!(unfollowed, vec![root.join("real.flac")]);
    }

    #[test]
    fn tag_parsers_handle_common_shapes() {
        assert_eq!(parse_u32_tag("3/12"), Some(3));
        assert_eq!(parse_u32_tag("x"), None);
        assert_eq!(parse_i32_tag("1994-05-01"), Some(1994));
        assert!(parse_bool_tag(" Yes "));
        assert!(!parse_bool_tag("0"));
        assert_eq!(parse_genre_tag("(17)"), None);
        assert_eq!(parse_genre_tag("  "), None);
        assert_eq!(parse_genre_tag(" Trip-Hop "), Some("Trip-Hop".to_string()));
    }

    #[test]
    fn cover_art_extension_follows_mime_type() {
        let art = |mime: &str| CoverArt {
            mime_type: mime.to_string(),
            data: Vec::new(),
        };
        assert_eq!(art("image/png").extension(), "png");
        assert_eq!(art("image/jpeg").extension(), "jpg");
    }
}
