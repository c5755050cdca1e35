//! Equalizer settings and their `Equalizer;curPreset=..;numBands=..` string
//! form, plus the `BassBoost;strength=..` / `Virtualizer;strength=..`
//! effect strings.

use anyhow::{anyhow, Context, Result};
use medialib_types::EqualizerSettings;

/// Band gains are kept within ±15 dB.
pub const MAX_LEVEL_MB: i16 = 1500;
pub const MAX_STRENGTH: u16 = 1000;
pub const DEFAULT_BANDS: usize = 5;
/// Upper bound on `numBands` accepted from a settings string.
pub const MAX_BANDS: usize = 32;

const EQUALIZER_PREFIX: &str = "Equalizer";
const BASS_BOOST_PREFIX: &str = "BassBoost";
const VIRTUALIZER_PREFIX: &str = "Virtualizer";
const CUSTOM_PRESET: i16 = -1;

/// Built-in five band presets, gains in millibels.
pub const PRESETS: &[(&str, [i16; DEFAULT_BANDS])] = &[
    ("Normal", [300, 0, 0, 0, 300]),
    ("Classical", [500, 300, -200, 400, 400]),
    ("Dance", [600, 0, 200, 400, 100]),
    ("Flat", [0, 0, 0, 0, 0]),
    ("Folk", [300, 0, 0, 200, -100]),
    ("Heavy Metal", [400, 100, 900, 300, 0]),
    ("Hip Hop", [500, 300, 0, 100, 300]),
    ("Jazz", [400, 200, -200, 200, 500]),
    ("Pop", [-100, 200, 500, 100, -200]),
    ("Rock", [500, 300, -100, 300, 500]),
];

pub fn default_settings() -> EqualizerSettings {
    EqualizerSettings {
        enabled: false,
        preset: None,
        band_levels: vec![0; DEFAULT_BANDS],
        bass_boost: 0,
        virtualizer: 0,
    }
}

pub fn preset_index(name: &str) -> Option<u16> {
    PRESETS
        .iter()
        .position(|(preset, _)| preset.eq_ignore_ascii_case(name.trim()))
        .map(|index| index as u16)
}

/// Select a built-in preset, replacing the band levels.
pub fn apply_preset(settings: &mut EqualizerSettings, index: u16) -> Result<()> {
    let (_, levels) = PRESETS
        .get(index as usize)
        .ok_or_else(|| anyhow!("unknown equalizer preset {index}"))?;
    settings.preset = Some(index);
    settings.band_levels = levels.to_vec();
    Ok(())
}

/// Set one band (0-based) and switch to a custom layout.
pub fn set_band_level(settings: &mut EqualizerSettings, band: usize, level_mb: i16) -> Result<()> {
    let slot = settings
        .band_levels
        .get_mut(band)
        .ok_or_else(|| anyhow!("band {band} out of range"))?;
    *slot = clamp_level(level_mb);
    settings.preset = None;
    Ok(())
}

pub fn clamp_level(level_mb: i16) -> i16 {
    level_mb.clamp(-MAX_LEVEL_MB, MAX_LEVEL_MB)
}

pub fn clamp_strength(strength: u16) -> u16 {
    strength.min(MAX_STRENGTH)
}

/// Clamp every value into range and drop a preset index that names no
/// built-in preset.
pub fn normalize(settings: &mut EqualizerSettings) {
    for level in settings.band_levels.iter_mut() {
        *level = clamp_level(*level);
    }
    settings.bass_boost = clamp_strength(settings.bass_boost);
    settings.virtualizer = clamp_strength(settings.virtualizer);
    if settings
        .preset
        .is_some_and(|index| index as usize >= PRESETS.len())
    {
        settings.preset = None;
    }
}

pub fn to_settings_string(settings: &EqualizerSettings) -> String {
    let preset = settings
        .preset
        .map(|index| index as i16)
        .unwrap_or(CUSTOM_PRESET);
    let mut out = format!(
        "{EQUALIZER_PREFIX};curPreset={preset};numBands={}",
        settings.band_levels.len()
    );
    for (band, level) in settings.band_levels.iter().enumerate() {
        out.push_str(&format!(";band{}Level={}", band + 1, level));
    }
    out
}

/// Parse an equalizer settings string into `(preset, band_levels)`.
pub fn parse_settings_string(raw: &str) -> Result<(Option<u16>, Vec<i16>)> {
    let fields = split_fields(raw, EQUALIZER_PREFIX)?;
    let preset: i16 = field(&fields, "curPreset")?;
    let num_bands: usize = field(&fields, "numBands")?;
    if num_bands > MAX_BANDS {
        return Err(anyhow!("numBands={num_bands} exceeds {MAX_BANDS}"));
    }
    let mut levels = Vec::with_capacity(num_bands);
    for band in 1..=num_bands {
        let level: i32 = field(&fields, &format!("band{band}Level"))?;
        levels.push(level.clamp(-(MAX_LEVEL_MB as i32), MAX_LEVEL_MB as i32) as i16);
    }
    let extra_bands = fields
        .iter()
        .filter(|(key, _)| key.starts_with("band") && key.ends_with("Level"))
        .count();
    if extra_bands != num_bands {
        return Err(anyhow!(
            "numBands={num_bands} but {extra_bands} band levels present"
        ));
    }
    let preset = u16::try_from(preset).ok();
    Ok((preset, levels))
}

/// Replace preset and bands of `settings` from an equalizer string.
pub fn apply_settings_string(settings: &mut EqualizerSettings, raw: &str) -> Result<()> {
    let (preset, levels) = parse_settings_string(raw)?;
    settings.preset = preset;
    settings.band_levels = levels;
    normalize(settings);
    Ok(())
}

pub fn bass_boost_string(settings: &EqualizerSettings) -> String {
    format!("{BASS_BOOST_PREFIX};strength={}", settings.bass_boost)
}

pub fn virtualizer_string(settings: &EqualizerSettings) -> String {
    format!("{VIRTUALIZER_PREFIX};strength={}", settings.virtualizer)
}

/// Apply any of the three effect strings, picked by their prefix.
pub fn apply_effect_string(settings: &mut EqualizerSettings, raw: &str) -> Result<()> {
    let prefix = raw.split(';').next().unwrap_or("").trim();
    match prefix {
        EQUALIZER_PREFIX => apply_settings_string(settings, raw),
        BASS_BOOST_PREFIX => {
            settings.bass_boost = parse_strength(raw, BASS_BOOST_PREFIX)?;
            Ok(())
        }
        VIRTUALIZER_PREFIX => {
            settings.virtualizer = parse_strength(raw, VIRTUALIZER_PREFIX)?;
            Ok(())
        }
        other => Err(anyhow!("unknown effect settings prefix {other:?}")),
    }
}

fn parse_strength(raw: &str, prefix: &str) -> Result<u16> {
    let fields = split_fields(raw, prefix)?;
    let strength: i32 = field(&fields, "strength")?;
    Ok(strength.clamp(0, MAX_STRENGTH as i32) as u16)
}

fn split_fields<'a>(raw: &'a str, prefix: &str) -> Result<Vec<(&'a str, &'a str)>> {
    let mut parts = raw.trim().split(';');
    match parts.next() {
        Some(head) if head == prefix => {}
        _ => return Err(anyhow!("settings string does not start with {prefix:?}")),
    }
    parts
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.split_once('=')
                .map(|(key, value)| (key.trim(), value.trim()))
                .ok_or_else(|| anyhow!("malformed settings field {part:?}"))
        })
        .collect()
}

fn field<T>(fields: &[(&str, &str)], key: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let (_, value) = fields
        .iter()
        .find(|(candidate, _)| *candidate == key)
        .ok_or_else(|| anyhow!("missing settings field {key}"))?;
    value
        .parse::<T>()
        .with_context(|| format!("invalid value for {key}: {value:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_string_matches_platform_layout() {
        let mut settings = default_settings();
        apply_preset(&mut settings, 3).expect("flat");
        assert_eq!(
            to_settings_string(&settings),
            "Equalizer;curPreset=3;numBands=5;band1Level=0;band2Level=0;band3Level=0;band4Level=0;band5Level=0"
        );

        set_band_level(&mut settings, 1, -450).expect("band");
        assert!(to_settings_string(&settings).starts_with("Equalizer;curPreset=-1;numBands=5;band1Level=0;band2Level=-450"));
    }

    #[test]
    fn parse_reads_custom_layout_and_clamps_levels() {
        let (preset, levels) =
            parse_settings_string("Equalizer;curPreset=-1;numBands=3;band1Level=2000;band2Level=-3000;band3Level=120")
                .expect("parse");
        assert_eq!(preset, None);
        assert_eq!(levels, vec![1500, -1500, 120]);
    }

    #[test]
    fn parse_rejects_malformed_strings() {
        assert!(parse_settings_string("Bogus;curPreset=1;numBands=0").is_err());
        assert!(parse_settings_string("Equalizer;numBands=1;band1Level=0").is_err());
        assert!(parse_settings_string("Equalizer;curPreset=0;numBands=2;band1Level=0").is_err());
        assert!(parse_settings_string("Equalizer;curPreset=0;numBands=1;band1Level=0;band2Level=0").is_err());
        assert!(parse_settings_string("Equalizer;curPreset=x;numBands=0").is_err());
        assert!(parse_settings_string("Equalizer;curPreset").is_err());
    }

    #[test]
    fn parse_rejects_oversized_band_count() {
        let huge = format!("Equalizer;curPreset=0;numBands={};band1Level=0", usize::MAX);
        assert!(parse_settings_string(&huge).is_err());
        let mut settings = default_settings();
        assert!(apply_effect_string(&mut settings, &huge).is_err());
        assert_eq!(settings, default_settings());

        let over = format!("Equalizer;curPreset=0;numBands={}", MAX_BANDS + 1);
        assert!(parse_settings_string(&over).is_err());
    }

    #[test]
    fn apply_settings_string_drops_unknown_preset() {
        let mut settings = default_settings();
        apply_settings_string(&mut settings, "Equalizer;curPreset=42;numBands=1;band1Level=100")
            .expect("apply");
        assert_eq!(settings.preset, None);
        assert_eq!(settings.band_levels, vec![100]);
    }

    #[test]
    fn effect_strings_round_trip_and_clamp() {
        let mut settings = default_settings();
        apply_effect_string(&mut settings, "BassBoost;strength=1200").expect("bass");
        apply_effect_string(&mut settings, "Virtualizer;strength=250").expect("virt");
        assert_eq!(settings.bass_boost, 1000);
        assert_eq!(bass_boost_string(&settings), "BassBoost;strength=1000");
        assert_eq!(virtualizer_string(&settings), "Virtualizer;strength=250");
        assert!(apply_effect_string(&mut settings, "Reverb;strength=1").is_err());

        let eq = to_settings_string(&settings);
        let mut copy = default_settings();
        apply_effect_string(&mut copy, &eq).expect("equalizer");
        assert_eq!(copy.band_levels, settings.band_levels);
    }

    #[test]
    fn presets_are_found_by_name() {
        assert_eq!(preset_index("heavy metal"), Some(5));
        assert_eq!(preset_index("Polka"), None);
        let mut settings = default_settings();
        assert!(apply_preset(&mut settings, 99).is_err());
        assert!(set_band_level(&mut settings, 9, 0).is_err());
    }

    #[test]
    fn normalize_clamps_strengths_and_levels() {
        let mut settings = EqualizerSettings {
            enabled: true,
            preset: Some(200),
            band_levels: vec![i16::MAX, i16::MIN],
            bass_boost: 5000,
            virtualizer: 10,
        };
        normalize(&mut settings);
        assert_eq!(settings.band_levels, vec![1500, -1500]);
        assert_eq!(settings.bass_boost, 1000);
        assert_eq!(settings.virtualizer, 10);
        assert_eq!(settings.preset, None);
    }
}
