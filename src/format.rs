use std::ffi::OsString;
use std::path::{Path, PathBuf};
use strum_macros::Display;

/// Suffix appended to the file stem of every converted file
pub const OUTPUT_STEM_SUFFIX: &str = "_432";

/// Represents supported audio file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum AudioFormat {
    Wav,
    Flac,
    Mp3,
    M4a,
    Aac,
    Ogg,
    Opus,
    Wma,
}

impl AudioFormat {
    /// Returns a list of supported file extensions
    #[inline]
    pub fn supported_extensions() -> &'static [&'static str] {
        &["wav", "flac", "mp3", "m4a", "aac", "ogg", "opus", "wma"]
    }

    /// Parses an extension, with or without the leading dot, ignoring case
    pub fn from_extension(ext: &str) -> Option<Self> {
        Some(
            match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
                "wav" => Self::Wav,
                "flac" => Self::Flac,
                "mp3" => Self::Mp3,
                "m4a" => Self::M4a,
                "aac" => Self::Aac,
                "ogg" => Self::Ogg,
                "opus" => Self::Opus,
                "wma" => Self::Wma,
                _ => return None,
            },
        )
    }

    /// Creates an AudioFormat from a file path based on its extension
    #[inline]
    pub fn from_path(value: impl AsRef<Path>) -> Option<Self> {
        Self::from_extension(&value.as_ref().extension()?.to_string_lossy())
    }

    /// Lossless formats have no bitrate concept
    #[inline]
    pub fn is_lossless(self) -> bool {
        matches!(self, Self::Wav | Self::Flac)
    }

    /// The format written for a source of this format. WMA has no re-encode
    /// path of its own and always becomes MP3.
    #[inline]
    pub fn output_format(self) -> Self {
        match self {
            Self::Wma => Self::Mp3,
            other => other,
        }
    }
}

/// Computes where the converted copy of `source` goes.
///
/// The relative path below `source_root` is mirrored under
/// `destination_root`, and `song.flac` becomes `song_432.flac`. WMA sources
/// are written as `.mp3`. The source extension keeps its original case.
pub fn destination_for(
    source: impl AsRef<Path>,
    source_root: impl AsRef<Path>,
    destination_root: impl AsRef<Path>,
) -> Option<PathBuf> {
    let source = source.as_ref();
    let format = AudioFormat::from_path(source)?;
    let relative = pathdiff::diff_paths(source, source_root)?;
    let stem = source.file_stem()?;

    let mut file_name = OsString::from(stem);
    file_name.push(OUTPUT_STEM_SUFFIX);
    file_name.push(".");
    if format == AudioFormat::Wma {
        file_name.push(format.output_format().to_string());
    } else {
        file_name.push(source.extension()?);
    }

    Some(
        destination_root
            .as_ref()
            .join(relative)
            .with_file_name(file_name),
    )
}
