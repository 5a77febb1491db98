use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Broad media class of an asset, used to decide whether it can be demoed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Audio,
    Video,
    Image,
    Unknown,
}

/// Content type for deliverable files.
///
/// Wraps MIME types as an enum for type-safe comparisons.
#[derive(Clone, Debug, PartialEq)]
pub enum ContentType {
    // Audio
    Flac,
    Mpeg,
    Ogg,
    Wav,
    Aac,
    Mp4Audio,
    Opus,
    // Video
    Mp4Video,
    Webm,
    Quicktime,
    // Images
    Jpeg,
    Png,
    Gif,
    Webp,
    // Text (never valid demo payloads)
    PlainText,
    Html,
    Json,
    Xml,
    // Other
    OctetStream,
    Other(String),
}

impl ContentType {
    /// MIME type string (e.g., "audio/flac", "image/jpeg").
    pub fn as_str(&self) -> &str {
        match self {
            Self::Flac => "audio/flac",
            Self::Mpeg => "audio/mpeg",
            Self::Ogg => "audio/ogg",
            Self::Wav => "audio/wav",
            Self::Aac => "audio/aac",
            Self::Mp4Audio => "audio/mp4",
            Self::Opus => "audio/opus",
            Self::Mp4Video => "video/mp4",
            Self::Webm => "video/webm",
            Self::Quicktime => "video/quicktime",
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::Webp => "image/webp",
            Self::PlainText => "text/plain",
            Self::Html => "text/html",
            Self::Json => "application/json",
            Self::Xml => "application/xml",
            Self::OctetStream => "application/octet-stream",
            Self::Other(s) => s,
        }
    }

    /// Parse from a MIME type string. Parameters such as `; charset=utf-8` are ignored.
    pub fn from_mime(s: &str) -> Self {
        let essence = s.split(';').next().unwrap_or(s).trim();
        match essence {
            "audio/flac" | "audio/x-flac" => Self::Flac,
            "audio/mpeg" | "audio/mp3" => Self::Mpeg,
            "audio/ogg" => Self::Ogg,
            "audio/wav" | "audio/x-wav" | "audio/wave" => Self::Wav,
            "audio/aac" => Self::Aac,
            "audio/mp4" | "audio/x-m4a" => Self::Mp4Audio,
            "audio/opus" => Self::Opus,
            "video/mp4" => Self::Mp4Video,
            "video/webm" => Self::Webm,
            "video/quicktime" => Self::Quicktime,
            "image/jpeg" => Self::Jpeg,
            "image/png" => Self::Png,
            "image/gif" => Self::Gif,
            "image/webp" => Self::Webp,
            "text/plain" => Self::PlainText,
            "text/html" => Self::Html,
            "application/json" => Self::Json,
            "application/xml" | "text/xml" => Self::Xml,
            "application/octet-stream" => Self::OctetStream,
            other => Self::Other(other.to_string()),
        }
    }

    /// Map a file extension to its content type.
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "flac" => Self::Flac,
            "mp3" => Self::Mpeg,
            "ogg" | "oga" => Self::Ogg,
            "wav" => Self::Wav,
            "aac" => Self::Aac,
            "m4a" => Self::Mp4Audio,
            "opus" => Self::Opus,
            "mp4" | "m4v" => Self::Mp4Video,
            "webm" => Self::Webm,
            "mov" => Self::Quicktime,
            "jpg" | "jpeg" => Self::Jpeg,
            "png" => Self::Png,
            "gif" => Self::Gif,
            "webp" => Self::Webp,
            "txt" | "log" => Self::PlainText,
            "htm" | "html" => Self::Html,
            "json" => Self::Json,
            "xml" => Self::Xml,
            _ => Self::OctetStream,
        }
    }

    /// Canonical file extension used when naming cache entries.
    pub fn extension(&self) -> &str {
        match self {
            Self::Flac => "flac",
            Self::Mpeg => "mp3",
            Self::Ogg => "ogg",
            Self::Wav => "wav",
            Self::Aac => "aac",
            Self::Mp4Audio => "m4a",
            Self::Opus => "opus",
            Self::Mp4Video => "mp4",
            Self::Webm => "webm",
            Self::Quicktime => "mov",
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::Webp => "webp",
            Self::PlainText => "txt",
            Self::Html => "html",
            Self::Json => "json",
            Self::Xml => "xml",
            Self::OctetStream | Self::Other(_) => "bin",
        }
    }

    /// Guess a content type from the leading bytes of a file.
    ///
    /// Magic-byte checks only. Returns `None` when nothing matched.
    pub fn sniff(head: &[u8]) -> Option<Self> {
        if head.starts_with(b"fLaC") {
            return Some(Self::Flac);
        }
        if head.starts_with(b"ID3") {
            return Some(Self::Mpeg);
        }
        // MPEG audio frame sync: 11 set bits
        if head.len() >= 2 && head[0] == 0xFF && (head[1] & 0xE0) == 0xE0 {
            // ADTS AAC shares the sync word but has layer bits == 00
            if (head[1] & 0x06) == 0 {
                return Some(Self::Aac);
            }
            return Some(Self::Mpeg);
        }
        if head.starts_with(b"OggS") {
            return Some(Self::Ogg);
        }
        if head.len() >= 12 && &head[0..4] == b"RIFF" {
            return match &head[8..12] {
                b"WAVE" => Some(Self::Wav),
                b"WEBP" => Some(Self::Webp),
                _ => None,
            };
        }
        if head.len() >= 12 && &head[4..8] == b"ftyp" {
            return match &head[8..12] {
                b"M4A " | b"M4B " => Some(Self::Mp4Audio),
                b"qt  " => Some(Self::Quicktime),
                _ => Some(Self::Mp4Video),
            };
        }
        if head.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
            return Some(Self::Webm);
        }
        if head.starts_with(&[0x89, b'P', b'N', b'G']) {
            return Some(Self::Png);
        }
        if head.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(Self::Jpeg);
        }
        if head.starts_with(b"GIF8") {
            return Some(Self::Gif);
        }
        sniff_text(head)
    }

    pub fn media_type(&self) -> MediaType {
        if self.is_audio() {
            MediaType::Audio
        } else if self.is_video() {
            MediaType::Video
        } else if self.is_image() {
            MediaType::Image
        } else {
            MediaType::Unknown
        }
    }

    pub fn is_audio(&self) -> bool {
        matches!(
            self,
            Self::Flac | Self::Mpeg | Self::Ogg | Self::Wav | Self::Aac | Self::Mp4Audio | Self::Opus
        ) || matches!(self, Self::Other(s) if s.starts_with("audio/"))
    }

    pub fn is_video(&self) -> bool {
        matches!(self, Self::Mp4Video | Self::Webm | Self::Quicktime)
            || matches!(self, Self::Other(s) if s.starts_with("video/"))
    }

    pub fn is_image(&self) -> bool {
        matches!(self, Self::Jpeg | Self::Png | Self::Gif | Self::Webp)
            || matches!(self, Self::Other(s) if s.starts_with("image/"))
    }

    /// Text-like payloads: what a failed download (error page, JSON error) looks like.
    pub fn is_text(&self) -> bool {
        matches!(self, Self::PlainText | Self::Html | Self::Json | Self::Xml)
            || matches!(self, Self::Other(s) if s.starts_with("text/"))
    }
}

/// Recognize error pages and API error bodies that were saved in place of media.
fn sniff_text(head: &[u8]) -> Option<ContentType> {
    let trimmed = head
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map(|i| &head[i..])?;

    let lower: Vec<u8> = trimmed
        .iter()
        .take(16)
        .map(|b| b.to_ascii_lowercase())
        .collect();
    if lower.starts_with(b"<!doctype html") || lower.starts_with(b"<html") {
        return Some(ContentType::Html);
    }
    if lower.starts_with(b"<?xml") {
        return Some(ContentType::Xml);
    }
    if trimmed[0] == b'{' || trimmed[0] == b'[' {
        return Some(ContentType::Json);
    }

    // Mostly printable ASCII with no NUL bytes is treated as plain text.
    let sample = &trimmed[..trimmed.len().min(512)];
    let printable = sample
        .iter()
        .filter(|b| b.is_ascii_graphic() || b.is_ascii_whitespace())
        .count();
    if !sample.contains(&0) && printable * 100 >= sample.len() * 95 {
        return Some(ContentType::PlainText);
    }
    None
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ContentType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ContentType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(ContentType::from_mime(&s))
    }
}
