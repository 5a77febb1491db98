//! Cloud share-link normalization.
//!
//! Share links handed out by storage providers usually point at a viewer
//! page. Each provider has a table of patterns that rewrite such links to a
//! URL that returns the file bytes directly. Links matching no pattern are
//! passed through unchanged.

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::debug;

/// Storage provider a source URI belongs to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CloudProvider {
    #[default]
    None,
    GoogleDrive,
    Dropbox,
    S3,
    Azure,
}

impl CloudProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::GoogleDrive => "google-drive",
            Self::Dropbox => "dropbox",
            Self::S3 => "s3",
            Self::Azure => "azure",
        }
    }
}

/// Result of running a URI through the provider table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NormalizedUrl {
    pub uri: String,
    pub provider: CloudProvider,
}

type Rewrite = fn(&Captures<'_>, &str) -> String;

struct Rule {
    provider: CloudProvider,
    pattern: Regex,
    rewrite: Rewrite,
}

const GOOGLE_DRIVE_DOWNLOAD: &str = "https://drive.google.com/uc?export=download&id=";

fn rules() -> &'static [Rule] {
    static RULES: OnceLock<Vec<Rule>> = OnceLock::new();
    RULES.get_or_init(|| {
        let rule = |provider, pattern: &str, rewrite: Rewrite| Rule {
            provider,
            pattern: Regex::new(pattern).expect("cloud URL pattern must compile"),
            rewrite,
        };
        vec![
            // https://drive.google.com/file/d/{id}/view?usp=sharing
            rule(
                CloudProvider::GoogleDrive,
                r"^https?://drive\.google\.com/file/d/([A-Za-z0-9_-]+)",
                google_drive_download,
            ),
            // https://drive.google.com/open?id={id}
            rule(
                CloudProvider::GoogleDrive,
                r"^https?://drive\.google\.com/open\?(?:[^#]*&)?id=([A-Za-z0-9_-]+)",
                google_drive_download,
            ),
            // https://drive.google.com/uc?id={id}&export=view
            rule(
                CloudProvider::GoogleDrive,
                r"^https?://(?:drive|docs)\.google\.com/uc\?(?:[^#]*&)?id=([A-Za-z0-9_-]+)",
                google_drive_download,
            ),
            // https://www.dropbox.com/s/{key}/{name}?dl=0
            // https://www.dropbox.com/scl/fi/{key}/{name}?rlkey=...&dl=0
            rule(
                CloudProvider::Dropbox,
                r"^https?://(?:www\.)?dropbox\.com/(?:s|sh|scl/fi)/",
                dropbox_direct,
            ),
            // s3://{bucket}/{key}
            rule(
                CloudProvider::S3,
                r"^s3://([a-z0-9][a-z0-9.-]+)/(.+)$",
                |caps, _| format!("https://{}.s3.amazonaws.com/{}", &caps[1], &caps[2]),
            ),
            // Virtual-hosted and path-style S3 URLs are already direct
            rule(
                CloudProvider::S3,
                r"^https?://(?:[a-z0-9.-]+\.)?s3[.-](?:[a-z0-9-]+\.)?amazonaws\.com/",
                |_, uri| uri.to_string(),
            ),
            // https://{account}.blob.core.windows.net/{container}/{blob}
            rule(
                CloudProvider::Azure,
                r"^https?://[a-z0-9]+\.blob\.core\.windows\.net/[^/]+/.+",
                |_, uri| uri.to_string(),
            ),
        ]
    })
}

fn google_drive_download(caps: &Captures<'_>, _uri: &str) -> String {
    format!("{GOOGLE_DRIVE_DOWNLOAD}{}", &caps[1])
}

/// Force `dl=1` on a Dropbox share link, keeping any other query params (e.g. `rlkey`).
fn dropbox_direct(_caps: &Captures<'_>, uri: &str) -> String {
    let (without_fragment, _) = uri.split_once('#').unwrap_or((uri, ""));
    let (base, query) = without_fragment
        .split_once('?')
        .unwrap_or((without_fragment, ""));

    let mut params: Vec<String> = query
        .split('&')
        .filter(|p| !p.is_empty())
        .filter(|p| !p.starts_with("dl=") && !p.starts_with("raw="))
        .map(str::to_string)
        .collect();
    params.push("dl=1".to_string());

    format!("{}?{}", base, params.join("&"))
}

/// Rewrite a share link to its provider's direct-download form.
///
/// Unrecognized URIs are returned unchanged with `CloudProvider::None`.
pub fn normalize_cloud_url(uri: &str) -> NormalizedUrl {
    let trimmed = uri.trim();
    for rule in rules() {
        if let Some(caps) = rule.pattern.captures(trimmed) {
            let rewritten = (rule.rewrite)(&caps, trimmed);
            debug!(
                "Normalized {} link -> {}",
                rule.provider.as_str(),
                rewritten
            );
            return NormalizedUrl {
                uri: rewritten,
                provider: rule.provider,
            };
        }
    }

    debug!("No cloud pattern matched, passing URI through");
    NormalizedUrl {
        uri: trimmed.to_string(),
        provider: CloudProvider::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DRIVE_ID: &str = "1AbC-dEf_GhIjKlMnOpQrStUv";

    fn expected_drive() -> String {
        format!("https://drive.google.com/uc?export=download&id={DRIVE_ID}")
    }

    #[test]
    fn google_drive_file_view_link() {
        let n = normalize_cloud_url(&format!(
            "https://drive.google.com/file/d/{DRIVE_ID}/view?usp=sharing"
        ));
        assert_eq!(n.provider, CloudProvider::GoogleDrive);
        assert_eq!(n.uri, expected_drive());
    }

    #[test]
    fn google_drive_open_link() {
        let n = normalize_cloud_url(&format!("https://drive.google.com/open?id={DRIVE_ID}"));
        assert_eq!(n.provider, CloudProvider::GoogleDrive);
        assert_eq!(n.uri, expected_drive());
    }

    #[test]
    fn google_drive_uc_link() {
        let n = normalize_cloud_url(&format!(
            "https://drive.google.com/uc?export=view&id={DRIVE_ID}"
        ));
        assert_eq!(n.provider, CloudProvider::GoogleDrive);
        assert_eq!(n.uri, expected_drive());

        let n = normalize_cloud_url(&format!("https://docs.google.com/uc?id={DRIVE_ID}"));
        assert_eq!(n.uri, expected_drive());
    }

    #[test]
    fn google_drive_normalized_link_is_stable() {
        let once = normalize_cloud_url(&expected_drive());
        assert_eq!(once.uri, expected_drive());
    }

    #[test]
    fn dropbox_dl_zero_becomes_dl_one() {
        let n = normalize_cloud_url("https://www.dropbox.com/s/abc123/track.mp3?dl=0");
        assert_eq!(n.provider, CloudProvider::Dropbox);
        assert_eq!(n.uri, "https://www.dropbox.com/s/abc123/track.mp3?dl=1");
    }

    #[test]
    fn dropbox_scl_link_keeps_rlkey() {
        let n = normalize_cloud_url(
            "https://www.dropbox.com/scl/fi/xyz/track.wav?rlkey=k3y&dl=0#frag",
        );
        assert_eq!(
            n.uri,
            "https://www.dropbox.com/scl/fi/xyz/track.wav?rlkey=k3y&dl=1"
        );
    }

    #[test]
    fn dropbox_without_query_gets_dl_param() {
        let n = normalize_cloud_url("https://dropbox.com/s/abc123/track.mp3");
        assert_eq!(n.uri, "https://dropbox.com/s/abc123/track.mp3?dl=1");
    }

    #[test]
    fn s3_scheme_is_rewritten() {
        let n = normalize_cloud_url("s3://my-bucket/albums/01 intro.flac");
        assert_eq!(n.provider, CloudProvider::S3);
        assert_eq!(
            n.uri,
            "https://my-bucket.s3.amazonaws.com/albums/01 intro.flac"
        );
    }

    #[test]
    fn s3_https_is_recognized_and_kept() {
        let uri = "https://my-bucket.s3.us-east-1.amazonaws.com/a/b.mp3";
        let n = normalize_cloud_url(uri);
        assert_eq!(n.provider, CloudProvider::S3);
        assert_eq!(n.uri, uri);
    }

    #[test]
    fn azure_blob_is_recognized_and_kept() {
        let uri = "https://acct.blob.core.windows.net/audio/track.mp3?sv=2020&sig=abc";
        let n = normalize_cloud_url(uri);
        assert_eq!(n.provider, CloudProvider::Azure);
        assert_eq!(n.uri, uri);
    }

    #[test]
    fn unrecognized_url_is_unchanged() {
        let uri = "https://example.com/media/track.mp3?x=1";
        let n = normalize_cloud_url(uri);
        assert_eq!(n.provider, CloudProvider::None);
        assert_eq!(n.uri, uri);

        let n = normalize_cloud_url("https://drive.google.com/drive/folders/abc");
        assert_eq!(n.provider, CloudProvider::None);
        assert_eq!(n.uri, "https://drive.google.com/drive/folders/abc");
    }
}
