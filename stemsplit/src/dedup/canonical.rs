//! Input canonicalization.
//!
//! Equivalent inputs must map to one key: all the URL shapes that point at
//! the same video collapse to a single watch URL, and generic URLs lose the
//! parts that do not change what is fetched.

use url::Url;

use crate::{Error, Result};

/// Hosts accepted when no explicit list is configured.
pub const DEFAULT_ALLOWED_HOSTS: &[&str] = &[
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
    "youtu.be",
];

/// Query parameters that only track where a link was shared from.
const TRACKING_PARAMS: &[&str] = &["si", "feature", "fbclid", "gclid", "pp", "ab_channel"];

const YOUTUBE_ID_LEN: usize = 11;

/// A validated, canonical input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalInput {
    /// Dedup key.
    pub key: String,
    /// URL handed to the downloader.
    pub source_url: String,
}

/// Host allow-list applied before canonicalization.
#[derive(Debug, Clone)]
pub struct InputPolicy {
    allowed_hosts: Vec<String>,
    max_len: usize,
}

impl InputPolicy {
    pub fn new<I, S>(allowed_hosts: I, max_len: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_hosts: allowed_hosts
                .into_iter()
                .map(|h| h.into().trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
            max_len,
        }
    }

    /// Validate `raw` and return its canonical form.
    pub fn canonicalize(&self, raw: &str) -> Result<CanonicalInput> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::invalid_input("url must not be empty"));
        }
        if raw.len() > self.max_len {
            return Err(Error::invalid_input(format!(
                "url exceeds {} bytes",
                self.max_len
            )));
        }

        let url = Url::parse(raw).map_err(|e| Error::invalid_input(format!("invalid url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::invalid_input("url must use http or https"));
        }
        let host = url
            .host_str()
            .ok_or_else(|| Error::invalid_input("url has no host"))?
            .trim_end_matches('.')
            .to_ascii_lowercase();
        if !self.allowed_hosts.iter().any(|h| *h == host) {
            return Err(Error::invalid_input(format!("unsupported host '{host}'")));
        }

        let key = if is_youtube_host(&host) {
            let id = youtube_video_id(&url, &host)
                .ok_or_else(|| Error::invalid_input("url does not reference a video"))?;
            format!("https://www.youtube.com/watch?v={id}")
        } else {
            canonical_generic(url)
        };

        Ok(CanonicalInput {
            source_url: key.clone(),
            key,
        })
    }
}

impl Default for InputPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_HOSTS.iter().copied(), 2048)
    }
}

fn is_youtube_host(host: &str) -> bool {
    host == "youtu.be" || host == "youtube.com" || host.ends_with(".youtube.com")
}

fn is_video_id(candidate: &str) -> bool {
    candidate.len() == YOUTUBE_ID_LEN
        && candidate
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn youtube_video_id(url: &Url, host: &str) -> Option<String> {
    let mut segments = url.path_segments()?.filter(|s| !s.is_empty());

    let candidate = if host == "youtu.be" {
        segments.next().map(str::to_string)
    } else {
        match segments.next() {
            Some("watch") => url
                .query_pairs()
                .find(|(k, _)| k == "v")
                .map(|(_, v)| v.into_owned()),
            Some("shorts" | "embed" | "live" | "v") => segments.next().map(str::to_string),
            _ => None,
        }
    };

    candidate.filter(|id| is_video_id(id))
}

fn is_tracking_param(name: &str) -> bool {
    name.starts_with("utm_") || TRACKING_PARAMS.contains(&name)
}

/// Lower-cased scheme/host (done by the parser), no fragment, no default
/// port, tracking parameters removed and the rest sorted.
fn canonical_generic(mut url: Url) -> String {
    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();

    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    url.to_string()
}
