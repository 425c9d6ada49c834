use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::DispatchError;
use crate::extract::ExtractedRecord;
use crate::profile::SiteProfile;
use crate::template::absolutize;

/// Fields lifted out of a record into dedicated job fields.
const JOB_FIELDS: &[&str] = &["url", "download_url", "title"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadMethod {
    #[serde(rename = "yt-dlp")]
    YtDlp,
    Ffmpeg,
    #[default]
    Curl,
    Wget,
    Requests,
}

impl DownloadMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadMethod::YtDlp => "yt-dlp",
            DownloadMethod::Ffmpeg => "ffmpeg",
            DownloadMethod::Curl => "curl",
            DownloadMethod::Wget => "wget",
            DownloadMethod::Requests => "requests",
        }
    }
}

impl fmt::Display for DownloadMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yt-dlp" | "ytdlp" => Ok(DownloadMethod::YtDlp),
            "ffmpeg" => Ok(DownloadMethod::Ffmpeg),
            "curl" => Ok(DownloadMethod::Curl),
            "wget" => Ok(DownloadMethod::Wget),
            "requests" => Ok(DownloadMethod::Requests),
            other => Err(format!(
                "unknown download method `{other}` (expected yt-dlp, ffmpeg, curl, wget or requests)"
            )),
        }
    }
}

/// What an external downloader needs to fetch one video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadJob {
    pub site: String,
    pub url: Option<String>,
    pub download_url: Option<String>,
    pub title: String,
    pub method: DownloadMethod,
    pub m3u8: bool,
    pub no_overwrite: bool,
    pub metadata: IndexMap<String, String>,
}

impl DownloadJob {
    pub fn from_record(profile: &SiteProfile, record: &ExtractedRecord) -> Result<Self, DispatchError> {
        let link = |field: &str| record.value(field).map(|v| absolutize(&profile.base_url, v));
        let url = link("url");
        let download_url = link("download_url");
        if url.is_none() && download_url.is_none() {
            return Err(DispatchError::NoTarget);
        }

        let metadata = record
            .iter()
            .filter(|(k, v)| !v.is_empty() && !JOB_FIELDS.contains(k))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Ok(DownloadJob {
            site: profile.shortcode.clone(),
            url,
            download_url,
            title: record.value("title").unwrap_or("Untitled").to_string(),
            method: profile.download_method,
            m3u8: profile.m3u8_mode,
            no_overwrite: profile.no_overwrite,
            metadata,
        })
    }

    /// The URL the downloader should fetch first.
    pub fn target(&self) -> &str {
        self.download_url
            .as_deref()
            .or(self.url.as_deref())
            .unwrap_or_default()
    }
}

/// Receives finished records. Downloading itself happens elsewhere.
#[async_trait]
pub trait DownloadDispatcher: Send + Sync {
    async fn submit(&self, job: &DownloadJob) -> Result<(), DispatchError>;
}

/// Writes one JSON job per line, for a downloader reading a pipe.
pub struct JsonLinesDispatcher<W> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesDispatcher<W> {
    pub fn new(out: W) -> Self {
        JsonLinesDispatcher { out: Mutex::new(out) }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl JsonLinesDispatcher<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

#[async_trait]
impl<W: Write + Send> DownloadDispatcher for JsonLinesDispatcher<W> {
    async fn submit(&self, job: &DownloadJob) -> Result<(), DispatchError> {
        let io_err = |source: io::Error| DispatchError::Io {
            url: job.target().to_string(),
            source,
        };
        let line = serde_json::to_string(job).map_err(|e| io_err(e.into()))?;
        let mut out = self.out.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        writeln!(out, "{line}").map_err(io_err)?;
        out.flush().map_err(io_err)
    }
}
