use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};
use url::Url;

use super::SiteProfile;
use crate::error::ValidationError;

/// Every profile found in a sites directory. Invalid files are kept aside
/// with their error instead of aborting the load.
#[derive(Debug, Default)]
pub struct ProfileSet {
    pub profiles: Vec<Arc<SiteProfile>>,
    pub rejected: Vec<(PathBuf, ValidationError)>,
}

impl ProfileSet {
    pub fn load_dir(dir: &Path) -> io::Result<Self> {
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("yaml" | "yml")))
            .collect();
        paths.sort();

        let mut set = ProfileSet::default();
        for path in paths {
            let text = fs::read_to_string(&path)?;
            match SiteProfile::from_yaml(&text) {
                Ok(profile) => {
                    debug!(path = %path.display(), site = %profile.name, "loaded profile");
                    set.profiles.push(Arc::new(profile));
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping invalid profile");
                    set.rejected.push((path, e));
                }
            }
        }
        Ok(set)
    }

    pub fn from_profiles(profiles: Vec<SiteProfile>) -> Self {
        ProfileSet {
            profiles: profiles.into_iter().map(Arc::new).collect(),
            rejected: Vec::new(),
        }
    }

    /// Look a site up by shortcode, name or domain, case-insensitively.
    pub fn find(&self, ident: &str) -> Option<Arc<SiteProfile>> {
        let ident = ident.trim();
        self.profiles
            .iter()
            .find(|p| {
                p.shortcode.eq_ignore_ascii_case(ident)
                    || p.name.eq_ignore_ascii_case(ident)
                    || p.domain.eq_ignore_ascii_case(ident)
            })
            .cloned()
    }

    /// The profile whose domain serves `url`; `www.` is ignored on both sides.
    pub fn find_by_url(&self, url: &str) -> Option<Arc<SiteProfile>> {
        let host = Url::parse(url).ok()?.host_str()?.to_ascii_lowercase();
        let host = strip_www(&host);
        self.profiles
            .iter()
            .find(|p| strip_www(&p.domain.to_ascii_lowercase()) == host)
            .cloned()
    }
}

fn strip_www(host: &str) -> &str {
    host.strip_prefix("www.").unwrap_or(host)
}
