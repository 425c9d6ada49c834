use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use site_scrape::orchestrator::parse_start_page;
use site_scrape::profile::{match_url, SiteProfile};
use site_scrape::{
    template, HttpFetcher, IgnoreList, JsonLinesDispatcher, Orchestrator, Params, ProfileSet, RunOptions,
    RunStatus, Settings,
};

#[derive(Parser)]
#[command(name = "site_scrape", about = "Profile-driven video site scraper")]
struct Cli {
    /// Directory of site profiles (overrides `sites_dir`)
    #[arg(long, global = true)]
    sites: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List loaded site profiles
    Sites,
    /// Show a site's modes, tips and capabilities
    Info {
        /// Shortcode, name or domain
        site: String,
    },
    /// Validate every profile in the sites directory
    Check,
    /// Crawl one mode of a site
    Run {
        /// Shortcode, name or domain
        site: String,
        /// Mode name (search, tag, user, video, ...)
        mode: String,
        /// Value for the mode's main placeholder
        query: Option<String>,
        /// Extra placeholder values
        #[arg(short, long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,
        #[command(flatten)]
        crawl: CrawlArgs,
    },
    /// Match a full URL to a site and mode, then crawl it
    Url {
        url: String,
        #[command(flatten)]
        crawl: CrawlArgs,
    },
}

#[derive(Args)]
struct CrawlArgs {
    /// Max pages to fetch (default: the mode's max_pages)
    #[arg(short = 'n', long)]
    pages: Option<u32>,
    /// Start page, optionally with a 1-based item: `3` or `3.7`
    #[arg(short, long, value_parser = parse_start_page)]
    start_page: Option<(u32, usize)>,
    /// Fetch each item's video page for full metadata
    #[arg(short, long)]
    detail: bool,
    /// Print records only; nothing is handed to the downloader
    #[arg(long)]
    no_dispatch: bool,
    /// Skip listing items whose URL appears in this file, one per line
    #[arg(long, value_name = "FILE")]
    skip_urls: Option<PathBuf>,
}

impl CrawlArgs {
    fn options(&self, url_page: Option<u32>) -> RunOptions {
        let (start_page, item_offset) = self
            .start_page
            .unwrap_or((url_page.unwrap_or(1), 0));
        RunOptions {
            max_pages: self.pages,
            start_page,
            item_offset,
            detail: self.detail,
            dispatch: !self.no_dispatch,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let mut settings = Settings::load().context("Failed to load settings")?;
    if let Some(dir) = cli.sites {
        settings.sites_dir = dir;
    }
    let set = ProfileSet::load_dir(&settings.sites_dir)
        .with_context(|| format!("Failed to read profiles from {}", settings.sites_dir.display()))?;

    let result = match cli.command {
        Commands::Sites => {
            if set.profiles.is_empty() {
                println!("No profiles in {}.", settings.sites_dir.display());
                return Ok(());
            }
            println!("{:<6} | {:<24} | {:<28} | {}", "Code", "Site", "Domain", "Modes");
            println!("{}", "-".repeat(90));
            for p in &set.profiles {
                let modes: Vec<&str> = p.modes.keys().map(String::as_str).collect();
                println!(
                    "{:<6} | {:<24} | {:<28} | {}",
                    p.shortcode,
                    truncate(&p.name, 24),
                    truncate(&p.domain, 28),
                    modes.join(", ")
                );
            }
            if !set.rejected.is_empty() {
                println!("\n{} invalid profile(s) skipped; run `check` for details.", set.rejected.len());
            }
            Ok(())
        }
        Commands::Info { site } => {
            let profile = set
                .find(&site)
                .ok_or_else(|| anyhow!("No site matches `{site}`"))?;
            print_info(&profile);
            Ok(())
        }
        Commands::Check => {
            println!("{} valid profile(s) in {}", set.profiles.len(), settings.sites_dir.display());
            for (path, err) in &set.rejected {
                println!("  {}: {}", path.display(), err);
            }
            if set.rejected.is_empty() {
                Ok(())
            } else {
                Err(anyhow!("{} profile(s) failed validation", set.rejected.len()))
            }
        }
        Commands::Run {
            site,
            mode,
            query,
            params,
            crawl,
        } => {
            let profile = set
                .find(&site)
                .ok_or_else(|| anyhow!("No site matches `{site}`"))?;
            let spec = profile
                .mode(&mode)
                .ok_or_else(|| anyhow!("{} has no `{mode}` mode", profile.name))?;

            let mut invocation: Params = params.into_iter().collect();
            if let Some(query) = query {
                let primary = template::required_params(&spec.url_pattern)?
                    .first()
                    .map(|name| name.to_string())
                    .unwrap_or_else(|| mode.clone());
                invocation.entry(primary).or_insert(query);
            }
            let opts = crawl.options(None);
            crawl_mode(&settings, profile, &mode, invocation, opts, crawl.skip_urls.as_deref()).await
        }
        Commands::Url { url, crawl } => {
            let profile = set
                .find_by_url(&url)
                .ok_or_else(|| anyhow!("No profile serves {url}"))?;
            let found = match_url(&profile, &url)
                .ok_or_else(|| anyhow!("{url} matches no mode of {}", profile.name))?;
            eprintln!("{} -> mode `{}`", profile.name, found.mode);
            let opts = crawl.options(found.page);
            crawl_mode(&settings, profile, &found.mode, found.params, opts, crawl.skip_urls.as_deref()).await
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        eprintln!("\nDone in {}", format_duration(elapsed));
    }

    result
}

async fn crawl_mode(
    settings: &Settings,
    profile: Arc<SiteProfile>,
    mode: &str,
    params: Params,
    opts: RunOptions,
    skip_urls: Option<&Path>,
) -> anyhow::Result<()> {
    let fetcher = HttpFetcher::new(settings).context("Failed to build HTTP client")?;
    let ignore = IgnoreList::new(&settings.ignored).context("Invalid `ignored` terms")?;
    let processed = match skip_urls {
        Some(path) => read_url_list(path)?,
        None => HashSet::new(),
    };
    let token = CancellationToken::new();

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg} ({pos} records)")?,
    );
    pb.enable_steady_tick(Duration::from_millis(120));

    let mut orchestrator = Orchestrator::new(profile, fetcher)
        .with_settings(settings)
        .with_ignore(ignore)
        .with_processed(processed)
        .with_cancellation(token.clone())
        .with_progress(pb.clone())
        .with_dispatcher(Arc::new(JsonLinesDispatcher::stdout()));

    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping the crawl");
            token.cancel();
        }
    });
    let outcome = orchestrator.run(mode, &params, &opts).await;
    interrupt.abort();
    pb.finish_and_clear();

    eprintln!(
        "{} {}: {} ({} records, {} pages, {} dispatched, {} ignored, {} skipped) in {}",
        outcome.site,
        outcome.mode,
        outcome.status,
        outcome.records.len(),
        outcome.pages_fetched,
        outcome.dispatched,
        outcome.ignored,
        outcome.skipped,
        format_duration(outcome.elapsed()),
    );
    if !opts.dispatch {
        for record in &outcome.records {
            println!("{}", serde_json::to_string(record)?);
        }
    }
    for (url, err) in &outcome.detail_errors {
        eprintln!("  detail {}: {}", truncate(url, 60), err);
    }
    for (key, err) in &outcome.dispatch_errors {
        eprintln!("  dispatch {}: {}", truncate(key, 60), err);
    }

    match (outcome.status, outcome.error) {
        (RunStatus::Failed, Some(err)) => Err(err.into()),
        (RunStatus::Failed, None) => bail!("run failed"),
        (RunStatus::Partial, Some(err)) => {
            eprintln!("  stopped early: {err}");
            Ok(())
        }
        _ => Ok(()),
    }
}

fn print_info(profile: &SiteProfile) {
    println!("{} ({}): {}", profile.name, profile.shortcode, profile.base_url);
    let mut flags = Vec::new();
    if profile.use_selenium {
        flags.push("browser session");
    }
    if profile.m3u8_mode {
        flags.push("m3u8");
    }
    if profile.no_overwrite {
        flags.push("no overwrite");
    }
    println!("Download: {}", profile.download_method);
    if !flags.is_empty() {
        println!("Needs:    {}", flags.join(", "));
    }
    if let Some(note) = &profile.note {
        println!("Note:     {note}");
    }

    println!("\n{:<8} | {:<40} | {:>5} | {}", "Mode", "URL pattern", "Pages", "Tip");
    println!("{}", "-".repeat(90));
    for mode in profile.modes.values() {
        let pages = match (mode.paginates(), mode.max_pages) {
            (_, u32::MAX) => "all".into(),
            (true, n) => n.to_string(),
            (false, 1) => "-".into(),
            (false, n) => n.to_string(),
        };
        println!(
            "{:<8} | {:<40} | {:>5} | {}",
            mode.name,
            truncate(&mode.url_pattern, 40),
            pages,
            mode.tip.as_deref().unwrap_or("")
        );
        for example in &mode.examples {
            println!("{:<8} |   e.g. {}", "", example);
        }
    }
}

fn read_url_list(path: &Path) -> anyhow::Result<HashSet<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (k, v) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{s}`"))?;
    Ok((k.trim().to_string(), v.to_string()))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
