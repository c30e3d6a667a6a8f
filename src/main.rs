use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use console::Emoji;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use podkeep::feed::is_url;
use podkeep::{
    Config, DeleteMode, DownloadOutcome, DownloadStatus, EnqueueOutcome, Episode, EpisodeFilter,
    EpisodeId, FileStore, FlagFilter, Library, NoopReporter, ProgressEvent, ProgressReporter,
    RefreshOutcome, ReqwestClient, SharedProgressReporter, SortOrder, SubscriptionId,
    SubscriptionRefresh, SubscriptionSort,
};

// Emoji with fallback for terminals without Unicode support
static MICROPHONE: Emoji<'_, '_> = Emoji("🎙️  ", "");
static SEARCH: Emoji<'_, '_> = Emoji("🔍 ", "[~] ");
static HEADPHONES: Emoji<'_, '_> = Emoji("🎧 ", "[i] ");
static DOWNLOAD: Emoji<'_, '_> = Emoji("📥 ", "[v] ");
static SUCCESS: Emoji<'_, '_> = Emoji("✅ ", "[+] ");
static FAILURE: Emoji<'_, '_> = Emoji("❌ ", "[!] ");
static BROOM: Emoji<'_, '_> = Emoji("🧹 ", "[-] ");
static FOLDER: Emoji<'_, '_> = Emoji("📁 ", "");
static CROSS: Emoji<'_, '_> = Emoji("✗ ", "x ");

/// Follow podcast feeds and keep their episodes downloaded
#[derive(Parser, Debug)]
#[command(name = "podkeep")]
#[command(about = "Follow podcast feeds and keep their episodes downloaded")]
#[command(version)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Quiet mode - suppress progress output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to a feed and run its first refresh
    Add { url: String },

    /// Refresh one subscription, or all of them
    Refresh { subscription: Option<u64> },

    /// List subscriptions
    List {
        #[arg(long, value_enum, default_value_t = SortArg::Added)]
        sort: SortArg,

        /// Sort descending
        #[arg(long)]
        desc: bool,
    },

    /// List the episodes of a subscription, newest first
    Episodes {
        subscription: u64,

        /// Only downloaded episodes
        #[arg(long)]
        downloaded: bool,

        /// Only unplayed episodes
        #[arg(long)]
        unplayed: bool,
    },

    /// Download one episode
    Download { episode: u64 },

    /// Download every episode of a subscription that is not downloaded yet
    DownloadAll { subscription: u64 },

    /// Delete an episode's downloaded file
    DeleteFile { episode: u64 },

    /// Mark an episode as played
    Played {
        episode: u64,

        /// Mark as unplayed instead
        #[arg(long)]
        unset: bool,
    },

    /// Bookmark an episode
    Bookmark {
        episode: u64,

        /// Remove the bookmark instead
        #[arg(long)]
        unset: bool,
    },

    /// Remove a subscription and its episodes
    Remove {
        subscription: u64,

        /// Keep downloaded files on disk
        #[arg(long)]
        keep_files: bool,

        /// Only delete the downloaded files, keep the subscription
        #[arg(long, conflicts_with = "keep_files")]
        files_only: bool,
    },

    /// Refresh periodically until interrupted
    Watch {
        /// Minutes between refreshes (defaults to the configured interval)
        #[arg(long)]
        interval: Option<u64>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SortArg {
    Added,
    Name,
    Latest,
}

impl From<SortArg> for SubscriptionSort {
    fn from(sort: SortArg) -> Self {
        match sort {
            SortArg::Added => SubscriptionSort::DateAdded,
            SortArg::Name => SubscriptionSort::Name,
            SortArg::Latest => SubscriptionSort::LastEpisode,
        }
    }
}

/// Progress reporter using indicatif for terminal output
struct IndicatifReporter {
    multi: MultiProgress,
    bars: Mutex<HashMap<EpisodeId, ProgressBar>>,
    main_bar: ProgressBar,
}

impl IndicatifReporter {
    fn new() -> Self {
        let multi = MultiProgress::new();

        let main_style = ProgressStyle::default_bar()
            .template("{spinner:.green} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());

        let main_bar = multi.add(ProgressBar::new_spinner());
        main_bar.set_style(main_style);

        Self {
            multi,
            bars: Mutex::new(HashMap::new()),
            main_bar,
        }
    }

    fn status(&self, message: String) {
        self.main_bar.enable_steady_tick(Duration::from_millis(100));
        self.main_bar.set_message(message);
    }

    fn line(&self, message: String) {
        let _ = self.multi.println(message);
    }

    fn bars(&self) -> std::sync::MutexGuard<'_, HashMap<EpisodeId, ProgressBar>> {
        self.bars.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get_or_create_bar(&self, episode_id: EpisodeId) -> ProgressBar {
        let mut bars = self.bars();
        if let Some(bar) = bars.get(&episode_id) {
            return bar.clone();
        }

        let style = ProgressStyle::default_bar()
            .template(&format!(
                "  {DOWNLOAD}[{{bar:30.cyan/blue}}] {{bytes}}/{{total_bytes}} {{wide_msg}}"
            ))
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░");

        let bar = self.multi.add(ProgressBar::new(0));
        bar.set_style(style);
        bars.insert(episode_id, bar.clone());
        bar
    }

    fn finish_bar(&self, episode_id: EpisodeId) {
        if let Some(bar) = self.bars().remove(&episode_id) {
            bar.finish_and_clear();
        }
    }

    fn finish(&self) {
        for (_, bar) in self.bars().drain() {
            bar.finish_and_clear();
        }
        self.main_bar.finish_and_clear();
    }
}

impl ProgressReporter for IndicatifReporter {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::RefreshStarted { url, .. } => {
                self.status(format!("{SEARCH}Fetching feed: {}", url.cyan()));
            }

            ProgressEvent::RefreshCompleted {
                title,
                new_episodes,
                queued,
                ..
            } => {
                self.line(format!(
                    "{HEADPHONES}{} • {} new, {} queued",
                    title.bold().green(),
                    new_episodes.to_string().cyan(),
                    queued.to_string().yellow()
                ));
            }

            ProgressEvent::RefreshFailed {
                subscription_id,
                error,
            } => {
                self.line(format!(
                    "{FAILURE}Subscription {} - {}",
                    subscription_id.to_string().red(),
                    error.red()
                ));
            }

            ProgressEvent::DownloadQueued { .. } => {}

            ProgressEvent::DownloadStarting {
                episode_id,
                episode_title,
                content_length,
            } => {
                let bar = self.get_or_create_bar(episode_id);
                bar.set_length(content_length.unwrap_or(0));
                bar.set_position(0);
                bar.set_message(truncate_title(&episode_title, 40));
            }

            ProgressEvent::DownloadProgress {
                episode_id,
                bytes_downloaded,
                total_bytes,
            } => {
                let bar = self.get_or_create_bar(episode_id);
                if let Some(total) = total_bytes {
                    bar.set_length(total);
                }
                bar.set_position(bytes_downloaded);
            }

            ProgressEvent::DownloadCompleted {
                episode_id,
                episode_title,
                ..
            } => {
                self.finish_bar(episode_id);
                self.line(format!(
                    "  {SUCCESS}{}",
                    truncate_title(&episode_title, 60).green()
                ));
            }

            ProgressEvent::DownloadFailed {
                episode_id,
                episode_title,
                error,
            } => {
                self.finish_bar(episode_id);
                self.line(format!(
                    "  {FAILURE}{} - {}",
                    truncate_title(&episode_title, 30).red(),
                    error.red()
                ));
            }

            ProgressEvent::DownloadCancelled { episode_id } => {
                self.finish_bar(episode_id);
            }

            ProgressEvent::PartialFilesCleanedUp { count } => {
                self.line(format!(
                    "{BROOM}Removed {} unfinished download(s)",
                    count.to_string().yellow()
                ));
            }
        }
    }
}

fn truncate_title(title: &str, max_len: usize) -> String {
    if title.chars().count() <= max_len {
        title.to_string()
    } else {
        let head: String = title.chars().take(max_len.saturating_sub(3)).collect();
        format!("{head}...")
    }
}

fn status_label(status: DownloadStatus) -> colored::ColoredString {
    let label = status.to_string();
    match status {
        DownloadStatus::Downloaded => label.green(),
        DownloadStatus::Failed => label.red(),
        s if s.is_active() => label.yellow(),
        _ => label.dimmed(),
    }
}

fn print_episode(episode: &Episode) {
    let date = episode
        .published_at
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "----------".to_string());
    let played = if episode.played { "✓" } else { " " };
    let bookmark = if episode.bookmarked { "★" } else { " " };
    println!(
        "{:>6}  {}  {played}{bookmark}  {:<14}  {}",
        episode.id.to_string().cyan(),
        date.dimmed(),
        status_label(episode.status),
        episode.title
    );
}

/// Print refresh results; true if at least one subscription refreshed
fn print_refreshes(results: &[SubscriptionRefresh]) -> bool {
    let mut failures = Vec::new();
    for result in results {
        if let RefreshOutcome::Failed(failure) = &result.outcome {
            failures.push((result.subscription_id, failure.message.as_str()));
        }
    }

    if !failures.is_empty() {
        println!("\n{}", "Failed refreshes:".red().bold());
        for (id, message) in &failures {
            println!("  {CROSS}{} - {}", id.to_string().yellow(), message.dimmed());
        }
    }
    results.is_empty() || failures.len() < results.len()
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn run(library: &Library, config: &Config, command: Command) -> Result<()> {
    match command {
        Command::Add { url } => {
            if !is_url(url.trim()) {
                bail!("Only http(s) feed URLs are supported: {url}");
            }
            let added = library
                .add_subscription(&url)
                .await
                .with_context(|| format!("Failed to subscribe to {url}"))?;
            println!(
                "{HEADPHONES}Subscribed to {} (#{})",
                added.subscription.title.bold().green(),
                added.subscription.id
            );
            let refresh = added.refresh.wait().await;
            library.wait_idle().await;
            if !print_refreshes(std::slice::from_ref(&refresh)) {
                bail!("First refresh failed");
            }
            println!(
                "{FOLDER}Files: {}",
                config
                    .library_dir
                    .join(&added.subscription.storage_dir)
                    .display()
                    .to_string()
                    .cyan()
            );
        }

        Command::Refresh { subscription } => {
            let results = match subscription {
                Some(id) => vec![library.refresh_one(SubscriptionId(id)).wait().await],
                None => library
                    .refresh_all()
                    .await
                    .context("Failed to refresh subscriptions")?,
            };
            library.wait_idle().await;
            if !print_refreshes(&results) {
                bail!("No subscription could be refreshed");
            }
        }

        Command::List { sort, desc } => {
            let order = if desc { SortOrder::Desc } else { SortOrder::Asc };
            let subscriptions = library
                .list_subscriptions(sort.into(), order)
                .await
                .context("Failed to list subscriptions")?;
            if subscriptions.is_empty() {
                println!("No subscriptions yet. Add one with `podkeep add <url>`.");
            }
            for subscription in subscriptions {
                let refreshed = subscription
                    .last_refreshed_at
                    .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{:>4}  {}  {}  {}",
                    subscription.id.to_string().cyan(),
                    subscription.title.bold(),
                    refreshed.dimmed(),
                    subscription.feed_url.dimmed()
                );
            }
        }

        Command::Episodes {
            subscription,
            downloaded,
            unplayed,
        } => {
            let filter = EpisodeFilter {
                downloaded: if downloaded {
                    FlagFilter::Only
                } else {
                    FlagFilter::Any
                },
                played: if unplayed {
                    FlagFilter::Exclude
                } else {
                    FlagFilter::Any
                },
                ..Default::default()
            };
            let episodes = library
                .list_episodes(SubscriptionId(subscription), &filter)
                .await
                .context("Failed to list episodes")?;
            for episode in &episodes {
                print_episode(episode);
            }
        }

        Command::Download { episode } => {
            let id = EpisodeId(episode);
            match library.enqueue_one(id).await.context("Failed to queue episode")? {
                EnqueueOutcome::Queued(handle) => match handle.wait().await {
                    DownloadOutcome::Downloaded { path } => {
                        println!("{FOLDER}{}", path.display().to_string().cyan());
                    }
                    DownloadOutcome::Failed { reason } => bail!("Download failed: {reason}"),
                    DownloadOutcome::Cancelled => bail!("Download was cancelled"),
                },
                EnqueueOutcome::AlreadyActive => println!("Episode {id} is already being downloaded"),
                EnqueueOutcome::AlreadyDownloaded => println!("Episode {id} is already downloaded"),
            }
        }

        Command::DownloadAll { subscription } => {
            let queued = library
                .enqueue_all_undownloaded(SubscriptionId(subscription))
                .await
                .context("Failed to queue episodes")?;
            println!("{DOWNLOAD}Queued {} episode(s)", queued.to_string().cyan());
            library.wait_idle().await;
        }

        Command::DeleteFile { episode } => {
            let episode = library
                .delete_downloaded_file(EpisodeId(episode))
                .await
                .context("Failed to delete downloaded file")?;
            println!("{CROSS}Deleted the file of {}", episode.title.yellow());
        }

        Command::Played { episode, unset } => {
            let episode = library
                .set_played(EpisodeId(episode), !unset)
                .await
                .context("Failed to update episode")?;
            print_episode(&episode);
        }

        Command::Bookmark { episode, unset } => {
            let episode = library
                .set_bookmarked(EpisodeId(episode), !unset)
                .await
                .context("Failed to update episode")?;
            print_episode(&episode);
        }

        Command::Remove {
            subscription,
            keep_files,
            files_only,
        } => {
            let id = SubscriptionId(subscription);
            if files_only {
                let cleared = library
                    .delete_subscription_files(id)
                    .await
                    .context("Failed to delete downloaded files")?;
                println!("{CROSS}Deleted {} downloaded file(s)", cleared);
            } else {
                let mode = if keep_files {
                    DeleteMode::KeepFiles
                } else {
                    DeleteMode::WithFiles
                };
                let removed = library
                    .delete_subscription(id, mode)
                    .await
                    .context("Failed to remove subscription")?;
                println!("{CROSS}Removed {}", removed.title.yellow());
            }
        }

        Command::Watch { interval } => {
            let interval = interval
                .map(|minutes| Duration::from_secs(minutes.max(1) * 60))
                .unwrap_or_else(|| config.refresh_interval());
            println!(
                "{SEARCH}Refreshing every {} minute(s), press Ctrl+C to stop",
                (interval.as_secs() / 60).to_string().cyan()
            );
            let task = library.spawn_periodic_refresh(interval);
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl+C")?;
            println!("\nStopping...");
            library.shutdown().await;
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Periodic refresh task ended abnormally");
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    if !args.quiet {
        println!(
            "\n{}{} {}\n",
            MICROPHONE,
            "podkeep".bold().magenta(),
            "- Podcast Library".dimmed()
        );
    }

    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;

    let store = FileStore::open(config.state_file())
        .await
        .context("Failed to open library state")?;
    let client = ReqwestClient::from_config(&config.http).context("Failed to create HTTP client")?;

    let progress = (!args.quiet).then(|| Arc::new(IndicatifReporter::new()));
    let reporter: SharedProgressReporter = match &progress {
        Some(progress) => progress.clone() as SharedProgressReporter,
        None => NoopReporter::shared(),
    };

    let library = Library::open(&config, Arc::new(store), client.shared(), reporter)
        .await
        .context("Failed to open library")?;

    let result = run(&library, &config, args.command).await;
    library.shutdown().await;

    if let Some(progress) = progress {
        progress.finish();
    }
    result
}
