use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tenshi_core::{init_logging, AppDirs, Config, JsonFileStorage, MainLoop, TaskPool};
use tenshi_plugin::{AdapterContext, AdapterIdentity, AdapterRegistry, ExecTransport};
use thiserror::Error;

#[derive(Debug, Parser)]
#[command(name = "tenshi", version, about = "Content adapter host for Tenshi")]
struct Cli {
    /// Extra adapter directory to search (repeatable; added after configured ones)
    #[arg(long = "adapters-dir", global = true)]
    adapters_dirs: Vec<PathBuf>,
    /// Keep adapters bound after discovery (overrides config)
    #[arg(long, global = true)]
    auto_connect: bool,
    /// Seconds to wait for discovery and for a stream answer
    #[arg(long, global = true, default_value_t = 60)]
    timeout: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Content adapter commands
    #[command(subcommand)]
    Adapters(AdaptersCommand),
    /// Resolve a stream URI for one episode
    Resolve(ResolveCommand),
}

#[derive(Debug, Subcommand)]
enum AdaptersCommand {
    /// Discover installed adapters and list their identities
    List,
}

#[derive(Debug, Parser, Clone)]
struct ResolveCommand {
    /// Adapter unique name (falls back to the first adapter found)
    #[arg(long)]
    adapter: Option<String>,
    /// MyAnimeList id of the anime
    #[arg(long)]
    anime_id: u32,
    /// Episode number
    #[arg(long)]
    episode: u32,
    /// English title
    #[arg(long, default_value = "")]
    en_title: String,
    /// Japanese title
    #[arg(long, default_value = "")]
    jp_title: String,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("adapter discovery did not finish within {0:?}")]
    DiscoveryTimeout(Duration),
    #[error("no content adapters installed (searched: {0})")]
    NoAdapters(String),
    #[error("adapter '{0}' did not answer within {1:?}")]
    ResolveTimeout(String, Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AdapterRow {
    unique_name: String,
    display_name: String,
    api_version: i32,
    component: String,
}

impl AdapterRow {
    fn from_identity(identity: &AdapterIdentity) -> Self {
        Self {
            unique_name: identity.unique_name().to_string(),
            display_name: identity.display_name().to_string(),
            api_version: identity.api_version(),
            component: identity.component().to_string(),
        }
    }

    fn describe(&self) -> String {
        format!(
            "{} \"{}\" (api v{}, {})",
            self.unique_name, self.display_name, self.api_version, self.component
        )
    }
}

fn search_dirs(config: &Config, dirs: &AppDirs, extra: &[PathBuf]) -> Vec<PathBuf> {
    let mut out = config.adapters.search_dirs(dirs);
    for dir in extra {
        if !out.contains(dir) {
            out.push(dir.clone());
        }
    }
    out
}

fn describe_dirs(dirs: &[PathBuf]) -> String {
    dirs.iter()
        .map(|d| d.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn build_registry(
    config: &Config,
    dirs: &AppDirs,
    search: Vec<PathBuf>,
) -> Result<(MainLoop, AdapterRegistry)> {
    let main_loop = MainLoop::new();
    let transport = Arc::new(ExecTransport::new(search));
    let pool = Arc::new(TaskPool::new(config.adapters.worker_threads)?);
    let mut ctx = AdapterContext::new(transport, pool, Arc::new(main_loop.handle()))
        .with_connect_timeout(config.adapters.connect_timeout());

    if config.storage.enabled {
        let storage = JsonFileStorage::open(config.storage.path(dirs))?;
        ctx = ctx.with_storage(Arc::new(storage));
    }

    Ok((main_loop, AdapterRegistry::new(ctx)))
}

fn discover(
    main_loop: &MainLoop,
    registry: &AdapterRegistry,
    auto_connect: bool,
    timeout: Duration,
) -> Result<(), CliError> {
    let done = Arc::new(OnceLock::new());
    let flag = Arc::clone(&done);
    registry.discover(auto_connect);
    registry.on_discovery_complete(move || {
        let _ = flag.set(());
    });

    if main_loop.run_until(|| done.get().is_some(), timeout) {
        Ok(())
    } else {
        Err(CliError::DiscoveryTimeout(timeout))
    }
}

fn print_adapters(registry: &AdapterRegistry) {
    let rows: Vec<_> = registry.list().iter().map(AdapterRow::from_identity).collect();
    if rows.is_empty() {
        println!("No content adapters found.");
        return;
    }
    for row in rows {
        println!("{}", row.describe());
    }
}

fn resolve(
    main_loop: &MainLoop,
    registry: &AdapterRegistry,
    cmd: &ResolveCommand,
    timeout: Duration,
) -> Result<Option<String>, CliError> {
    let requested = cmd.adapter.as_deref().unwrap_or_default();
    let identity = registry
        .get_or_default(requested)
        .ok_or_else(|| CliError::NoAdapters(requested.to_string()))?;
    if !requested.is_empty() && identity.unique_name() != requested {
        tracing::warn!(
            requested = %requested,
            using = %identity.unique_name(),
            "adapter not found; using the first one"
        );
    }

    tracing::info!(
        adapter = %identity.unique_name(),
        anime_id = cmd.anime_id,
        episode = cmd.episode,
        "resolving stream"
    );
    let answer = Arc::new(OnceLock::new());
    let slot = Arc::clone(&answer);
    identity.request_stream_uri(
        cmd.anime_id,
        &cmd.en_title,
        &cmd.jp_title,
        cmd.episode,
        move |uri| {
            let _ = slot.set(uri);
        },
    );

    if !main_loop.run_until(|| answer.get().is_some(), timeout) {
        return Err(CliError::ResolveTimeout(
            identity.unique_name().to_string(),
            timeout,
        ));
    }
    Ok(answer.get().cloned().flatten())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let dirs = AppDirs::discover()?;
    dirs.ensure_exists()?;
    let config = Config::load_or_default(&dirs)?;
    let _logging = init_logging(&config.logging, &dirs)?;

    let timeout = Duration::from_secs(cli.timeout);
    let auto_connect = cli.auto_connect || config.adapters.auto_connect;
    let search = search_dirs(&config, &dirs, &cli.adapters_dirs);
    tracing::debug!(dirs = %describe_dirs(&search), "searching for content adapters");
    let searched = describe_dirs(&search);

    let (main_loop, registry) = build_registry(&config, &dirs, search)?;
    discover(&main_loop, &registry, auto_connect, timeout)?;

    let outcome = match &cli.command {
        Command::Adapters(AdaptersCommand::List) => {
            print_adapters(&registry);
            Ok(())
        }
        Command::Resolve(cmd) => {
            if registry.count() == 0 {
                Err(CliError::NoAdapters(searched))
            } else {
                resolve(&main_loop, &registry, cmd, timeout).map(|uri| match uri {
                    Some(uri) => println!("{uri}"),
                    None => println!("no stream found"),
                })
            }
        }
    };

    registry.shutdown();
    // Let pending main-loop work (late callbacks) drain before exiting.
    main_loop.run_pending();
    Ok(outcome?)
}
