use std::collections::HashMap;
use std::env;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use labspace::api::{AppState, DEFAULT_IDENTITY_HEADER, create_router};
use labspace::container::{ContainerRuntime, RuntimeType};
use labspace::session::{
    AddressMode, AppCatalog, AppSettings, AppType, BuilderContext, ConfigError,
    HttpSessionReadiness, ReadinessSettings, SessionRegistry, SessionSettings,
};

const APP_NAME: &str = "labspace";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    handle_serve(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("config file: {}", ctx.paths.config_file.display());

    match cli.command {
        Command::Serve(cmd) => async_main(ctx, cmd),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Labspace - per-user RStudio, Jupyter, VS Code and operations sessions in containers.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the session server
    Serve(ServeCommand),
    /// Create config directories and default files
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to (overrides server.host)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides server.port)
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&paths, &common)?;
        Ok(Self {
            common,
            paths,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={level},tower_http={level}")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_ansi(!disable_color))
                .try_init()
                .ok();
        }

        // Library code logs through the `log` facade.
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => LevelFilter::Info,
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self { config_file })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    server: ServerConfig,
    container: ContainerRuntimeConfig,
    sessions: SessionsConfig,
    apps: AppsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ServerConfig {
    host: String,
    port: u16,
    /// Maximum proxied request body in megabytes.
    max_proxy_body_mb: usize,
    /// Trusted header carrying the caller's user id.
    identity_header: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_proxy_body_mb: 100,
            identity_header: DEFAULT_IDENTITY_HEADER.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ContainerRuntimeConfig {
    /// Container runtime type: "docker" or "podman" (auto-detected if not set)
    runtime: Option<RuntimeType>,
    /// Custom path to the container runtime binary
    binary: Option<String>,
    /// Network session containers join
    network: Option<String>,
    name_prefix: String,
    stop_timeout_seconds: u32,
}

impl Default for ContainerRuntimeConfig {
    fn default() -> Self {
        Self {
            runtime: None,
            binary: None,
            network: None,
            name_prefix: "labspace-".to_string(),
            stop_timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct SessionsConfig {
    port_range_start: u16,
    /// Exclusive.
    port_range_end: u16,
    address_mode: AddressMode,
    readiness_timeout_seconds: u64,
    readiness_initial_backoff_ms: u64,
    readiness_max_backoff_ms: u64,
    /// 0 disables periodic reconciliation.
    reconcile_interval_seconds: u64,
    agent_path: String,
    delete_on_shutdown: bool,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            port_range_start: 30000,
            port_range_end: 31000,
            address_mode: AddressMode::Published,
            readiness_timeout_seconds: 120,
            readiness_initial_backoff_ms: 250,
            readiness_max_backoff_ms: 5000,
            reconcile_interval_seconds: 30,
            agent_path: "/usr/local/bin/labspace-agent".to_string(),
            delete_on_shutdown: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct AppsConfig {
    operations: AppSettings,
    rstudio: AppSettings,
    jupyter: AppSettings,
    vscode: AppSettings,
}

impl Default for AppsConfig {
    fn default() -> Self {
        Self {
            operations: AppSettings::defaults_for(AppType::Operations),
            rstudio: AppSettings::defaults_for(AppType::Rstudio),
            jupyter: AppSettings::defaults_for(AppType::Jupyter),
            vscode: AppSettings::defaults_for(AppType::Vscode),
        }
    }
}

impl AppsConfig {
    fn by_type(&self) -> HashMap<AppType, AppSettings> {
        HashMap::from([
            (AppType::Operations, self.operations.clone()),
            (AppType::Rstudio, self.rstudio.clone()),
            (AppType::Jupyter, self.jupyter.clone()),
            (AppType::Vscode, self.vscode.clone()),
        ])
    }
}

impl AppConfig {
    fn session_settings(&self) -> Result<SessionSettings, ConfigError> {
        let sessions = &self.sessions;
        if sessions.port_range_start >= sessions.port_range_end {
            return Err(ConfigError::InvalidSettings(format!(
                "empty port range {}..{}",
                sessions.port_range_start, sessions.port_range_end
            )));
        }
        if sessions.agent_path.trim().is_empty() {
            return Err(ConfigError::InvalidSettings(
                "agent_path cannot be empty".to_string(),
            ));
        }

        Ok(SessionSettings {
            port_range: sessions.port_range_start..sessions.port_range_end,
            address_mode: sessions.address_mode,
            agent_path: sessions.agent_path.clone(),
            stop_timeout_seconds: self.container.stop_timeout_seconds,
            name_prefix: self.container.name_prefix.clone(),
            max_proxy_body_bytes: self.server.max_proxy_body_mb * 1024 * 1024,
            readiness: ReadinessSettings {
                timeout: Duration::from_secs(sessions.readiness_timeout_seconds),
                initial_backoff: Duration::from_millis(sessions.readiness_initial_backoff_ms),
                max_backoff: Duration::from_millis(sessions.readiness_max_backoff_ms),
            },
        })
    }

    fn builder_context(&self) -> BuilderContext {
        BuilderContext {
            name_prefix: self.container.name_prefix.clone(),
            network: self.container.network.clone(),
        }
    }
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !cmd.force {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }

    if ctx.common.dry_run {
        info!(
            "dry-run: would write default config to {}",
            ctx.paths.config_file.display()
        );
        return Ok(());
    }

    write_default_config(&ctx.paths.config_file)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else {
                println!(
                    "{}",
                    toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
                );
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            write_default_config(&ctx.paths.config_file)
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

fn build_container_runtime(config: &ContainerRuntimeConfig) -> ContainerRuntime {
    match (&config.runtime, &config.binary) {
        (Some(rt), Some(binary)) => ContainerRuntime::with_binary(*rt, binary.clone()),
        (Some(rt), None) => ContainerRuntime::with_type(*rt),
        (None, Some(binary)) => ContainerRuntime::with_binary(RuntimeType::default(), binary.clone()),
        (None, None) => ContainerRuntime::new(),
    }
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    let config = &ctx.config;
    let settings = config
        .session_settings()
        .context("invalid session settings")?;

    let runtime = build_container_runtime(&config.container);
    match runtime.health_check().await {
        Ok(_) => info!(
            "Using container runtime {} ({})",
            runtime.runtime_type(),
            config.container.binary.as_deref().unwrap_or("default binary")
        ),
        Err(e) => warn!(
            "Container runtime {} is not healthy: {}",
            runtime.runtime_type(),
            e
        ),
    }

    let catalog = AppCatalog::new(&config.apps.by_type(), config.builder_context());
    let readiness = HttpSessionReadiness::new(settings.readiness);
    info!(
        "Sessions use proxy ports {}..{} ({:?} addressing)",
        settings.port_range.start, settings.port_range.end, settings.address_mode
    );
    let registry = Arc::new(SessionRegistry::new(
        Arc::new(runtime),
        Arc::new(readiness),
        catalog,
        settings,
    ));

    match registry.cleanup_orphans().await {
        Ok(0) => debug!("No orphan containers found"),
        Ok(n) => info!("Removed {} orphan container(s)", n),
        Err(e) => warn!("Orphan cleanup failed: {}", e),
    }

    let reconcile_task = spawn_reconcile_task(
        registry.clone(),
        config.sessions.reconcile_interval_seconds,
    );

    let state =
        AppState::new(registry.clone()).with_identity_header(config.server.identity_header.clone());
    let app = create_router(state);

    let host = cmd.host.unwrap_or_else(|| config.server.host.clone());
    let port = cmd.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", host, port))?;
    info!("Listening on http://{}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .context("binding to address")?;

    let delete_on_shutdown = config.sessions.delete_on_shutdown;
    let registry_for_shutdown = registry.clone();

    let shutdown_signal = async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        info!("Shutdown signal received");
        if let Some(task) = reconcile_task {
            task.abort();
        }

        if delete_on_shutdown {
            let stopped = registry_for_shutdown.shutdown_all().await;
            info!("Stopped {} session(s)", stopped);
        } else {
            info!("Leaving sessions running");
        }

        info!("Shutdown complete");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("running server")?;

    Ok(())
}

fn spawn_reconcile_task(
    registry: Arc<SessionRegistry>,
    interval_seconds: u64,
) -> Option<tokio::task::JoinHandle<()>> {
    if interval_seconds == 0 {
        info!("Periodic reconciliation disabled");
        return None;
    }

    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_seconds));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately.
        interval.tick().await;

        loop {
            interval.tick().await;
            match registry.reconcile().await {
                Ok(removed) if removed.is_empty() => {}
                Ok(removed) => info!("Reconciled away session(s): {}", removed.join(", ")),
                Err(e) => error!("Reconciliation failed: {}", e),
            }
        }
    }))
}

fn load_or_init_config(paths: &AppPaths, common: &CommonOpts) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        if common.dry_run {
            info!(
                "dry-run: would create default config at {}",
                paths.config_file.display()
            );
        } else {
            write_default_config(&paths.config_file)?;
        }
    }

    let env_prefix = env_prefix();
    let built = Config::builder()
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8080_i64)?
        .set_default("sessions.port_range_start", 30000_i64)?
        .set_default("sessions.port_range_end", 31000_i64)?
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(env_prefix.as_str()).separator("__"))
        .build()?;

    let mut config: AppConfig = built.try_deserialize()?;

    if let Some(ref binary) = config.container.binary {
        let expanded = expand_str_path(binary)?;
        config.container.binary = Some(expanded.display().to_string());
    }

    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push('\n');
    buffer.push('\n');
    buffer
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        let mut path = PathBuf::from(dir);
        path.push(APP_NAME);
        return Ok(path);
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
