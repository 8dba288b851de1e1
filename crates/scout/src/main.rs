use std::env;
use std::fmt;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use colored::Colorize;
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, debug, info, warn};
use scout::admission::Admission;
use scout::agent::{
    AgentLoop, ModelCatalog, OpenAiCatalog, OpenAiConfig, OpenAiLoop, ScriptedLoop,
    StaticCatalog, ToolBox,
};
use scout::api::{self, AppState};
use scout::client::{self, ChannelClient, TurnOutcome};
use scout_protocol::{Highlight, Rendering, Segment, Severity, TurnUpdate, TurnView, render};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

const APP_NAME: &str = "scout";

/// Environment variable consulted when `agent.api_key` is not set.
const API_KEY_ENV: &str = "SCOUT_LLM_API_KEY";

/// Pause between chunks of the echo provider.
const ECHO_CHUNK_DELAY: Duration = Duration::from_millis(40);

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

#[tokio::main]
async fn async_client(ctx: RuntimeContext, cmd: ClientCommand) -> Result<()> {
    match cmd {
        ClientCommand::Ask(cmd) => handle_ask(&ctx, cmd).await,
        ClientCommand::Models(cmd) => handle_models(&ctx, cmd).await,
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Serve(cmd) => async_main(ctx, cmd),
        Command::Ask(cmd) => async_client(ctx, ClientCommand::Ask(cmd)),
        Command::Models(cmd) => async_client(ctx, ClientCommand::Models(cmd)),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Scout - real-time research agent server and client.",
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
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Assume "yes" for interactive prompts
    #[arg(short = 'y', long = "yes", global = true)]
    assume_yes: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP and WebSocket server
    Serve(ServeCommand),
    /// Ask a running server a question and stream the answer
    Ask(AskCommand),
    /// List the models a running server offers
    Models(ModelsCommand),
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

enum ClientCommand {
    Ask(AskCommand),
    Models(ModelsCommand),
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to (overrides server.host)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides server.port)
    #[arg(short, long)]
    port: Option<u16>,
    /// Agent provider (overrides agent.provider)
    #[arg(long, value_enum)]
    provider: Option<Provider>,
}

#[derive(Debug, Clone, Args)]
struct AskCommand {
    /// The question to ask
    #[arg(required = true, num_args = 1.., value_name = "QUERY")]
    query: Vec<String>,
    /// Server URL
    #[arg(long, default_value = "ws://127.0.0.1:8000", env = "SCOUT_URL")]
    url: String,
    /// Model to use instead of the server default
    #[arg(short, long)]
    model: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct ModelsCommand {
    /// Server URL
    #[arg(long, default_value = "ws://127.0.0.1:8000", env = "SCOUT_URL")]
    url: String,
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

        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "scout={level},scout_protocol={level},tower_http={level}"
            ))
        });

        let file_layer = match self.config.logging.file.as_deref() {
            Some(path) => {
                let file = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("opening log file {path}"))?;
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
            }
            None => None,
        };

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(tracing_subscriber::fmt::layer().with_ansi(self.stderr_color()))
                .try_init()
                .ok();
        }

        // Also init env_logger for compatibility with log crate users
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
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn color_enabled(&self, is_terminal: bool) -> bool {
        let force_color =
            matches!(self.common.color, ColorOption::Always) || env::var_os("FORCE_COLOR").is_some();
        let disable_color = self.common.no_color
            || matches!(self.common.color, ColorOption::Never)
            || env::var_os("NO_COLOR").is_some()
            || (!force_color && !is_terminal);
        !disable_color
    }

    fn stderr_color(&self) -> bool {
        self.color_enabled(io::stderr().is_terminal())
    }

    fn stdout_color(&self) -> bool {
        self.color_enabled(io::stdout().is_terminal())
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

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config: {}", self.config_file.display())
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    server: ServerConfig,
    agent: AgentConfig,
    limits: LimitsConfig,
    logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ServerConfig {
    host: String,
    port: u16,
    /// Origins allowed by CORS. Empty allows any origin.
    cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            cors_origins: vec![
                "http://localhost:8000".to_string(),
                "http://127.0.0.1:8000".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
enum Provider {
    /// OpenAI-compatible chat completions with web tools
    #[default]
    #[value(name = "openai")]
    OpenAi,
    /// Offline loop that echoes the query
    Echo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct AgentConfig {
    provider: Provider,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    /// Allowed models; empty allows any.
    models: Vec<String>,
    max_steps: usize,
    /// Read the top search results without waiting for the model to ask.
    autonomous: bool,
    follow_up_urls: usize,
    request_timeout_secs: u64,
    search_max_results: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            provider: Provider::OpenAi,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            default_model: "gpt-4o-mini".to_string(),
            models: Vec::new(),
            max_steps: 8,
            autonomous: true,
            follow_up_urls: 3,
            request_timeout_secs: 60,
            search_max_results: 5,
        }
    }
}

impl AgentConfig {
    fn openai_config(&self) -> OpenAiConfig {
        OpenAiConfig {
            base_url: self.base_url.clone(),
            api_key: resolve_api_key(self.api_key.clone(), env::var(API_KEY_ENV).ok()),
            default_model: self.default_model.clone(),
            models: self.models.clone(),
            max_steps: self.max_steps,
            autonomous: self.autonomous,
            follow_up_urls: self.follow_up_urls,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LimitsConfig {
    /// Queries per client address per minute; 0 disables.
    max_requests_per_minute: usize,
    max_query_chars: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: 60,
            max_query_chars: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
    file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

fn resolve_api_key(configured: Option<String>, from_env: Option<String>) -> Option<String> {
    configured
        .filter(|key| !key.trim().is_empty())
        .or_else(|| from_env.filter(|key| !key.trim().is_empty()))
}

// ============================================================================
// Commands
// ============================================================================

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !(cmd.force || ctx.common.assume_yes) {
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
            } else if ctx.common.yaml {
                println!(
                    "{}",
                    serde_yaml::to_string(&ctx.config).context("serializing config to YAML")?
                );
            } else {
                println!("{:#?}", ctx.config);
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

fn build_agent(
    config: &AgentConfig,
    provider: Provider,
) -> Result<(Arc<dyn AgentLoop>, Arc<dyn ModelCatalog>)> {
    match provider {
        Provider::Echo => {
            info!("Using echo agent provider");
            Ok((
                Arc::new(ScriptedLoop::echo(ECHO_CHUNK_DELAY)),
                Arc::new(StaticCatalog::echo()),
            ))
        }
        Provider::OpenAi => {
            let openai = config.openai_config();
            if openai.api_key.is_none() {
                warn!("No API key configured (agent.api_key or {API_KEY_ENV})");
            }
            info!(
                "Using OpenAI-compatible provider at {} (default model {})",
                openai.base_url, openai.default_model
            );

            let tools = ToolBox::new(
                Duration::from_secs(config.request_timeout_secs),
                config.search_max_results,
            )
            .context("building tool HTTP client")?;
            let agent = OpenAiLoop::new(openai.clone(), tools).context("configuring agent loop")?;
            let catalog = OpenAiCatalog::new(openai).context("configuring model catalog")?;
            Ok((Arc::new(agent), Arc::new(catalog)))
        }
    }
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    let host = cmd.host.unwrap_or_else(|| ctx.config.server.host.clone());
    let port = cmd.port.unwrap_or(ctx.config.server.port);
    let provider = cmd.provider.unwrap_or(ctx.config.agent.provider);

    let (agent, models) = build_agent(&ctx.config.agent, provider)?;
    let limits = &ctx.config.limits;
    let admission = Admission::new(limits.max_requests_per_minute, limits.max_query_chars);

    let state = AppState::new(agent, models, admission)
        .with_cors_origins(ctx.config.server.cors_origins.clone());
    let sessions = state.sessions.clone();
    let app = api::create_router(state);

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("parsing listen address {host}:{port}"))?;

    if ctx.common.dry_run {
        info!("dry-run: would listen on {addr}");
        return Ok(());
    }

    info!("Listening on http://{}", addr);
    info!("Agent channel at ws://{}/ws", addr);

    let listener = TcpListener::bind(addr)
        .await
        .context("binding to address")?;

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

        info!("Shutdown signal received, closing channels...");
        let cancelled = sessions.cancel_all();
        if cancelled == 0 {
            info!("No open channels");
        } else {
            info!("Cancelled {} session(s)", cancelled);
        }
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await
    .context("running server")?;

    info!("Shutdown complete");
    Ok(())
}

async fn handle_ask(ctx: &RuntimeContext, cmd: AskCommand) -> Result<()> {
    let query = cmd.query.join(" ");
    let mut channel = ChannelClient::connect(&cmd.url, cmd.model.as_deref())
        .await
        .with_context(|| format!("connecting to {}", cmd.url))?;

    let machine_output = ctx.common.json || ctx.common.yaml;
    let mut printer = AnswerPrinter::new(ctx.stdout_color(), ctx.stderr_color());

    let outcome = channel
        .ask(&query, |view, update| {
            if !machine_output {
                printer.on_update(view, update);
            }
        })
        .await
        .context("running query")?;

    if let Err(e) = channel.close().await {
        debug!("closing channel: {e}");
    }

    let answer = match outcome {
        TurnOutcome::Completed(answer) => answer,
        TurnOutcome::Failed(message) => bail!("{message}"),
    };

    if ctx.common.json {
        let body = serde_json::json!({ "query": query, "answer": answer });
        println!(
            "{}",
            serde_json::to_string_pretty(&body).context("serializing answer to JSON")?
        );
    } else if ctx.common.yaml {
        let body = serde_json::json!({ "query": query, "answer": answer });
        println!(
            "{}",
            serde_yaml::to_string(&body).context("serializing answer to YAML")?
        );
    } else {
        printer.finish(render(&answer));
    }
    Ok(())
}

async fn handle_models(ctx: &RuntimeContext, cmd: ModelsCommand) -> Result<()> {
    let list = client::fetch_models(&cmd.url)
        .await
        .with_context(|| format!("fetching models from {}", cmd.url))?;

    if ctx.common.json {
        let body = serde_json::json!({ "models": list.models, "default": list.default });
        println!(
            "{}",
            serde_json::to_string_pretty(&body).context("serializing models to JSON")?
        );
        return Ok(());
    }

    for model in &list.models {
        if list.default.as_deref() == Some(model.as_str()) {
            println!("{model} (default)");
        } else {
            println!("{model}");
        }
    }
    Ok(())
}

// ============================================================================
// Terminal output
// ============================================================================

/// Streams committed answer lines to stdout and tool status to stderr.
struct AnswerPrinter {
    color: bool,
    status_color: bool,
    printed_segments: usize,
}

impl AnswerPrinter {
    fn new(color: bool, status_color: bool) -> Self {
        Self {
            color,
            status_color,
            printed_segments: 0,
        }
    }

    fn on_update(&mut self, view: &TurnView, update: &TurnUpdate) {
        match update {
            TurnUpdate::ToolStatus(status) => {
                if self.status_color {
                    eprintln!("{}", status.bright_black());
                } else {
                    eprintln!("{status}");
                }
            }
            TurnUpdate::Rejected(message) => {
                if self.status_color {
                    eprintln!("{}", message.yellow());
                } else {
                    eprintln!("{message}");
                }
            }
            TurnUpdate::Content(_) => {
                let rendering = view.assembler().render();
                self.print_committed(&rendering.committed);
            }
            _ => {}
        }
    }

    /// Print whatever is left of the final rendering.
    fn finish(&mut self, rendering: Rendering) {
        self.print_committed(&rendering.committed);
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{}", rendering.pending);
        let _ = stdout.flush();
    }

    fn print_committed(&mut self, committed: &[Segment]) {
        if committed.len() <= self.printed_segments {
            return;
        }
        let mut stdout = io::stdout().lock();
        for segment in &committed[self.printed_segments..] {
            let _ = write!(stdout, "{}", paint(segment, self.color));
        }
        let _ = stdout.flush();
        self.printed_segments = committed.len();
    }
}

fn paint(segment: &Segment, color: bool) -> String {
    if !color {
        return segment.text.clone();
    }
    let text = segment.text.as_str();
    match segment.highlight {
        Highlight::Plain => text.to_string(),
        Highlight::Timestamp => text.cyan().to_string(),
        Highlight::Severity(Severity::Critical) => text.bright_red().bold().to_string(),
        Highlight::Severity(Severity::Error) => text.red().to_string(),
        Highlight::Severity(Severity::Warning) => text.yellow().to_string(),
        Highlight::Severity(Severity::Info) => text.green().to_string(),
        Highlight::Severity(Severity::Debug) => text.bright_black().to_string(),
    }
}

// ============================================================================
// Config helpers
// ============================================================================

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
        .set_default("logging.level", "info")?
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(env_prefix.as_str()).separator("__"))
        .build()?;

    let mut config: AppConfig = built.try_deserialize()?;

    if let Some(ref file) = config.logging.file {
        let expanded = expand_str_path(file)?;
        config.logging.file = Some(expanded.display().to_string());
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
    buffer.push_str("# The API key may also be provided via ");
    buffer.push_str(API_KEY_ENV);
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
