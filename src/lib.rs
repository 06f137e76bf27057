use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use gitaly_config::{Config, LogFormat, LoggingConfig};
use gitaly_server::{Dependencies, GitalyServer};
use tracing::info;
use tracing_subscriber::EnvFilter;

const ENV_CONFIG_PATH: &str = "GITALY_CONFIG";

/// `fetch --no-write-fetch-head` arrived in 2.29, after transactional
/// `update-ref --stdin` in 2.27.
const MIN_GIT_VERSION: (u32, u32) = (2, 29);

pub async fn run_from_args<I>(args: I) -> Result<()>
where
    I: IntoIterator<Item = String>,
{
    let Some(args) = CliArgs::parse(args, env::var_os(ENV_CONFIG_PATH).map(PathBuf::from))? else {
        print_usage();
        return Ok(());
    };
    let config = load_config(&args.config_path)?;
    init_logging(&config.logging)?;

    let listen_addr = config
        .listen_addr
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid `listen_addr`: `{}`", config.listen_addr))?;
    let git_version = ensure_git_version()?;
    let dependencies = Arc::new(build_dependencies(&config));
    info!(
        %git_version,
        %listen_addr,
        storages = config.storages.len(),
        "starting gitaly-ops"
    );

    GitalyServer::build_router_with_dependencies(dependencies)
        .serve_with_shutdown(listen_addr, async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received Ctrl-C, shutting down");
            }
        })
        .await
        .context("gRPC server exited with error")
}

pub async fn run_from_env() -> Result<()> {
    run_from_args(env::args()).await
}

pub fn load_config(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file `{}`", path.display()))?;
    Config::from_toml(&raw).with_context(|| format!("failed to parse config `{}`", path.display()))
}

/// `RUST_LOG` wins over the configured level when set.
fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .context("invalid log filter")?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match logging.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|err| anyhow!("failed to install log subscriber: {err}"))
}

pub fn build_dependencies(config: &Config) -> Dependencies {
    let storage_paths = config
        .storages
        .iter()
        .map(|storage| (storage.name.clone(), PathBuf::from(&storage.path)))
        .collect();

    Dependencies::new(storage_paths).with_hooks(
        config.hooks.custom_hooks_dir.as_ref().map(PathBuf::from),
        Duration::from_secs(config.hooks.timeout_secs),
    )
}

/// Refuses to start on a git too old for the plumbing the services run.
fn ensure_git_version() -> Result<String> {
    let output = Command::new("git")
        .arg("--version")
        .output()
        .context("failed to run `git --version`")?;
    if !output.status.success() {
        bail!("`git --version` exited with {}", output.status);
    }

    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let (major, minor) = parse_git_version(&version)
        .ok_or_else(|| anyhow!("unrecognized git version `{version}`"))?;
    if (major, minor) < MIN_GIT_VERSION {
        bail!(
            "git {major}.{minor} is too old, at least {}.{} is required",
            MIN_GIT_VERSION.0,
            MIN_GIT_VERSION.1
        );
    }
    Ok(version)
}

fn parse_git_version(raw: &str) -> Option<(u32, u32)> {
    let rest = raw.trim().strip_prefix("git version ")?;
    let mut parts = rest.split(|c: char| !c.is_ascii_digit());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliArgs {
    config_path: PathBuf,
}

impl CliArgs {
    /// `None` when help was requested.
    fn parse<I>(args: I, env_config: Option<PathBuf>) -> Result<Option<Self>>
    where
        I: IntoIterator<Item = String>,
    {
        let mut iter = args.into_iter();
        let _program_name = iter.next();

        let mut config_path = env_config;
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--help" | "-h" => return Ok(None),
                "--config" => {
                    let value = iter
                        .next()
                        .ok_or_else(|| anyhow!("missing value for `--config`"))?;
                    config_path = Some(PathBuf::from(value));
                }
                _ => return Err(anyhow!("unknown argument `{arg}`")),
            }
        }

        let config_path = config_path.ok_or_else(|| {
            anyhow!("missing config path; pass `--config <path>` or set `{ENV_CONFIG_PATH}`")
        })?;
        Ok(Some(Self { config_path }))
    }
}

fn print_usage() {
    eprintln!("usage: gitaly-ops --config <path>\nenv:\n  {ENV_CONFIG_PATH}=<path>");
}
