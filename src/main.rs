//! rune-exec - debugging surface of the Rune executor
//!
//! Also serves as the `get-user-info` helper that Windows build steps run
//! inside the image to map an account name to its SID.

use anyhow::Context;
use clap::{Parser, Subcommand};
use rune_executor::config::ExecutorConfig;
use rune_executor::executor::{NetworkNamespace, RunRequest, SecurityMode};
use rune_executor::identity::{lookup_user, IdentityRecord};
use rune_executor::mount::MountSet;
use rune_executor::network::HostNetworkFiles;
use rune_executor::platform::{Platform, SpecContext, UnixPlatform};
use rune_executor::release::ReleaseChain;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Rune executor tools
#[derive(Parser)]
#[command(name = "rune-exec")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Inspect how Rune runs build steps", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Executor configuration file (JSON or YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a user against the image database of a root filesystem
    ResolveUser {
        /// Root filesystem of the image
        #[arg(long)]
        rootfs: PathBuf,
        /// User reference (name, uid or uid:gid)
        #[arg(short, long, default_value = "")]
        user: String,
    },

    /// Print the spec a build step would run with
    Spec {
        /// Root filesystem of the image
        #[arg(long)]
        rootfs: PathBuf,
        /// User reference
        #[arg(short, long, default_value = "")]
        user: String,
        /// Working directory
        #[arg(short, long, default_value = "/")]
        workdir: String,
        /// Environment variable (KEY=VALUE)
        #[arg(short, long)]
        env: Vec<String>,
        /// Hostname of the container
        #[arg(long, default_value = "")]
        hostname: String,
        /// Allocate a terminal
        #[arg(short, long)]
        tty: bool,
        /// Mount the root filesystem read-only
        #[arg(long)]
        readonly: bool,
        /// Run with every capability
        #[arg(long)]
        insecure: bool,
        /// Share the host network namespace
        #[arg(long)]
        host_network: bool,
        /// Command to run
        #[arg(trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Print the identity record of an account of the running system
    #[command(name = "get-user-info")]
    GetUserInfo {
        /// Account name
        name: String,
    },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ExecutorConfig> {
    match path {
        Some(path) => ExecutorConfig::load(path).with_context(|| format!("loading {}", path.display())),
        None => Ok(ExecutorConfig::default()),
    }
}

#[cfg(windows)]
fn user_info(name: &str) -> rune_executor::Result<IdentityRecord> {
    use rune_executor::identity::{builtin_windows_identity, lookup_account_sid, ResolvedIdentity};

    let identity = match builtin_windows_identity(name) {
        Some(identity) => identity,
        None => ResolvedIdentity::sid(&lookup_account_sid(name)?, name),
    };
    Ok(IdentityRecord::from(&identity))
}

#[cfg(not(windows))]
fn user_info(name: &str) -> rune_executor::Result<IdentityRecord> {
    let identity = lookup_user(Path::new("/"), name)?;
    Ok(IdentityRecord::from(&identity))
}

fn print_spec(config: &ExecutorConfig, rootfs: &Path, request: &RunRequest) -> anyhow::Result<()> {
    let identity = lookup_user(rootfs, &request.user)
        .with_context(|| format!("resolving user {:?}", request.user))?;
    let network = HostNetworkFiles::new(config.net_dir(), config.host_resolv_conf.clone());
    let mounts = MountSet::default();

    let ctx = SpecContext {
        id: "inspect",
        request,
        identity: &identity,
        mounts: &mounts,
        config,
        network: &network,
    };
    let mut chain = ReleaseChain::new();
    let spec = UnixPlatform.build_spec(&ctx, &mut chain)?;
    println!("{}", serde_json::to_string_pretty(&spec)?);

    chain.release_all();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The helper's stdout is parsed by the host, so logs go to stderr
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::ResolveUser { rootfs, user } => {
            let identity = lookup_user(&rootfs, &user)?;
            println!("{}", serde_json::to_string_pretty(&identity)?);
        }

        Commands::Spec {
            rootfs,
            user,
            workdir,
            env,
            hostname,
            tty,
            readonly,
            insecure,
            host_network,
            command,
        } => {
            let config = load_config(cli.config.as_deref())?;

            let mut request = RunRequest::new(command)
                .user(&user)
                .cwd(&workdir)
                .hostname(&hostname)
                .tty(tty)
                .readonly_rootfs(readonly);
            for entry in env {
                let (key, value) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
                request = request.env(key, value);
            }
            if insecure {
                request = request.security_mode(SecurityMode::Insecure);
            }
            if host_network {
                request = request.network(NetworkNamespace::Host);
            }

            print_spec(&config, &rootfs, &request)?;
        }

        Commands::GetUserInfo { name } => {
            let record = user_info(&name).with_context(|| format!("getting user info for {}", name))?;
            println!("{}", serde_json::to_string(&record)?);
        }
    }

    Ok(())
}
