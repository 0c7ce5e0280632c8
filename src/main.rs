//! Tracegate - CLI entry point
//!
//! Builds the dispatcher from flags and an optional YAML config file, sets
//! up the notification FIFO, and prints the listen address so the external
//! supervisor can point the tracer at it.

// Use mimalloc as global allocator for better p99 latency
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use std::path::PathBuf;
use tracegate::config::{FileConfig, IpList, ProxyConfig, ProxyMode, Socks5Auth};
use tracegate::{Dispatcher, VERSION};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tracegate")]
#[command(version = VERSION)]
#[command(about = "Local proxy dispatcher for syscall-traced redirection")]
struct Args {
    /// Path to the configuration file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Path of the notification FIFO (created if missing)
    #[arg(short = 'f', long = "pipe")]
    pipe: Option<PathBuf>,

    /// SOCKS5 address [default: 127.0.0.1:1080 unless set in the config file]
    #[arg(long = "socks5")]
    socks5: Option<String>,

    /// SOCKS5 username
    #[arg(long = "socks5-username")]
    socks5_username: Option<String>,

    /// SOCKS5 password
    #[arg(long = "socks5-password")]
    socks5_password: Option<String>,

    /// HTTP proxy address, e.g.: 127.0.0.1:8080
    #[arg(long = "http-proxy")]
    http_proxy: Option<String>,

    /// Mode for selecting a proxy [auto | random | only_http_proxy | only_socks5 | direct]
    #[arg(long = "select-proxy-mode")]
    select_proxy_mode: Option<String>,

    /// IPs in this file will connect directly
    #[arg(short = 'b', long = "blackip-file")]
    blackip_file: Option<PathBuf>,

    /// Only destinations in this file are proxied
    #[arg(short = 'w', long = "whiteip-file")]
    whiteip_file: Option<PathBuf>,

    /// Redirect loopback destinations too instead of connecting direct
    #[arg(short = 'n', long = "not-ignore-local")]
    not_ignore_local: bool,
}

fn build_config(args: &Args, file: &FileConfig) -> anyhow::Result<ProxyConfig> {
    let mut config = ProxyConfig::from_file_config(file)?;

    // A CLI flag overrides the file; the file only fills unset flags
    if let Some(ref mode) = args.select_proxy_mode {
        config.mode = ProxyMode::try_from(mode.as_str())?;
    }
    if let Some(ref addr) = args.socks5 {
        config.socks5 = Some(addr.parse()?);
    } else if config.socks5.is_none() {
        config.socks5 = Some("127.0.0.1:1080".parse()?);
    }
    if let (Some(user), Some(pass)) = (&args.socks5_username, &args.socks5_password) {
        config.socks5_auth = Some(Socks5Auth {
            username: user.clone(),
            password: pass.clone(),
        });
    }
    if let Some(ref addr) = args.http_proxy {
        config.http_proxy = Some(addr.parse()?);
    }
    if let Some(ref path) = args.blackip_file {
        config.blacklist = IpList::load(path)?;
    }
    if let Some(ref path) = args.whiteip_file {
        config.whitelist = IpList::load(path)?;
    }
    if args.not_ignore_local {
        config.bypass_local = false;
    }

    config.validate()?;
    Ok(config)
}

/// Default filter directive for our own events; `RUST_LOG` still wins.
fn log_directive(file: &FileConfig) -> String {
    format!("tracegate={}", file.log_level.as_deref().unwrap_or("info"))
}

/// Create the FIFO if needed and open it for reading. Opening read-write
/// keeps the open from blocking until the tracer attaches, and the read end
/// from seeing EOF between tracer restarts of a single run.
#[cfg(unix)]
fn open_pipe(path: &std::path::Path) -> anyhow::Result<tokio::net::unix::pipe::Receiver> {
    use nix::sys::stat::Mode;
    use nix::unistd::mkfifo;

    if !path.exists() {
        mkfifo(path, Mode::S_IRWXU)?;
    }

    let receiver = tokio::net::unix::pipe::OpenOptions::new()
        .read_write(true)
        .open_receiver(path)?;
    Ok(receiver)
}

#[cfg(unix)]
fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .enable_all()
        .thread_name("tracegate-worker")
        .build()?;

    runtime.block_on(async_main())
}

#[cfg(not(unix))]
fn main() {
    eprintln!("tracegate requires a Unix platform (named pipe support)");
    std::process::exit(1);
}

#[cfg(unix)]
async fn async_main() -> anyhow::Result<()> {
    let args = Args::parse();
    let file = match args.config {
        Some(ref path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(log_directive(&file).parse()?),
        )
        .init();

    info!("tracegate v{}", VERSION);

    let config = match build_config(&args, &file) {
        Ok(c) => c,
        Err(e) => {
            error!("invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    // FIFO the tracer writes destination notifications to
    let (pipe_path, scratch_dir) = match args.pipe {
        Some(ref path) => (path.clone(), None),
        None => {
            let dir = std::env::temp_dir().join(format!("tracegate-{}", std::process::id()));
            std::fs::create_dir_all(&dir)?;
            (dir.join("tracegate.fifo"), Some(dir))
        }
    };
    let pipe = open_pipe(&pipe_path)?;
    info!("notification pipe: {}", pipe_path.display());

    let dispatcher = Dispatcher::bind(config).await?;
    let addr = dispatcher.local_addr()?;

    // The supervisor parses this line to configure the tracer
    println!("listen address: {}", addr);
    println!("pipe path: {}", pipe_path.display());

    let result = tokio::select! {
        res = dispatcher.run(pipe) => res,
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            Ok(())
        }
    };

    if let Some(dir) = scratch_dir {
        let _ = std::fs::remove_dir_all(dir);
    }

    if let Err(e) = result {
        error!("dispatcher error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}
