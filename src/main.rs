use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use proxydns::proxy::{self, ProxyConfig};
use proxydns::selftest;

const DEFAULT_EXCLUDE_FILE: &str = "exclude.list";

#[derive(Parser)]
#[command(name = "proxydns")]
#[command(about = "DNS forwarder racing primary, backup and system resolvers", long_about = None)]
struct Args {
    /// Local port to listen on
    #[arg(short, long, default_value = "53")]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Primary DNS servers, comma separated: [*...]host[:port][@tcp|@tcp-tls|@doh]
    #[arg(long, visible_alias = "local", default_value = "")]
    primary: String,

    /// Backup DNS servers, used first for excluded names
    #[arg(long, visible_alias = "remote", default_value = "8.8.8.8")]
    backup: String,

    /// Proxies for upstreams prefixed with `*`, comma separated (http, https, socks5, socks5h)
    #[arg(long, default_value = "")]
    proxy: String,

    /// Exclude list file (defaults to exclude.list next to the executable)
    #[arg(long, visible_alias = "list")]
    exclude: Option<PathBuf>,

    /// Hosts file
    #[arg(long)]
    hosts: Option<PathBuf>,

    /// Try the next tier when one fails
    #[arg(long)]
    fallback: bool,

    /// Timeout for each tier of a query (e.g. 5s, 500ms)
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    timeout: Duration,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Serve DNS (default)
    Run,
    /// Start a throwaway server and check it answers
    Test,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(i) => s.split_at(i),
        None => (s, "s"),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration: {s}"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => value
            .checked_mul(60)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration too large: {s}")),
        _ => Err(format!("invalid duration unit in {s}, expected ms, s or m")),
    }
}

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn default_exclude() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let path = exe.parent()?.join(DEFAULT_EXCLUDE_FILE);
    path.exists().then_some(path)
}

impl Args {
    fn into_config(self) -> ProxyConfig {
        ProxyConfig {
            bind_addr: SocketAddr::new(self.bind, self.port),
            primary: self.primary,
            backup: self.backup,
            proxies: self.proxy,
            exclude: self.exclude.or_else(default_exclude),
            hosts: self.hosts,
            fallback: self.fallback,
            timeout: self.timeout,
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.debug);

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    let command = args.command.unwrap_or(Command::Run);
    let result = match command {
        Command::Run => rt.block_on(proxy::run(args.into_config())),
        Command::Test => rt.block_on(selftest::run(args.timeout)),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "exiting");
            ExitCode::FAILURE
        }
    }
}
