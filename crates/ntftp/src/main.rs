//! ntftp - command-line TFTP client and server
//!
//! By default the client proposes the option extensions that give the best
//! throughput. A server that does not support them is talked to as a plain
//! RFC 1350 peer.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use argh::FromArgs;
use tftp::{Client, DEFAULT_PORT, GetOptions, GlobalOptions, PutOptions, TftpServer, TftpServerConfig};

const DEFAULT_LISTEN: &str = "0.0.0.0:69";
const DEFAULT_ROOT: &str = "./tftp_root";

#[derive(FromArgs, Debug)]
#[argh(
    description = "TFTP client and server with windowed transfers",
    example = "Download a file:\n  {command_name} -w 8 get localhost pxelinux.0",
    example = "Upload with a smaller block size:\n  {command_name} --blksize 256 put 10.0.0.5:6969 ./report.txt",
    example = "Serve a directory read-only:\n  {command_name} serve --root /srv/tftp --deny-put"
)]
struct Cli {
    #[argh(
        option,
        short = 'b',
        description = "blksize option extension, valid range [8, 65464] (default 1468)"
    )]
    blksize: Option<usize>,

    #[argh(
        option,
        short = 'r',
        description = "retries before giving up on an unresponsive peer (default 3)"
    )]
    retries: Option<u32>,

    #[argh(option, short = 't', description = "timeout option extension in milliseconds (default 3000)")]
    timeout: Option<u64>,

    #[argh(
        option,
        short = 'w',
        description = "windowsize option extension, valid range [1, 65535] (default 4)"
    )]
    windowsize: Option<u16>,

    #[argh(option, description = "block number that follows 65535, 0 or 1 (default 0)")]
    rollover: Option<u8>,

    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum Command {
    Get(GetCommand),
    Put(PutCommand),
    Serve(ServeCommand),
}

/// Get a file from a remote server
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "get")]
struct GetCommand {
    /// remote server, <host>[:<port>]
    #[argh(positional)]
    server: String,

    /// remote file
    #[argh(positional)]
    remote: String,

    /// local destination (default: the remote file name)
    #[argh(positional)]
    local: Option<PathBuf>,

    /// expected md5 of the file
    #[argh(option)]
    md5sum: Option<String>,

    /// expected sha1 of the file
    #[argh(option)]
    sha1sum: Option<String>,
}

/// Put a file to a remote server
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "put")]
struct PutCommand {
    /// remote server, <host>[:<port>]
    #[argh(positional)]
    server: String,

    /// local file
    #[argh(positional)]
    local: PathBuf,

    /// remote name (default: the local file name)
    #[argh(positional)]
    remote: Option<String>,
}

/// Serve a directory
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "serve")]
struct ServeCommand {
    /// listening address
    #[argh(option, short = 'l', default = "DEFAULT_LISTEN.to_string()")]
    listen: String,

    /// root directory
    #[argh(option, default = "PathBuf::from(DEFAULT_ROOT)")]
    root: PathBuf,

    /// reject every read request
    #[argh(switch)]
    deny_get: bool,

    /// reject every write request
    #[argh(switch)]
    deny_put: bool,

    /// local address for transfer sockets
    #[argh(option)]
    local_bind: Option<IpAddr>,
}

/// Split `<host>[:<port>]`, accepting bracketed IPv6 literals
fn parse_server(server: &str) -> Result<(String, u16)> {
    let (host, port) = if let Some(rest) = server.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .with_context(|| format!("Invalid server address: {}", server))?;
        (host, tail.strip_prefix(':'))
    } else if server.matches(':').count() == 1 {
        let (host, port) = server.split_once(':').unwrap_or((server, ""));
        (host, Some(port))
    } else {
        (server, None)
    };

    if host.is_empty() {
        bail!("Missing server address");
    }
    let port = match port {
        Some(port) => port
            .parse()
            .with_context(|| format!("Invalid server port: {}", port))?,
        None => DEFAULT_PORT,
    };
    Ok((host.to_string(), port))
}

impl Cli {
    /// Options shared by every command, before validation
    fn global_options(&self) -> GlobalOptions {
        let mut opts = GlobalOptions::default();
        if let Some(blksize) = self.blksize {
            opts.block_size = blksize;
        }
        if let Some(retries) = self.retries {
            opts.retries = retries;
        }
        if let Some(timeout) = self.timeout {
            opts.timeout = Duration::from_millis(timeout);
        }
        if let Some(windowsize) = self.windowsize {
            opts.window_size = windowsize;
        }
        if let Some(rollover) = self.rollover {
            opts.rollover = rollover;
        }
        opts
    }
}

/// Global options pointed at `server`
fn client_options(global: &GlobalOptions, server: &str) -> Result<GlobalOptions> {
    let (address, port) = parse_server(server)?;
    Ok(GlobalOptions {
        address,
        port,
        ..global.clone()
    })
}

impl ServeCommand {
    fn into_config(self, options: GlobalOptions) -> TftpServerConfig {
        TftpServerConfig {
            bind_address: self.listen,
            root_directory: self.root,
            options,
            deny_get: self.deny_get,
            deny_put: self.deny_put,
            local_bind: self.local_bind,
        }
    }
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .with_context(|| format!("Cannot derive a remote name from {}", path.display()))
}

async fn run(cli: Cli) -> Result<()> {
    let global = cli.global_options();
    match cli.command {
        Command::Get(cmd) => {
            let client = Client::new(client_options(&global, &cmd.server)?);
            let local = match &cmd.local {
                Some(local) => local.clone(),
                None => PathBuf::from(file_name_of(Path::new(&cmd.remote))?),
            };
            let options = GetOptions {
                md5: cmd.md5sum,
                sha1: cmd.sha1sum,
                ..Default::default()
            };
            let stats = client
                .get_file(&cmd.remote, &local, options)
                .await
                .with_context(|| format!("Failed to get {}", cmd.remote))?;
            tracing::info!(
                "Received {} into {} (blksize {}, windowsize {})",
                cmd.remote,
                local.display(),
                stats.block_size,
                stats.window_size
            );
        }
        Command::Put(cmd) => {
            let client = Client::new(client_options(&global, &cmd.server)?);
            let remote = match &cmd.remote {
                Some(remote) => remote.clone(),
                None => file_name_of(&cmd.local)?,
            };
            let stats = client
                .put_file(&cmd.local, &remote, PutOptions::default())
                .await
                .with_context(|| format!("Failed to put {}", cmd.local.display()))?;
            tracing::info!(
                "Sent {} as {} (blksize {}, windowsize {})",
                cmd.local.display(),
                remote,
                stats.block_size,
                stats.window_size
            );
        }
        Command::Serve(cmd) => {
            let config = cmd.into_config(global);
            let server = TftpServer::bind(config.clone())
                .await
                .with_context(|| format!("Failed to bind TFTP server socket on {}", config.bind_address))?;

            let shutdown = server.shutdown_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Interrupted, finishing transfers in progress");
                    shutdown.shutdown();
                }
            });
            server.serve().await.context("TFTP server failed")?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli: Cli = argh::from_env();
    run(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::from_args(&["ntftp"], args).unwrap()
    }

    #[test]
    fn test_parse_server() {
        assert_eq!(parse_server("localhost").unwrap(), ("localhost".to_string(), 69));
        assert_eq!(parse_server("10.0.0.5:6969").unwrap(), ("10.0.0.5".to_string(), 6969));
        assert_eq!(parse_server("[::1]:1234").unwrap(), ("::1".to_string(), 1234));
        assert_eq!(parse_server("::1").unwrap(), ("::1".to_string(), 69));
        assert!(parse_server("host:port").is_err());
        assert!(parse_server(":69").is_err());
    }

    #[test]
    fn test_flags_to_client_options() {
        let cli = parse(&["-b", "256", "-w", "8", "-t", "1500", "-r", "5", "get", "tftp.local:1234", "boot.img"]);
        let Command::Get(ref cmd) = cli.command else {
            panic!("expected get");
        };
        let opts = client_options(&cli.global_options(), &cmd.server).unwrap();
        assert_eq!(opts.address, "tftp.local");
        assert_eq!(opts.port, 1234);
        assert_eq!(opts.block_size, 256);
        assert_eq!(opts.window_size, 8);
        assert_eq!(opts.timeout, Duration::from_millis(1500));
        assert_eq!(opts.retries, 5);
        assert_eq!(opts.rollover, 0);
    }

    #[test]
    fn test_defaults_match_library() {
        let cli = parse(&["put", "localhost", "./report.txt"]);
        assert_eq!(cli.global_options(), GlobalOptions::default());
        let Command::Put(cmd) = cli.command else {
            panic!("expected put");
        };
        assert_eq!(file_name_of(&cmd.local).unwrap(), "report.txt");
        assert!(cmd.remote.is_none());
    }

    #[test]
    fn test_serve_config() {
        let cli = parse(&["-w", "2", "serve", "--root", "/srv/tftp", "--deny-put", "-l", "127.0.0.1:6969"]);
        let opts = cli.global_options();
        let Command::Serve(cmd) = cli.command else {
            panic!("expected serve");
        };
        let config = cmd.into_config(opts);
        assert_eq!(config.bind_address, "127.0.0.1:6969");
        assert_eq!(config.root_directory, PathBuf::from("/srv/tftp"));
        assert_eq!(config.options.window_size, 2);
        assert!(config.deny_put);
        assert!(!config.deny_get);
    }
}
