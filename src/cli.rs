//! Command-line front end.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use opsrelay::config::HostTable;
use opsrelay::scan::HostStatus;
use opsrelay::sftp::{SftpClient, TransferProgress};
use opsrelay::ssh::commands::serve_session;
use opsrelay::ssh::protocol::{ClientMessage, ServerMessage};
use opsrelay::ssh::{Credentials, PtySize};
use opsrelay::Engine;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// opsrelay - remote operations against managed hosts
#[derive(Debug, Parser)]
#[command(name = "opsrelay", version, about = "Remote operations against managed hosts")]
pub struct Cli {
    /// Config directory holding config.toml and hosts.toml
    #[arg(long, global = true, value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    /// Log filter directives, overrides RUST_LOG
    #[arg(long, global = true, value_name = "FILTER")]
    pub log: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args)]
pub struct Login {
    /// Remote user
    #[arg(short, long)]
    pub user: String,

    #[arg(long, env = "OPSRELAY_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Private key file
    #[arg(short = 'i', long = "identity", value_name = "FILE")]
    pub key_file: Option<PathBuf>,

    #[arg(long, env = "OPSRELAY_PASSPHRASE", hide_env_values = true)]
    pub passphrase: Option<String>,
}

impl Login {
    fn credentials(&self) -> Result<Credentials> {
        let private_key = match &self.key_file {
            Some(path) => Some(
                std::fs::read_to_string(path).with_context(|| format!("reading key file {}", path.display()))?,
            ),
            None => None,
        };
        let credentials = Credentials {
            password: self.password.clone(),
            private_key,
            passphrase: self.passphrase.clone(),
        };
        if credentials.is_empty() {
            bail!("either --password (or OPSRELAY_PASSWORD) or --identity is required");
        }
        Ok(credentials)
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List inventory hosts
    Hosts,

    /// Probe an address range for SSH hosts
    Scan {
        /// CIDR block or single address
        range: String,
        #[arg(short, long = "port")]
        ports: Vec<u16>,
        /// Per-probe timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(long)]
        concurrency: Option<usize>,
        /// Print every result as a JSON line
        #[arg(long)]
        json: bool,
        /// Include hosts that did not answer
        #[arg(long)]
        all: bool,
    },

    /// Run one command and print its output
    Exec {
        host: String,
        command: String,
        #[command(flatten)]
        login: Login,
        /// Seconds, 0 waits forever
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },

    /// Line-mode interactive shell
    Shell {
        host: String,
        #[command(flatten)]
        login: Login,
    },

    /// List a remote directory
    Ls {
        host: String,
        #[arg(default_value = "")]
        path: String,
        #[command(flatten)]
        login: Login,
    },

    /// Download a file
    Get {
        host: String,
        remote: String,
        local: PathBuf,
        #[command(flatten)]
        login: Login,
    },

    /// Upload a file
    Put {
        host: String,
        local: PathBuf,
        remote: String,
        #[arg(long)]
        overwrite: bool,
        #[command(flatten)]
        login: Login,
    },

    /// Delete a file or empty directory
    Rm {
        host: String,
        path: String,
        #[command(flatten)]
        login: Login,
    },

    /// Rename a file or directory
    Mv {
        host: String,
        from: String,
        to: String,
        #[command(flatten)]
        login: Login,
    },

    /// Create a directory
    Mkdir {
        host: String,
        path: String,
        #[command(flatten)]
        login: Login,
    },

    /// Change permissions, e.g. 0644
    Chmod {
        host: String,
        mode: String,
        path: String,
        #[command(flatten)]
        login: Login,
    },
}

pub async fn run(command: Command, engine: &Engine, config_dir: &Path) -> Result<()> {
    match command {
        Command::Hosts => hosts(config_dir),
        Command::Scan {
            range,
            ports,
            timeout,
            concurrency,
            json,
            all,
        } => scan(engine, &range, ports, timeout, concurrency, json, all).await,
        Command::Exec {
            host,
            command,
            login,
            timeout,
        } => exec(engine, &host, &command, &login, timeout).await,
        Command::Shell { host, login } => shell(engine, &host, &login).await,
        Command::Ls { host, path, login } => {
            let client = sftp(engine, &host, &login).await?;
            let path = if path.is_empty() { client.home_dir().await? } else { path };
            for entry in client.list_files(&path).await? {
                println!("{} {:>12} {}", entry.permissions, entry.size, entry.name);
            }
            client.close();
            Ok(())
        }
        Command::Get {
            host,
            remote,
            local,
            login,
        } => {
            let client = sftp(engine, &host, &login).await?;
            let bytes = client.download(&remote, &local, report_progress).await?;
            eprintln!();
            println!("{} bytes -> {}", bytes, local.display());
            client.close();
            Ok(())
        }
        Command::Put {
            host,
            local,
            remote,
            overwrite,
            login,
        } => {
            let client = sftp(engine, &host, &login).await?;
            let bytes = client.upload(&local, &remote, overwrite, report_progress).await?;
            eprintln!();
            println!("{} bytes -> {}:{}", bytes, host, remote);
            client.close();
            Ok(())
        }
        Command::Rm { host, path, login } => {
            let client = sftp(engine, &host, &login).await?;
            client.delete(&path).await?;
            client.close();
            Ok(())
        }
        Command::Mv { host, from, to, login } => {
            let client = sftp(engine, &host, &login).await?;
            client.rename(&from, &to).await?;
            client.close();
            Ok(())
        }
        Command::Mkdir { host, path, login } => {
            let client = sftp(engine, &host, &login).await?;
            client.create_directory(&path).await?;
            client.close();
            Ok(())
        }
        Command::Chmod {
            host,
            mode,
            path,
            login,
        } => {
            let client = sftp(engine, &host, &login).await?;
            client.set_permissions(&path, &mode).await?;
            client.close();
            Ok(())
        }
    }
}

fn hosts(config_dir: &Path) -> Result<()> {
    let hosts = HostTable::load(config_dir)?.list();
    if hosts.is_empty() {
        println!("no hosts in {}", config_dir.join("hosts.toml").display());
    }
    for host in hosts {
        println!(
            "{:<20} {:<30} {}",
            host.id,
            format!("{}:{}", host.address, host.port),
            host.tags.join(",")
        );
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn scan(
    engine: &Engine,
    range: &str,
    ports: Vec<u16>,
    timeout: Option<u64>,
    concurrency: Option<usize>,
    json: bool,
    all: bool,
) -> Result<()> {
    let defaults = &engine.settings.scan;
    let ports = if ports.is_empty() { defaults.default_ports.clone() } else { ports };
    let cancel = CancellationToken::new();

    let mut handle = engine.scan(
        range,
        ports,
        timeout.unwrap_or(defaults.probe_timeout_secs),
        concurrency.unwrap_or(defaults.max_concurrency),
        cancel.clone(),
    )?;
    eprintln!("scanning {} ({} probes)", range, handle.total_probes());

    let mut found = 0usize;
    loop {
        let host = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                eprintln!("cancelled");
                break;
            }
            host = handle.next() => match host {
                Some(host) => host,
                None => break,
            },
        };

        if host.status == HostStatus::Success {
            found += 1;
        }
        if !all && host.status == HostStatus::Timeout {
            continue;
        }
        if json {
            println!("{}", serde_json::to_string(&host)?);
        } else {
            println!(
                "{:<40} {:<8} {:<24} {}",
                format!("{}:{}", host.address, host.port),
                format!("{:?}", host.status).to_lowercase(),
                host.hostname.as_deref().unwrap_or("-"),
                host.os.as_deref().unwrap_or("-"),
            );
        }
    }

    eprintln!("{} SSH host(s) found", found);
    Ok(())
}

async fn exec(engine: &Engine, host: &str, command: &str, login: &Login, timeout: u64) -> Result<()> {
    let output = engine
        .execute(host, &login.user, login.credentials()?, command, Duration::from_secs(timeout))
        .await?;

    print!("{}", output.stdout);
    eprint!("{}", output.stderr);
    if let Some(error) = &output.error {
        eprintln!("opsrelay: {}", error);
    }
    match output.exit_code {
        Some(0) => Ok(()),
        Some(code) => std::process::exit(code.clamp(1, 255)),
        None => std::process::exit(124),
    }
}

async fn shell(engine: &Engine, host: &str, login: &Login) -> Result<()> {
    let params = engine.connect_params(host, &login.user, login.credentials()?)?;
    let session_settings = &engine.settings.session;
    let size = PtySize::new(session_settings.default_rows, session_settings.default_cols);

    let (to_bridge, inbound) = mpsc::channel(64);
    let (outbound, mut from_bridge) = mpsc::channel(256);
    let bridge = tokio::spawn(serve_session(
        engine.registry.clone(),
        params,
        size,
        inbound,
        outbound,
        session_settings.read_timeout(),
    ));

    let input = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let data = format!("{}\n", line);
            if to_bridge
                .send(ClientMessage::Input {
                    data: data.as_str().into(),
                })
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let mut stdout = tokio::io::stdout();
    while let Some(message) = from_bridge.recv().await {
        match message {
            ServerMessage::Output { data } => {
                stdout.write_all(&data.0).await?;
                stdout.flush().await?;
            }
            ServerMessage::Error { message, .. } => eprintln!("opsrelay: {}", message),
            ServerMessage::Connected { session_id } => tracing::info!("Connected, session {}", session_id),
            ServerMessage::Pong => {}
        }
    }

    input.abort();
    bridge.await??;
    Ok(())
}

async fn sftp(engine: &Engine, host: &str, login: &Login) -> Result<SftpClient> {
    let params = engine.connect_params(host, &login.user, login.credentials()?)?;
    Ok(SftpClient::connect(&params, engine.settings.transfer.chunk_size).await?)
}

fn report_progress(progress: TransferProgress) {
    eprint!(
        "\r{:>12} / {:<12} {:>5.1}%",
        progress.transferred,
        progress.total,
        progress.percent()
    );
}
