use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use embedtun_core::logging::{init_logging, LogOptions};
use embedtun_core::settings::TunnelSettings;
use embedtun_ipc::{ConfigLine, ControlClient, ControlResponse};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum LogLevelArg {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevelArg> for tracing::Level {
    fn from(level: LogLevelArg) -> Self {
        match level {
            LogLevelArg::Trace => tracing::Level::TRACE,
            LogLevelArg::Debug => tracing::Level::DEBUG,
            LogLevelArg::Info => tracing::Level::INFO,
            LogLevelArg::Warn => tracing::Level::WARN,
            LogLevelArg::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, after_help = "Examples:\n  embedtunctl show wg0\n  embedtunctl --output json show wg0\n  embedtunctl set wg0 wg0.conf --wg-quick")]
struct Args {
    /// Log level
    #[arg(
        short,
        long,
        value_enum,
        default_value = "info",
        env = "EMBEDTUN_LOG_LEVEL"
    )]
    log_level: LogLevelArg,

    /// Emit JSON log records
    #[arg(long, env = "EMBEDTUN_JSON_LOGS")]
    json_logs: bool,

    /// Output format for command results (table|json)
    #[arg(long, value_enum, default_value = "table")]
    output: OutputFormat,

    /// Directory holding the tunnels' control sockets
    #[arg(long, default_value = "/var/run/wireguard", env = "EMBEDTUN_SOCKET_DIR")]
    socket_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show a live tunnel's configuration and peer state
    Show {
        /// Interface name
        interface: String,
    },
    /// Apply configuration to a live tunnel
    Set {
        /// Interface name
        interface: String,
        /// File with key=value lines, or a tunnel document with --wg-quick
        file: PathBuf,
        /// Translate an [Interface]/[Peer] tunnel document first
        #[arg(long)]
        wg_quick: bool,
    },
}

#[derive(Serialize)]
struct Entry<'a> {
    key: &'a str,
    value: &'a str,
}

#[derive(Serialize)]
struct ShowOutput<'a> {
    interface: &'a str,
    entries: Vec<Entry<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    status: &'a str,
    detail: &'a str,
}

fn print_msg(fmt: OutputFormat, status: &str, detail: &str) -> Result<()> {
    match fmt {
        OutputFormat::Table => println!("{status}: {detail}"),
        OutputFormat::Json => {
            let msg = Message { status, detail };
            println!("{}", serde_json::to_string_pretty(&msg)?);
        }
    }
    Ok(())
}

fn render_table(lines: &[ConfigLine]) -> String {
    let width = lines.iter().map(|line| line.key.len()).max().unwrap_or(0);
    let mut out = String::new();
    for line in lines {
        // Peers start a new block
        if line.key == "public_key" && !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&format!("{:width$}  {}\n", line.key, line.value, width = width));
    }
    out
}

/// Split a set body into lines, skipping blanks
fn config_lines(body: &str) -> Result<Vec<ConfigLine>> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(i, line)| {
            ConfigLine::parse(line).with_context(|| format!("line {} of the set body", i + 1))
        })
        .collect()
}

/// Build the set body for `interface` from the contents of a file
fn set_body(interface: &str, text: &str, wg_quick: bool) -> Result<Vec<ConfigLine>> {
    if wg_quick {
        let settings = TunnelSettings::from_wg_quick(text, interface)
            .context("Failed to parse tunnel document")?;
        config_lines(&settings.to_uapi()?)
    } else {
        config_lines(text)
    }
}

async fn show(socket_dir: &Path, interface: &str) -> Result<ControlResponse> {
    let mut client = ControlClient::connect_interface(socket_dir, interface)
        .await
        .with_context(|| format!("Is {} up?", interface))?;
    let response = client.get().await?;
    if !response.is_ok() {
        bail!("{} answered get with errno {}", interface, response.errno);
    }
    Ok(response)
}

async fn set(socket_dir: &Path, interface: &str, lines: Vec<ConfigLine>) -> Result<()> {
    let mut client = ControlClient::connect_interface(socket_dir, interface)
        .await
        .with_context(|| format!("Is {} up?", interface))?;
    let count = lines.len();
    let response = client.set(lines).await?;
    if !response.is_ok() {
        bail!("{} rejected the configuration (errno {})", interface, response.errno);
    }
    debug!(interface, lines = count, "Configuration accepted");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level: tracing::Level = args.log_level.into();
    let _guard = init_logging(LogOptions {
        level,
        json_format: args.json_logs,
        ..Default::default()
    });

    match &args.command {
        Command::Show { interface } => {
            let response = show(&args.socket_dir, interface).await?;
            match args.output {
                OutputFormat::Table => print!("{}", render_table(&response.lines)),
                OutputFormat::Json => {
                    let output = ShowOutput {
                        interface,
                        entries: response
                            .lines
                            .iter()
                            .map(|line| Entry {
                                key: &line.key,
                                value: &line.value,
                            })
                            .collect(),
                    };
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
            }
        }
        Command::Set {
            interface,
            file,
            wg_quick,
        } => {
            let text = std::fs::read_to_string(file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let lines = set_body(interface, &text, *wg_quick)?;
            set(&args.socket_dir, interface, lines).await?;
            print_msg(args.output, "ok", &format!("configuration applied to {interface}"))?;
        }
    }

    info!("embedtunctl command completed");
    Ok(())
}
