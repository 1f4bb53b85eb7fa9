use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use host_probe::{Probe, SystemProbe};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::time::Instant;
use time::{OffsetDateTime, UtcOffset};
use tracing_subscriber::EnvFilter;

mod config;
mod orchestrator;
mod transcript;

use orchestrator::{LogEntry, Notice, Orchestrator};
use transcript::TranscriptFormat;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat { Text, Json, Jsonl }

#[derive(Debug, Parser)]
#[command(name = "linxtap", version, about = "Point-to-point TCP diagnostic client with passive host fingerprinting")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./linxtap.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Output format: text, json, or jsonl
    #[arg(long, value_enum, global = true)]
    format: Option<OutputFormat>,
    /// Log filter (e.g. debug, linxtap=info). Overrides RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<String>,
    /// Write the session log here on exit (.csv and .jsonl select those formats)
    #[arg(long, value_name = "FILE", global = true)]
    transcript: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Show this machine's hostname, addresses and default gateway
    Info,
    /// Guess the OS family of a host from its echo TTL and check whether it is the gateway
    Fingerprint {
        /// Target hostname or IP
        target: String,
        /// Echo reply timeout in milliseconds
        #[arg(long)]
        ttl_timeout_ms: Option<u64>,
    },
    /// Connect, send one message, print any reply, disconnect
    Send {
        /// Target hostname or IP
        address: String,
        /// TCP port (1-65535)
        port: String,
        /// Message text; multiple words are joined with spaces
        #[arg(required = true, num_args = 1..)]
        message: Vec<String>,
        /// How long to wait for a reply in milliseconds
        #[arg(long)]
        read_timeout_ms: Option<u64>,
        /// Echo reply timeout in milliseconds
        #[arg(long)]
        ttl_timeout_ms: Option<u64>,
    },
    /// Interactive session: each stdin line is sent; /status, /export [FILE], /quit
    Connect {
        /// Target hostname or IP
        address: String,
        /// TCP port (1-65535)
        port: String,
        /// How long to wait for a reply in milliseconds
        #[arg(long)]
        read_timeout_ms: Option<u64>,
        /// Echo reply timeout in milliseconds
        #[arg(long)]
        ttl_timeout_ms: Option<u64>,
    },
}

fn init_logging(flag: Option<&str>, configured: Option<&str>) {
    let filter = match flag {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(configured.unwrap_or("warn"))),
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn parse_format(s: &str) -> OutputFormat {
    match s { "json" => OutputFormat::Json, "jsonl" => OutputFormat::Jsonl, _ => OutputFormat::Text }
}

fn now(offset: UtcOffset) -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(offset)
}

fn print_entries(entries: &[LogEntry], format: OutputFormat) -> Result<()> {
    for e in entries {
        match format {
            OutputFormat::Text => println!("{}", transcript::text_line(e)),
            OutputFormat::Json | OutputFormat::Jsonl => println!("{}", transcript::json_line(e)?),
        }
    }
    Ok(())
}

fn export(path: &Path, entries: &[LogEntry]) -> Result<()> {
    transcript::write_transcript(path, entries, TranscriptFormat::from_path(path))?;
    tracing::info!(path = %path.display(), entries = entries.len(), "transcript written");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    // Must run while the process is still single-threaded.
    let local_offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    let cfg = config::load_config(cli.config.as_deref()).unwrap_or_default();
    init_logging(cli.log_level.as_deref(), cfg.log_level.as_deref());
    let format = cli.format.or_else(|| cfg.format().map(parse_format)).unwrap_or(OutputFormat::Text);
    let transcript_path = cli.transcript.clone().or_else(|| cfg.transcript().map(Path::to_path_buf));

    match cli.command {
        Commands::Version => {
            println!("linxtap {} (core {})", env!("CARGO_PKG_VERSION"), linxtap_core::version());
        }
        Commands::Info => {
            let hostname = host_probe::local_hostname();
            let local_ip = host_probe::local_ipv4();
            let outbound_ip = host_probe::outbound_ipv4();
            let gateway = host_probe::default_gateway_ipv4();
            match format {
                OutputFormat::Text => {
                    println!("hostname:    {}", hostname);
                    println!("local ip:    {}", local_ip);
                    println!("outbound ip: {}", outbound_ip.as_deref().unwrap_or(host_probe::UNKNOWN));
                    println!("gateway:     {}", gateway.as_deref().unwrap_or("none"));
                }
                OutputFormat::Json | OutputFormat::Jsonl => {
                    let obj = serde_json::json!({
                        "hostname": hostname,
                        "local_ip": local_ip,
                        "outbound_ip": outbound_ip,
                        "gateway": gateway,
                    });
                    println!("{}", serde_json::to_string(&obj)?);
                }
            }
        }
        Commands::Fingerprint { target, ttl_timeout_ms } => {
            let limit = cfg.session_config(None, ttl_timeout_ms).ttl_timeout;
            let ip = host_probe::resolve_ipv4(&target)
                .map(|ip| ip.to_string())
                .ok_or_else(|| anyhow!("failed to resolve target: {}", target))?;
            let started = Instant::now();
            let fp = SystemProbe.fingerprint(&ip, limit);
            let duration_ms = started.elapsed().as_millis();
            match format {
                OutputFormat::Text => {
                    let ttl = fp.ttl.map(|t| format!("ttl {t}")).unwrap_or_else(|| "no echo reply".into());
                    let role = if fp.is_gateway { "gateway" } else { "device" };
                    println!("{} ({}): {} [{}], {} ({} ms)", target, ip, fp.os_family, ttl, role, duration_ms);
                }
                OutputFormat::Json | OutputFormat::Jsonl => {
                    let obj = serde_json::json!({
                        "target": target,
                        "ip": ip,
                        "ttl": fp.ttl,
                        "os": fp.os_family.label(),
                        "is_gateway": fp.is_gateway,
                        "duration_ms": duration_ms,
                    });
                    println!("{}", serde_json::to_string(&obj)?);
                }
            }
        }
        Commands::Send { address, port, message, read_timeout_ms, ttl_timeout_ms } => {
            let rt = tokio::runtime::Runtime::new()?;
            let mut orch = Orchestrator::new(cfg.session_config(read_timeout_ms, ttl_timeout_ms)).with_offset(local_offset);
            let text = message.join(" ");
            let outcome = rt.block_on(async {
                if let Notice::Failed(m) = orch.connect(&address, &port).await {
                    return Err(anyhow!(m));
                }
                let sent = orch.send_text(&text).await;
                orch.disconnect();
                Ok(sent)
            });
            print_entries(orch.log(), format)?;
            if let Some(path) = &transcript_path { export(path, orch.log())?; }
            match outcome? {
                Some(Err(e)) => return Err(anyhow!(e.to_string())),
                Some(Ok(_)) | None => {}
            }
        }
        Commands::Connect { address, port, read_timeout_ms, ttl_timeout_ms } => {
            let rt = tokio::runtime::Runtime::new()?;
            let mut orch = Orchestrator::new(cfg.session_config(read_timeout_ms, ttl_timeout_ms)).with_offset(local_offset);
            let notice = rt.block_on(orch.connect(&address, &port));
            print_entries(orch.log(), format)?;
            let mut printed = orch.log().len();
            match notice {
                Notice::Connected { endpoint, fingerprint } => {
                    tracing::debug!(%endpoint, os = %fingerprint.os_family, "interactive session open");
                }
                Notice::Failed(m) => {
                    if let Some(path) = &transcript_path { export(path, orch.log())?; }
                    return Err(anyhow!(m));
                }
                Notice::Disconnected => {}
            }

            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let line = line?;
                let input = line.trim();
                match input.split_once(' ').map_or((input, ""), |(c, rest)| (c, rest.trim())) {
                    ("/quit", _) => break,
                    ("/status", _) => {
                        let fp = orch.session().fingerprint().unwrap_or_default();
                        println!("{} | os: {} | gateway: {}", orch.status_line(), fp.os_family, fp.is_gateway);
                    }
                    ("/export", file) => {
                        let path = if file.is_empty() { PathBuf::from(transcript::default_file_name(now(local_offset))) } else { PathBuf::from(file) };
                        match export(&path, orch.log()) {
                            Ok(()) => println!("Log exported to {}", path.display()),
                            Err(e) => eprintln!("Export failed: {}", e),
                        }
                    }
                    _ => {
                        let _ = rt.block_on(orch.send_text(input));
                    }
                }
                print_entries(&orch.log()[printed..], format)?;
                printed = orch.log().len();
                if !orch.session().is_connected() { break; }
            }

            orch.disconnect();
            print_entries(&orch.log()[printed..], format)?;
            if let Some(path) = &transcript_path { export(path, orch.log())?; }
        }
    }
    Ok(())
}
