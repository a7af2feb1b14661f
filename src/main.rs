//! Binary entrypoint for the meshlink CLI.
//!
//! Commands:
//! - `init [--force]` - create a starter `config.toml`
//! - `check-config` - load and validate the configuration, print the effective settings
//! - `decode <capture>` - print one summary line per frame of a capture file
//! - `replay <capture> [--send <text>] [--json]` - run the full session stack over a capture
//!
//! See the library crate docs for module‑level details: `meshlink::`.
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::time::Duration;

use meshlink::capture::Capture;
use meshlink::codec::{Frame, MeshCodec, PacketKind, BROADCAST_NODE_ID};
use meshlink::config::{Config, SupervisorConfig};
use meshlink::logutil::escape_log;
use meshlink::registry::NodeRecord;
use meshlink::supervisor::{ConnectionSupervisor, LinkState, SupervisorHandle};
use meshlink::transport::{DeviceHandle, ReplayLink};

#[derive(Parser)]
#[command(name = "meshlink")]
#[command(about = "Session driver for Meshtastic radios over Bluetooth LE")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Validate the configuration and print the effective settings
    CheckConfig,
    /// Decode every frame of a capture file
    Decode {
        /// Capture file (one hex frame per line)
        capture: String,
    },
    /// Run a capture through scan, connect, handshake and drain
    Replay {
        /// Capture file (one hex frame per line, `---` before live frames)
        capture: String,
        /// Broadcast this text once the session is ready
        #[arg(short, long)]
        send: Option<String>,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
        /// Seconds to wait for each phase before giving up
        #[arg(short, long, default_value_t = 10)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load config early to configure logging (except for Init which writes it)
    let pre_config = match cli.command {
        Commands::Init { .. } => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Init { force } => {
            if !force && tokio::fs::try_exists(&cli.config).await.unwrap_or(false) {
                return Err(anyhow!(
                    "{} already exists (use --force to overwrite)",
                    cli.config
                ));
            }
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::CheckConfig => {
            let config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?,
            };
            config.validate()?;
            println!("# {} is valid", cli.config);
            print!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Decode { capture } => {
            let capture = Capture::load(&capture).await?;
            decode_capture(&capture);
        }
        Commands::Replay {
            capture,
            send,
            json,
            timeout,
        } => {
            let config = pre_config.unwrap_or_default();
            config.validate()?;
            let capture = Capture::load(&capture).await?;
            replay(&config, capture, send, json, Duration::from_secs(timeout)).await?;
        }
    }

    Ok(())
}

fn decode_capture(capture: &Capture) {
    let mut errors = 0usize;
    for (idx, raw) in capture.frames().enumerate() {
        match MeshCodec::decode(raw) {
            Ok(frame) => println!("#{:<4} {}", idx, describe(&frame)),
            Err(e) => {
                errors += 1;
                println!("#{:<4} decode error: {}", idx, e);
            }
        }
    }
    println!(
        "{} frames ({} bootstrap, {} live), {} decode errors",
        capture.len(),
        capture.bootstrap.len(),
        capture.live.len(),
        errors
    );
}

fn describe(frame: &Frame) -> String {
    match frame {
        Frame::HandshakeInfo(info) => format!(
            "handshake-info node=!{:08x} reboots={}",
            info.node_num, info.reboot_count
        ),
        Frame::NodeSnapshot(node) => format!(
            "node-snapshot !{:08x} \"{}\" ({}) last_heard={}",
            node.num,
            escape_log(node.long_name()),
            escape_log(node.short_name()),
            node.last_heard
        ),
        Frame::Packet(pkt) => {
            let to = if pkt.to == BROADCAST_NODE_ID {
                "^all".to_string()
            } else {
                format!("!{:08x}", pkt.to)
            };
            let detail = match &pkt.kind {
                PacketKind::Text(text) => format!("\"{}\"", escape_log(text)),
                PacketKind::NodeInfo(user) => {
                    format!("\"{}\" {}", escape_log(&user.long_name), user.hw_model)
                }
                PacketKind::Position(pos) => match pos.coordinate() {
                    Some((lat, lon)) => format!("{:.5},{:.5} alt={}", lat, lon, pos.altitude),
                    None => "no fix".to_string(),
                },
                PacketKind::Admin(payload) => format!("{} bytes", payload.len()),
                PacketKind::Routing(report) => {
                    format!("request={} {}", report.request_id, report.reason_name())
                }
                PacketKind::Unclassified(raw) => format!("id={}", raw.id),
            };
            format!(
                "packet {} !{:08x} -> {} ch={} {}",
                pkt.kind.label(),
                pkt.from,
                to,
                pkt.channel,
                detail
            )
        }
        Frame::HandshakeComplete(token) => format!("handshake-complete token={}", token),
        Frame::Rebooted => "rebooted".to_string(),
        Frame::DeviceLog(rec) => format!("device-log [{:?}] {}", rec.level, escape_log(&rec.message)),
        Frame::Empty => "empty".to_string(),
    }
}

async fn replay(
    config: &Config,
    capture: Capture,
    send: Option<String>,
    json: bool,
    wait: Duration,
) -> Result<()> {
    let device_id = config
        .devices
        .preferred_device_id
        .clone()
        .unwrap_or_else(|| "replay-0".to_string());
    let (link, events) = ReplayLink::new(DeviceHandle::new(device_id, "Meshtastic_replay", -40));
    for frame in &capture.bootstrap {
        link.queue_bootstrap(frame.clone());
    }
    link.set_powered(true);

    let (supervisor, handle) =
        ConnectionSupervisor::new(link.clone(), events, SupervisorConfig::from(config));
    let task = supervisor.spawn();

    let outcome = drive_replay(&handle, &link, &capture, send, wait).await;
    if json {
        print_json(&handle)?;
    } else {
        print_table(&handle);
    }

    handle.shutdown();
    task.await??;
    outcome
}

async fn drive_replay(
    handle: &SupervisorHandle,
    link: &ReplayLink,
    capture: &Capture,
    send: Option<String>,
    wait: Duration,
) -> Result<()> {
    handle.start_scanning();
    if !wait_until(wait, || !handle.discovered().is_empty()).await {
        return Err(anyhow!("No device discovered within {:?}", wait));
    }

    handle.connect_to(link.device().id.clone());
    let ready = tokio::time::timeout(wait, handle.wait_for_state(LinkState::Ready))
        .await
        .unwrap_or(false);
    if !ready {
        let reason = handle
            .last_error()
            .unwrap_or_else(|| format!("state {}", handle.state()));
        return Err(anyhow!("Session did not become ready: {}", reason));
    }
    info!("Session ready, delivering {} live frames", capture.live.len());

    // The handshake drain ends with the first empty pull.
    if !wait_until(wait, || handle.metrics().empty_pulls > 0).await {
        warn!("Handshake frames not drained within {:?}", wait);
    }
    if !capture.live.is_empty() {
        // Queue everything before ringing so the next empty pull marks the end.
        let baseline = handle.metrics().empty_pulls;
        for frame in &capture.live {
            link.push_inbound(frame.clone());
        }
        for _ in &capture.live {
            link.ring_doorbell();
        }
        let drained = wait_until(wait, || {
            link.pending_inbound() == 0 && handle.metrics().empty_pulls > baseline
        })
        .await;
        if !drained {
            warn!("Live frames not drained within {:?}", wait);
        }
    }

    if let Some(text) = send {
        match handle.try_send(text).await {
            Ok(()) => info!("Message sent"),
            Err(e) => warn!("Send failed: {}", e),
        }
    }
    Ok(())
}

async fn wait_until(wait: Duration, mut done: impl FnMut() -> bool) -> bool {
    tokio::time::timeout(wait, async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

fn print_table(handle: &SupervisorHandle) {
    let self_num = handle.self_node().map(|n| n.num);
    let now = chrono::Utc::now().timestamp().max(0) as u32;

    println!("State: {}", handle.state());
    if let Some(err) = handle.last_error() {
        println!("Last error: {}", err);
    }

    let nodes = handle.nodes();
    println!();
    println!("Nodes ({}):", nodes.len());
    for node in &nodes {
        println!("  {}", node_line(node, self_num == Some(node.num), now));
    }

    let messages = handle.messages();
    let stats = handle.message_stats();
    println!();
    println!(
        "Messages ({}, {} in / {} out):",
        messages.len(),
        stats.inbound,
        stats.outbound
    );
    for m in &messages {
        println!(
            "  [{}] {} {} -> {}: {}",
            m.direction.as_str(),
            m.timestamp,
            m.from_short_name,
            m.to_short_name,
            escape_log(&m.payload)
        );
    }

    let metrics = handle.metrics();
    println!();
    println!(
        "Pulls: {} ({} empty)  Frames: {}  Decode errors: {}  Stale updates: {}",
        metrics.pulls,
        metrics.empty_pulls,
        metrics.frames_decoded,
        metrics.decode_errors,
        metrics.stale_node_updates
    );
    println!(
        "Messages in/out: {}/{}  Reconnects scheduled: {}",
        metrics.messages_in, metrics.messages_out, metrics.reconnects_scheduled
    );
}

fn node_line(node: &NodeRecord, is_self: bool, now: u32) -> String {
    let marker = if is_self { "*" } else { " " };
    let hw = node.user.as_ref().map(|u| u.hw_model.as_str()).unwrap_or("-");
    let status = if node.is_online(now) { "online" } else { "offline" };
    let battery = node
        .position
        .as_ref()
        .filter(|p| p.battery_level > 0)
        .map(|p| format!("{}%", p.battery_level))
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{}!{:08x} {:<24} {:<5} {:<16} snr={:<6.2} bat={:<4} {}",
        marker,
        node.num,
        escape_log(node.long_name()),
        escape_log(node.short_name()),
        hw,
        node.snr,
        battery,
        status
    )
}

fn print_json(handle: &SupervisorHandle) -> Result<()> {
    let payload = serde_json::json!({
        "state": handle.state().as_str(),
        "last_error": handle.last_error(),
        "self_node": handle.self_node().map(|n| n.num),
        "nodes": handle.nodes(),
        "messages": handle.messages(),
        "message_stats": handle.message_stats(),
        "metrics": handle.metrics(),
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let configured = config
        .as_ref()
        .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    let base_level = match verbosity {
        0 => configured,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });

    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Foreground runs also get a console copy
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
