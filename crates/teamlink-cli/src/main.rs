use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use discovery::DiscoveryEngine;
use teamlink_core::{Delivery, Identity, Message, Node, NodeConfig, NodeEvent};

#[derive(Parser, Debug)]
#[command(name = "teamlink", version, about = "TeamLink serverless LAN collaboration")]
struct Cli {
    /// Set log level: error,warn,info,debug,trace
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Data directory for identity and state
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the installation identity and a default config file
    Init,

    /// Show installation information
    Info,

    /// Listen for peers on the local network
    Discover {
        /// Discovery timeout in seconds
        #[arg(long, default_value_t = 10)]
        timeout: u64,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a node with an interactive command prompt
    Run {
        /// Receive offered files without asking
        #[arg(long)]
        auto_accept: bool,

        /// Only listen on this TCP port
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .with_target(false)
        .init();

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".teamlink")
    });
    let cfg_path = data_dir.join("config.json");

    match cli.cmd {
        Commands::Init => {
            let cfg = load_config(&data_dir)?;
            cfg.ensure_data_dir()?;
            let identity = Identity::load_or_generate(&cfg.identity_path(), &cfg.keypair_path())?;
            if !cfg_path.exists() {
                cfg.save(&cfg_path)?;
            }

            println!("✓ Installation initialized");
            println!("  Peer ID: {}", identity.peer_id());
            println!("  Fingerprint: {}", identity.fingerprint());
            println!("  Full fingerprint: {}", identity.full_fingerprint());
            println!("  Data directory: {}", data_dir.display());
        }

        Commands::Info => {
            let cfg = load_config(&data_dir)?;
            let identity = Identity::load(&cfg.identity_path(), &cfg.keypair_path())
                .context("Installation not initialized. Run 'teamlink init' first.")?;

            println!("Installation Information:");
            println!("  Peer ID: {}", identity.peer_id());
            println!("  Fingerprint: {}", identity.fingerprint());
            println!("  Full fingerprint: {}", identity.full_fingerprint());
            println!("  Data directory: {}", data_dir.display());
            println!("  Download directory: {}", cfg.download_dir.display());
            println!("  TCP ports: {:?}", cfg.tcp_ports);
        }

        Commands::Discover { timeout, json } => {
            let cfg = load_config(&data_dir)?;
            let identity = Identity::load(&cfg.identity_path(), &cfg.keypair_path())
                .context("Installation not initialized. Run 'teamlink init' first.")?;
            discover_peers(&cfg, &identity, Duration::from_secs(timeout), json).await?;
        }

        Commands::Run { auto_accept, port } => {
            let mut cfg = load_config(&data_dir)?;
            cfg.auto_accept_files |= auto_accept;
            if let Some(port) = port {
                cfg.tcp_ports = vec![port];
            }
            run_node(cfg).await?;
        }
    }

    Ok(())
}

/// The saved config, or defaults rooted at `data_dir`.
fn load_config(data_dir: &Path) -> Result<NodeConfig> {
    let cfg_path = data_dir.join("config.json");
    let mut cfg = if cfg_path.exists() {
        NodeConfig::load(&cfg_path)?
    } else {
        NodeConfig::with_data_dir(data_dir)
    };
    cfg.data_dir = data_dir.to_path_buf();
    Ok(cfg)
}

async fn discover_peers(cfg: &NodeConfig, identity: &Identity, timeout: Duration, json: bool) -> Result<()> {
    let port = cfg.tcp_ports.first().copied().unwrap_or_default();
    let (engine, mut sightings) = DiscoveryEngine::new(cfg.discovery.clone(), identity.peer_id(), port);
    let token = CancellationToken::new();
    let handles = engine.spawn(&token);

    println!("Listening for peers for {}s...", timeout.as_secs());
    let mut found = BTreeMap::new();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            next = sightings.recv() => match next {
                Some(s) => {
                    found.entry(s.peer_id.clone()).or_insert(s);
                }
                None => break,
            },
        }
    }
    token.cancel();
    for handle in handles {
        let _ = handle.await;
    }

    if json {
        let list: Vec<_> = found
            .values()
            .map(|s| {
                serde_json::json!({
                    "peer_id": s.peer_id,
                    "address": s.tcp_addr().to_string(),
                    "method": format!("{:?}", s.method),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&list)?);
    } else {
        println!("Discovered {} peer(s):", found.len());
        for s in found.values() {
            println!("  {} @ {} ({:?})", s.peer_id, s.tcp_addr(), s.method);
        }
    }
    Ok(())
}

async fn run_node(cfg: NodeConfig) -> Result<()> {
    let node = Node::start(cfg).await?;
    println!("✓ Node running");
    println!("  Peer ID: {}", node.self_id());
    println!("  Listening on port {}", node.port());
    println!("  Type 'help' for commands, 'quit' or Ctrl+C to stop");

    let mut events = node.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => println!("  ({n} events skipped)"),
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" || line == "exit" {
            break;
        }
        if let Err(e) = run_command(&node, line).await {
            println!("✗ {e:#}");
        }
    }

    node.shutdown().await?;
    printer.abort();
    println!("✓ Stopped");
    Ok(())
}

const HELP: &str = "\
Commands:
  peers                          known peers
  connected                      connected peers
  add <peer_id> <host:port>      add a peer by address
  probe <host:port>              ask an address who it is
  connect <peer_id>              open a connection
  disconnect <peer_id>           close a connection
  remove <peer_id>               forget a peer
  chat <peer_id> <text>          send a chat message (queued if offline)
  presence <peer_id> <status>    send a presence update
  send <peer_id> <path>          offer a file
  transfers                      list transfers
  accept <transfer_id>           accept an offered file
  reject <transfer_id>           decline an offered file
  team-create <name>             create a team
  teams                          list teams
  invite <team_id> <peer_id>     invite a peer into a team
  invitations                    pending invitations
  join <team_id>                 accept an invitation
  kick <team_id> <peer_id>       remove a team member
  set <team_id> <type> <key> <json>
  get <team_id> [type]
  queue                          offline queue entries
  purge                          drop failed queue entries
  quit";

async fn run_command(node: &Node, line: &str) -> Result<()> {
    let mut parts = line.splitn(2, char::is_whitespace);
    let cmd = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or_default().trim();
    let args: Vec<&str> = rest.split_whitespace().collect();
    let arg = |i: usize| nth_arg(&args, i);
    tracing::debug!(command = cmd, "Running command");

    match cmd {
        "help" => println!("{HELP}"),
        "peers" => {
            for p in node.peers() {
                let state = if node.is_connected(&p.id) { "connected" } else { "offline" };
                println!("  {} @ {} via {:?} [{}]", p.id, p.tcp_addr(), p.discovery_method, state);
            }
        }
        "connected" => {
            for id in node.get_connected_peers() {
                println!("  {id}");
            }
        }
        "add" => {
            let addr: SocketAddr = arg(1)?.parse().context("address must be host:port")?;
            node.add_peer(arg(0)?, addr).await?;
            println!("✓ Added {}", arg(0)?);
        }
        "probe" => {
            let addr: SocketAddr = arg(0)?.parse().context("address must be host:port")?;
            match node.probe(addr).await {
                Some(s) => println!("✓ {} answered at {}", s.peer_id, s.tcp_addr()),
                None => println!("✗ No TeamLink peer at {addr}"),
            }
        }
        "connect" => {
            node.connect(arg(0)?).await?;
            println!("✓ Connected to {}", arg(0)?);
        }
        "disconnect" => {
            if !node.disconnect(arg(0)?) {
                println!("  Not connected");
            }
        }
        "remove" => {
            node.remove_peer(arg(0)?).await?;
        }
        "chat" => {
            let peer = arg(0)?;
            let text = rest[peer.len()..].trim();
            let message = Message::Chat {
                message_id: format!("{}-{}", node.self_id(), teamlink_core::now_ms()),
                text: text.to_string(),
                timestamp: teamlink_core::now_ms(),
            };
            print_delivery(node.send_or_queue(peer, message).await?);
        }
        "presence" => {
            let message = Message::Presence { status: arg(1)?.to_string() };
            print_delivery(node.send_or_queue(arg(0)?, message).await?);
        }
        "send" => {
            let peer = arg(0)?;
            let path = PathBuf::from(rest[peer.len()..].trim());
            print_delivery(node.offer_file(peer, &path).await?);
        }
        "transfers" => {
            for t in node.transfers() {
                println!(
                    "  {} {:?} {} ({} bytes) {}/{} chunks {:?}",
                    t.transfer_id, t.direction, t.file_name, t.size, t.chunks_acked, t.total_chunks, t.state
                );
            }
        }
        "accept" => node.accept_transfer(arg(0)?).await?,
        "reject" => node.reject_transfer(arg(0)?).await?,
        "team-create" => {
            let team_id = node.create_team(rest).await?;
            println!("✓ Created team {team_id}");
        }
        "teams" => {
            for t in node.teams() {
                println!("  {} {} members: {}", t.team_id, t.name.unwrap_or_default(), t.members.join(", "));
            }
        }
        "invite" => print_delivery(node.invite(arg(0)?, arg(1)?).await?),
        "invitations" => {
            for i in node.invitations() {
                println!("  {} \"{}\" from {}", i.team_id, i.team_name, i.inviter);
            }
        }
        "join" => print_delivery(node.accept_invitation(arg(0)?).await?),
        "kick" => {
            node.remove_team_member(arg(0)?, arg(1)?).await?;
        }
        "set" => {
            let (team, data_type, key) = (arg(0)?, arg(1)?, arg(2)?);
            let raw = args[3..].join(" ");
            let value = serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw));
            node.set_team_data(team, data_type, key, value).await?;
        }
        "get" => {
            for item in node.get_team_data(arg(0)?, args.get(1).copied()) {
                println!("  {}/{} = {} (v{}, {})", item.data_type, item.data_key, item.value, item.version, item.updated_at);
            }
        }
        "queue" => {
            for e in node.queue_entries() {
                println!(
                    "  {} -> {} {:?} retries={} {:?}",
                    e.id,
                    e.peer_id,
                    e.item.kind(),
                    e.retry_count,
                    e.status
                );
            }
        }
        "purge" => {
            let n = node.purge_failed_queue().await?;
            println!("✓ Purged {n} failed entries");
        }
        other => anyhow::bail!("unknown command '{other}'; try 'help'"),
    }
    Ok(())
}

fn nth_arg<'a>(args: &[&'a str], i: usize) -> Result<&'a str> {
    args.get(i).copied().with_context(|| format!("missing argument {}; try 'help'", i + 1))
}

fn print_delivery(delivery: Delivery) {
    match delivery {
        Delivery::Sent => println!("✓ Sent"),
        Delivery::Offered { transfer_id } => println!("✓ Offered, transfer {transfer_id}"),
        Delivery::Queued { entry_id } => println!("  Peer offline, queued as {entry_id}"),
    }
}

fn print_event(event: &NodeEvent) {
    match event {
        NodeEvent::PeerDiscovered { peer_id, address, method } => {
            println!("+ Discovered {peer_id} at {address} ({method:?})")
        }
        NodeEvent::PeerConnected { peer_id, direction } => println!("← Connected {peer_id} ({direction:?})"),
        NodeEvent::PeerDisconnected { peer_id, reason } => println!("→ Disconnected {peer_id} ({reason:?})"),
        NodeEvent::PeerDead { peer_id } => println!("✗ {peer_id} stopped responding"),
        NodeEvent::PeerAlive { peer_id } => println!("✓ {peer_id} is back"),
        NodeEvent::MessageReceived { peer_id, message } => match message {
            Message::Chat { text, .. } => println!("[{peer_id}] {text}"),
            Message::Presence { status } => println!("  {peer_id} is {status}"),
            Message::TypingIndicator { typing: true, .. } => println!("  {peer_id} is typing..."),
            _ => {}
        },
        NodeEvent::MessageRejected { peer_id, reason } => println!("✗ Dropped frame from {peer_id}: {reason}"),
        NodeEvent::TransferOffered { peer_id, transfer_id, name, size } => {
            println!("← {peer_id} offers {name} ({size} bytes); 'accept {transfer_id}' or 'reject {transfer_id}'")
        }
        NodeEvent::TransferProgress { transfer_id, done, total } => {
            if done == total || done % 16 == 0 {
                println!("  {transfer_id}: {done}/{total} chunks");
            }
        }
        NodeEvent::TransferComplete { transfer_id, path: Some(path) } => {
            println!("✓ Received {transfer_id}: {}", path.display())
        }
        NodeEvent::TransferComplete { transfer_id, path: None } => println!("✓ Sent {transfer_id}"),
        NodeEvent::TransferFailed { transfer_id, reason } => println!("✗ Transfer {transfer_id} failed: {reason}"),
        NodeEvent::TeamDataApplied { team_id, change, from } => {
            println!("  {team_id}: {}/{} = {} (from {from})", change.data_type, change.data_key, change.value)
        }
        NodeEvent::TeamInvitation { team_id, team_name, inviter, .. } => {
            println!("← {inviter} invites you to \"{team_name}\"; 'join {team_id}' to accept")
        }
        NodeEvent::ReconnectFailed { peer_id, attempts } => {
            println!("✗ Gave up reconnecting to {peer_id} after {attempts} attempts")
        }
        NodeEvent::QueueEntryFailed { entry_id, peer_id, retries } => {
            println!("✗ Queued entry {entry_id} for {peer_id} failed after {retries} retries")
        }
    }
}
