//! Freepath CLI
//!
//! Peer-to-peer secure messaging over LAN links and stateless envelopes.

mod config;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use clap::{Parser, Subcommand};
use freepath_core::envelope::{self, Fragment, StatelessEnvelope};
use freepath_core::{
    ContactBook, Frame, FrameType, LocalIdentity, NodeId, ProtocolError, StatefulProtocol,
};
use freepath_transport::LanLinkAdapter;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use config::{Config, ContactEntry, IdentityFile};

/// Interval between dial attempts to configured contacts that are not connected
const REDIAL_INTERVAL: Duration = Duration::from_secs(5);

/// Freepath - authenticated, encrypted node-to-node messaging
#[derive(Parser)]
#[command(name = "freepath")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new node identity
    Keygen {
        /// Output file for the secret keys
        #[arg(short, long)]
        out: PathBuf,

        /// Name to use in the printed contact entry
        #[arg(long, default_value = "me")]
        name: String,
    },

    /// Show the node ID and public keys of an identity
    Id {
        /// Identity file
        #[arg(short, long)]
        identity: PathBuf,
    },

    /// Run a LAN node: send stdin lines `<contact> <text>`, print what arrives
    Run {
        /// Configuration file path
        #[arg(short, long, default_value_os_t = Config::default_path())]
        config: PathBuf,
    },

    /// Seal a stateless envelope for a contact
    Seal {
        /// Configuration file path
        #[arg(short, long, default_value_os_t = Config::default_path())]
        config: PathBuf,

        /// Recipient name or node ID
        #[arg(long)]
        to: String,

        /// Plaintext file (stdin if omitted)
        #[arg(long = "in")]
        input: Option<PathBuf>,
    },

    /// Verify and decrypt a stateless envelope
    Open {
        /// Configuration file path
        #[arg(short, long, default_value_os_t = Config::default_path())]
        config: PathBuf,

        /// Envelope JSON file (stdin if omitted)
        #[arg(long = "in")]
        input: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen { out, name } => {
            init_logging(cli.verbose, "info");
            generate_identity(&out, &name)
        }
        Commands::Id { identity } => {
            init_logging(cli.verbose, "info");
            show_identity(&identity)
        }
        Commands::Run { config } => {
            let (cfg, identity) = load_node(&config, cli.verbose)?;
            run_node(cfg, identity).await
        }
        Commands::Seal { config, to, input } => {
            let (cfg, identity) = load_node(&config, cli.verbose)?;
            seal_envelope(&cfg, &identity, &to, input.as_deref())
        }
        Commands::Open { config, input } => {
            let (cfg, identity) = load_node(&config, cli.verbose)?;
            open_envelope(&cfg, &identity, input.as_deref())
        }
    }
}

/// Logs go to stderr so stdout carries only command output.
fn init_logging(verbose: bool, level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { level }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_node(config_path: &Path, verbose: bool) -> anyhow::Result<(Config, LocalIdentity)> {
    let config = Config::load(config_path)?;
    init_logging(verbose, &config.logging.level.to_lowercase());

    let identity_path = config.identity_path(config_path);
    let identity = IdentityFile::load(&identity_path)?;
    tracing::debug!(
        "Loaded identity {} from {}",
        identity.node_id(),
        identity_path.display()
    );
    Ok((config, identity))
}

/// Generate a new identity and print its shareable contact entry
fn generate_identity(out: &Path, name: &str) -> anyhow::Result<()> {
    let identity = LocalIdentity::generate();
    IdentityFile::from_identity(&identity).save(out)?;

    println!("Node ID: {}", identity.node_id());
    println!("Identity saved to: {}", out.display());
    println!("\nKeep this file secure! It contains your secret keys.");
    println!("\nShare this entry with your contacts:\n");
    print_contact_entry(&ContactEntry::new(name, &identity.contact_info(), None))
}

/// Print the public half of an identity
fn show_identity(path: &Path) -> anyhow::Result<()> {
    let identity = IdentityFile::load(path)?;
    let info = identity.contact_info();

    println!("Node ID:  {}", identity.node_id());
    println!("Sig key:  {}", hex::encode(info.sig_key_public.as_bytes()));
    println!("Enc key:  {}", hex::encode(info.enc_key_public.as_bytes()));
    Ok(())
}

fn print_contact_entry(entry: &ContactEntry) -> anyhow::Result<()> {
    #[derive(serde::Serialize)]
    struct Contacts<'a> {
        contacts: [&'a ContactEntry; 1],
    }
    print!("{}", toml::to_string(&Contacts { contacts: [entry] })?);
    Ok(())
}

/// Run a LAN messaging node until Ctrl+C
async fn run_node(config: Config, identity: LocalIdentity) -> anyhow::Result<()> {
    let identity = Arc::new(identity);
    let contacts = Arc::new(config.contact_book()?);
    let listen_addr = config.parse_listen_addr()?;

    let lan = LanLinkAdapter::new(
        identity.node_id(),
        listen_addr,
        contacts.clone(),
        config.link_config(),
    )?;
    let (app_tx, mut app_rx) = mpsc::unbounded_channel::<(NodeId, Frame)>();
    let protocol = StatefulProtocol::with_config(
        identity.clone(),
        contacts.clone(),
        Arc::new(lan.clone()),
        Arc::new(app_tx),
        config.protocol_config(),
    )?;
    lan.set_link_events(protocol.link_events());
    protocol.start().await?;

    println!("Freepath node {}", identity.node_id());
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    if let Some(addr) = lan.local_addr() {
        println!("Listening on: {addr}");
    }
    println!("Contacts: {}", contacts.len());
    println!("\nType '<contact> <message>' to send, Ctrl+C to stop");

    let dialer = tokio::spawn(redial_contacts(lan.clone(), dial_targets(&config)?));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            Some((peer, frame)) = app_rx.recv() => print_frame(&config, &peer, &frame),
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => send_line(&config, &protocol, &line).await,
                None => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!("\nShutting down...");
    dialer.abort();
    protocol.stop().await?;
    Ok(())
}

fn dial_targets(config: &Config) -> anyhow::Result<Vec<(NodeId, std::net::SocketAddr)>> {
    let mut targets = Vec::new();
    for entry in &config.contacts {
        if let Some(addr) = entry.socket_addr()? {
            targets.push((entry.node_id()?, addr));
        }
    }
    Ok(targets)
}

async fn redial_contacts(lan: LanLinkAdapter, targets: Vec<(NodeId, std::net::SocketAddr)>) {
    if targets.is_empty() {
        return;
    }
    let mut ticker = tokio::time::interval(REDIAL_INTERVAL);
    loop {
        ticker.tick().await;
        for (peer, addr) in &targets {
            if lan.is_connected(peer) {
                continue;
            }
            if let Err(e) = lan.connect(*peer, *addr).await {
                tracing::debug!(%peer, %addr, "Dial failed: {}", e);
            }
        }
    }
}

fn print_frame(config: &Config, peer: &NodeId, frame: &Frame) {
    let from = config.display_name(peer);
    match frame.frame_type() {
        FrameType::Data => {
            println!("[{}] {}", from, String::from_utf8_lossy(&frame.payload));
        }
        FrameType::Ack => tracing::debug!("ACK from {} (seq {})", from, frame.seq),
        other => tracing::debug!("Ignoring {:?} frame from {}", other, from),
    }
}

async fn send_line(config: &Config, protocol: &StatefulProtocol, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let Some((target, text)) = line.split_once(char::is_whitespace) else {
        println!("usage: <contact> <message>");
        return;
    };
    let Some(entry) = config.find_contact(target) else {
        println!("unknown contact: {target}");
        return;
    };
    let peer = match entry.node_id() {
        Ok(peer) => peer,
        Err(e) => {
            println!("{e}");
            return;
        }
    };

    match protocol.send(&peer, text.trim_start().as_bytes()).await {
        Ok(()) => tracing::debug!("Sent {} bytes to {}", text.len(), entry.name),
        Err(ProtocolError::NoSession(_)) => {
            println!("no session with {} yet", entry.name);
        }
        Err(e) => println!("send to {} failed: {}", entry.name, e),
    }
}

fn read_input(input: Option<&Path>) -> anyhow::Result<Vec<u8>> {
    match input {
        Some(path) => {
            std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))
        }
        None => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf)?;
            Ok(buf)
        }
    }
}

fn now_millis() -> anyhow::Result<i64> {
    let elapsed = SystemTime::now().duration_since(UNIX_EPOCH)?;
    Ok(i64::try_from(elapsed.as_millis())?)
}

/// Seal `input` for a contact and print the envelope JSON
fn seal_envelope(
    config: &Config,
    identity: &LocalIdentity,
    to: &str,
    input: Option<&Path>,
) -> anyhow::Result<()> {
    let entry = config
        .find_contact(to)
        .ok_or_else(|| anyhow::anyhow!("unknown contact: {}", to))?;
    let info = entry.info()?;
    let plaintext = read_input(input)?;

    let sealed = envelope::seal(
        identity,
        &info.node_id(),
        &info.enc_key_public,
        &plaintext,
        now_millis()?,
        Fragment::default(),
    )?;
    tracing::info!("Sealed {} bytes for {}", plaintext.len(), entry.name);

    println!("{}", String::from_utf8(sealed.encode()?)?);
    Ok(())
}

/// Verify and decrypt an envelope addressed to this node
fn open_envelope(
    config: &Config,
    identity: &LocalIdentity,
    input: Option<&Path>,
) -> anyhow::Result<()> {
    let contacts: ContactBook = config.contact_book()?;
    let raw = read_input(input)?;
    let sealed = StatelessEnvelope::decode(raw.trim_ascii())?;
    let plaintext = envelope::open(&sealed, identity, &contacts)?;

    let sender = sealed
        .sender_id
        .parse::<NodeId>()
        .map_or_else(|_| sealed.sender_id.clone(), |id| config.display_name(&id));
    tracing::info!(
        "Envelope from {} ({} of {}), timestamp {}",
        sender,
        sealed.fragment_index + 1,
        sealed.fragment_count,
        sealed.timestamp
    );

    println!("[{}] {}", sender, String::from_utf8_lossy(&plaintext));
    Ok(())
}
