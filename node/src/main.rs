use anyhow::{anyhow, Context, Result};
use clap::{value_parser, Arg, ArgAction, Command};
use config::{Config, File as ConfigFile};
use peercoord_crypto::{Ecies, Keyring};
use peercoord_p2p::{
    bootstrap_relays, CoordOptions, CoordTimings, CoordinationEngine, DirectMessage, Libp2pConfig,
    Libp2pEvent, Libp2pNetwork, Multiaddr, NodeType, PeerEviction,
};
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod message_log;
mod version;

use message_log::SledMessageLog;
use version::{git_commit_hash, API_VERSION, PEERCOORD_VERSION};

const DEFAULT_LISTEN: &str = "/ip4/0.0.0.0/tcp/4001";
const KEY_FILE_NAME: &str = "node.key";
const MESSAGE_DB_DIR: &str = "messages";

/// Application configuration
#[derive(Debug, Clone, PartialEq)]
struct AppConfig {
    config_path: Option<PathBuf>,

    // Node identity
    node_type: NodeType,
    circuit_relay: bool,
    handle: Option<String>,

    // Network
    listen_addresses: Vec<String>,
    relays: Vec<String>,

    // Storage
    data_dir: PathBuf,
    key_file: PathBuf,

    // Cadences
    relay_interval_secs: u64,
    peer_interval_secs: u64,
    announce_interval_secs: u64,
    bootstrap_grace_secs: u64,

    // Peer registry bounds
    peer_ttl_secs: Option<u64>,
    max_peers: usize,

    // Logging
    log_level: String,
    log_format: String,
}

impl AppConfig {
    fn load(config_path_override: Option<&str>) -> Result<Self> {
        let resolved_path = match config_path_override {
            Some(path) => {
                let path = PathBuf::from(path);
                if !path.exists() {
                    anyhow::bail!(
                        "Configuration file {} not found (specified via --config)",
                        path.display()
                    );
                }
                Some(path)
            }
            None => None,
        };

        let mut builder = Config::builder();
        if let Some(path) = &resolved_path {
            builder = builder.add_source(ConfigFile::from(path.as_path()));
        }
        builder = builder.add_source(config::Environment::with_prefix("PEERCOORD"));
        let config = builder.build()?;

        let timings = CoordTimings::default();
        let eviction = PeerEviction::default();

        let node_type = match get_string_value(&config, &["node_type", "node.type"]) {
            Some(raw) => NodeType::from_str(&raw).map_err(|e| anyhow!("node type: {e}"))?,
            None => NodeType::Node,
        };

        let data_dir = get_string_value(&config, &["data_dir", "node.data_dir"])
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);
        let key_file = get_string_value(&config, &["key_file", "node.key_file"])
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join(KEY_FILE_NAME));

        let mut listen_addresses = get_list_value(&config, &["listen", "network.listen"]);
        if listen_addresses.is_empty() {
            listen_addresses.push(DEFAULT_LISTEN.to_string());
        }

        Ok(Self {
            config_path: resolved_path,
            node_type,
            circuit_relay: get_bool_value(&config, &["circuit_relay", "node.circuit_relay"], false),
            handle: get_string_value(&config, &["handle", "node.handle"]),
            listen_addresses,
            relays: get_list_value(&config, &["relays", "network.relays"]),
            data_dir,
            key_file,
            relay_interval_secs: get_u64_value(
                &config,
                &["relay_interval_secs", "timings.relay_interval_secs"],
            )
            .unwrap_or(timings.relay_interval.as_secs()),
            peer_interval_secs: get_u64_value(
                &config,
                &["peer_interval_secs", "timings.peer_interval_secs"],
            )
            .unwrap_or(timings.peer_interval.as_secs()),
            announce_interval_secs: get_u64_value(
                &config,
                &["announce_interval_secs", "timings.announce_interval_secs"],
            )
            .unwrap_or(timings.announce_interval.as_secs()),
            bootstrap_grace_secs: get_u64_value(
                &config,
                &["bootstrap_grace_secs", "timings.bootstrap_grace_secs"],
            )
            .unwrap_or(timings.bootstrap_grace.as_secs()),
            peer_ttl_secs: get_u64_value(&config, &["peer_ttl_secs", "peers.ttl_secs"]),
            max_peers: get_u64_value(&config, &["max_peers", "peers.max_peers"])
                .map(|value| value as usize)
                .unwrap_or(eviction.max_peers),
            log_level: get_string_value(&config, &["log_level", "log.level"])
                .unwrap_or_else(|| "info".to_string()),
            log_format: get_string_value(&config, &["log_format", "log.format"])
                .unwrap_or_else(|| "pretty".to_string()),
        })
    }

    fn validate(&self) -> Result<()> {
        if self.listen_addresses.is_empty() {
            anyhow::bail!("At least one listen address is required");
        }
        for (label, value) in [
            ("relay_interval_secs", self.relay_interval_secs),
            ("peer_interval_secs", self.peer_interval_secs),
            ("announce_interval_secs", self.announce_interval_secs),
        ] {
            if value == 0 {
                anyhow::bail!("{label} must be greater than zero");
            }
        }
        if self.max_peers == 0 {
            anyhow::bail!("max_peers must be greater than zero");
        }
        if self.peer_ttl_secs == Some(0) {
            anyhow::bail!("peer_ttl_secs must be greater than zero when set");
        }
        if !matches!(self.log_format.as_str(), "pretty" | "json") {
            anyhow::bail!(
                "Unsupported log format '{}' (expected pretty or json)",
                self.log_format
            );
        }
        Ok(())
    }

    fn timings(&self) -> CoordTimings {
        CoordTimings {
            relay_interval: Duration::from_secs(self.relay_interval_secs),
            peer_interval: Duration::from_secs(self.peer_interval_secs),
            announce_interval: Duration::from_secs(self.announce_interval_secs),
            bootstrap_grace: Duration::from_secs(self.bootstrap_grace_secs),
            ..CoordTimings::default()
        }
    }

    fn eviction(&self) -> PeerEviction {
        PeerEviction {
            ttl: self.peer_ttl_secs.map(Duration::from_secs),
            max_peers: self.max_peers,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("peercoord")
}

fn get_string_value(config: &Config, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        config
            .get_string(key)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

fn get_bool_value(config: &Config, keys: &[&str], default: bool) -> bool {
    for key in keys {
        if let Ok(value) = config.get_bool(key) {
            return value;
        }
        if let Ok(raw) = config.get_string(key) {
            if let Ok(parsed) = raw.parse::<bool>() {
                return parsed;
            }
        }
    }
    default
}

fn get_u64_value(config: &Config, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|key| {
        config
            .get_int(key)
            .ok()
            .and_then(|value| u64::try_from(value).ok())
            .or_else(|| {
                config
                    .get_string(key)
                    .ok()
                    .and_then(|raw| raw.trim().parse().ok())
            })
    })
}

/// Arrays from a config file, or comma separated strings from the environment.
fn get_list_value(config: &Config, keys: &[&str]) -> Vec<String> {
    for key in keys {
        if let Ok(values) = config.get_array(key) {
            return values
                .into_iter()
                .filter_map(|value| value.into_string().ok())
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .collect();
        }
        if let Some(raw) = get_string_value(config, &[key]) {
            return split_list(&raw);
        }
    }
    Vec::new()
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_multiaddrs(values: &[String], label: &str) -> Vec<Multiaddr> {
    values
        .iter()
        .filter_map(|value| {
            if value.is_empty() {
                return None;
            }
            match Multiaddr::from_str(value) {
                Ok(addr) => Some(addr),
                Err(err) => {
                    warn!("Invalid {} multiaddr {}: {}", label, value, err);
                    None
                }
            }
        })
        .collect()
}

fn build_cli() -> Command {
    Command::new("peercoord-node")
        .version(PEERCOORD_VERSION)
        .about("Peer coordination node: circuit relays, peer discovery and encrypted direct messages")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("node-type")
                .long("node-type")
                .value_name("TYPE")
                .value_parser(["node", "browser"])
                .help("Node type announced to peers; selects the bootstrap relay table"),
        )
        .arg(
            Arg::new("listen")
                .short('l')
                .long("listen")
                .value_name("MULTIADDR")
                .action(ArgAction::Append)
                .help("Listen address (repeatable)"),
        )
        .arg(
            Arg::new("relay")
                .short('r')
                .long("relay")
                .value_name("MULTIADDR")
                .action(ArgAction::Append)
                .help("Extra circuit relay to maintain (repeatable)"),
        )
        .arg(
            Arg::new("circuit-relay")
                .long("circuit-relay")
                .action(ArgAction::SetTrue)
                .help("Serve as a circuit relay for other peers"),
        )
        .arg(
            Arg::new("handle")
                .long("handle")
                .value_name("NAME")
                .help("Display name attached to outgoing chat messages"),
        )
        .arg(
            Arg::new("key-file")
                .short('k')
                .long("key-file")
                .value_name("FILE")
                .help("Encryption key file (created when missing)"),
        )
        .arg(
            Arg::new("data-dir")
                .short('d')
                .long("data-dir")
                .value_name("DIR")
                .help("Data directory"),
        )
        .arg(
            Arg::new("max-peers")
                .long("max-peers")
                .value_name("COUNT")
                .value_parser(value_parser!(usize))
                .help("Maximum number of peers kept in the registry"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("Override the log level"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["pretty", "json"])
                .help("Select log output format"),
        )
}

fn load_config_with_overrides(matches: &clap::ArgMatches) -> Result<AppConfig> {
    let config_path = matches
        .get_one::<String>("config")
        .map(|value| value.as_str());
    let mut config = AppConfig::load(config_path)?;
    apply_overrides(matches, &mut config)?;
    config.validate()?;
    Ok(config)
}

fn apply_overrides(matches: &clap::ArgMatches, config: &mut AppConfig) -> Result<()> {
    if let Some(node_type) = matches.get_one::<String>("node-type") {
        config.node_type = NodeType::from_str(node_type).map_err(|e| anyhow!("node type: {e}"))?;
    }

    if let Some(listen) = matches.get_many::<String>("listen") {
        config.listen_addresses = listen.cloned().collect();
    }

    if let Some(relays) = matches.get_many::<String>("relay") {
        config.relays.extend(relays.cloned());
    }

    if matches.get_flag("circuit-relay") {
        config.circuit_relay = true;
    }

    if let Some(handle) = matches.get_one::<String>("handle") {
        config.handle = Some(handle.clone());
    }

    if let Some(data_dir) = matches.get_one::<String>("data-dir") {
        let previous_default = config.data_dir.join(KEY_FILE_NAME);
        config.data_dir = PathBuf::from(data_dir);
        if config.key_file == previous_default {
            config.key_file = config.data_dir.join(KEY_FILE_NAME);
        }
    }

    if let Some(key_file) = matches.get_one::<String>("key-file") {
        config.key_file = PathBuf::from(key_file);
    }

    if let Some(max_peers) = matches.get_one::<usize>("max-peers") {
        config.max_peers = *max_peers;
    }

    if let Some(log_level) = matches.get_one::<String>("log-level") {
        config.log_level = log_level.clone();
    }

    if let Some(log_format) = matches.get_one::<String>("log-format") {
        config.log_format = log_format.clone();
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();
    let config = load_config_with_overrides(&matches)?;
    init_logging(&config)?;

    info!(
        "Starting peercoord node {} (commit {}, wire API {})",
        PEERCOORD_VERSION,
        git_commit_hash(),
        API_VERSION
    );
    if let Some(path) = &config.config_path {
        info!("Loaded configuration from {}", path.display());
    }

    fs::create_dir_all(&config.data_dir).with_context(|| {
        format!("creating data directory {}", config.data_dir.display())
    })?;
    let keyring = Arc::new(
        Keyring::load_or_generate(&config.key_file)
            .with_context(|| format!("loading key file {}", config.key_file.display()))?,
    );

    let mut relay_addresses: Vec<String> = bootstrap_relays(config.node_type)
        .into_iter()
        .map(|relay| relay.address)
        .collect();
    relay_addresses.extend(config.relays.iter().cloned());

    let network = Arc::new(Libp2pNetwork::new(Libp2pConfig {
        listen_addresses: parse_multiaddrs(&config.listen_addresses, "listen"),
        reservation_relays: parse_multiaddrs(&relay_addresses, "relay"),
        enable_relay_server: config.circuit_relay,
        ..Libp2pConfig::default()
    })?);
    let peer_id = network.peer_id().to_string();

    let message_log = Arc::new(
        SledMessageLog::open(config.data_dir.join(MESSAGE_DB_DIR), &peer_id)
            .context("opening message log")?,
    );
    info!("Logging direct messages to tree {}", message_log.name());

    let mut options = CoordOptions::new(network.clone(), keyring.clone(), Arc::new(Ecies::new()))
        .with_node_type(config.node_type)
        .with_circuit_relay(config.circuit_relay)
        .with_timings(config.timings())
        .with_eviction(config.eviction())
        .with_message_log(message_log.clone());
    for (index, address) in config.relays.iter().enumerate() {
        options = options.with_extra_relay(format!("configured-{}", index + 1), address.clone());
    }

    let engine = CoordinationEngine::new(options)?;
    let mut inbox = engine
        .take_inbox()
        .ok_or_else(|| anyhow!("direct message inbox already taken"))?;

    let bootstrap_task = tokio::spawn({
        let engine = engine.clone();
        async move {
            if let Err(err) = engine.bootstrap().await {
                error!("Bootstrap failed: {}", err);
            }
        }
    });

    let inbox_task = tokio::spawn(async move {
        while let Some(message) = inbox.recv().await {
            log_direct_message(&message);
        }
    });

    let events_task = network.take_event_receiver().map(|mut events| {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                log_network_event(&event);
            }
        })
    });

    let console_task = tokio::spawn(run_console(engine.clone(), config.handle.clone()));

    info!("Node ID: {}", peer_id);
    info!("Encryption address: {}", keyring.address());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down peercoord node");

    bootstrap_task.abort();
    console_task.abort();
    engine.shutdown().await;
    network.shutdown();
    inbox_task.abort();
    if let Some(task) = events_task {
        task.abort();
    }

    message_log.flush().context("flushing message log")?;

    info!("peercoord node shutdown complete");
    Ok(())
}

fn log_direct_message(message: &DirectMessage) {
    match &message.chat {
        Some(chat) => info!(
            from = %message.from,
            handle = chat.data.handle.as_deref().unwrap_or("-"),
            "Chat: {}",
            chat.data.message
        ),
        None => info!(from = %message.from, "Direct message: {}", message.plaintext),
    }
}

fn log_network_event(event: &Libp2pEvent) {
    match event {
        Libp2pEvent::PeerConnected { peer } => debug!("Connected to {}", peer),
        Libp2pEvent::PeerDisconnected { peer } => debug!("Disconnected from {}", peer),
        Libp2pEvent::NewListenAddr { address } => info!("Listening on {}", address),
        Libp2pEvent::RelayReservationAccepted { relay } => {
            info!("Circuit reservation accepted by relay {}", relay)
        }
        Libp2pEvent::HolePunchSucceeded { peer } => info!("Direct connection upgraded with {}", peer),
        Libp2pEvent::HolePunchFailed { peer, error } => {
            debug!("Hole punch with {} failed: {}", peer, error)
        }
    }
}

/// Commands read from stdin.
#[derive(Debug, PartialEq, Eq)]
enum ConsoleCommand<'a> {
    Peers,
    Relays,
    Send { peer: &'a str, message: &'a str },
}

impl<'a> ConsoleCommand<'a> {
    fn parse(line: &'a str) -> Option<Self> {
        let line = line.trim();
        match line {
            "" => None,
            "/peers" => Some(Self::Peers),
            "/relays" => Some(Self::Relays),
            _ => {
                let (peer, message) = line.split_once(char::is_whitespace)?;
                let message = message.trim();
                if peer.starts_with('/') || message.is_empty() {
                    return None;
                }
                Some(Self::Send { peer, message })
            }
        }
    }
}

async fn run_console(engine: Arc<CoordinationEngine>, handle: Option<String>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!("Console input closed: {}", err);
                break;
            }
        };

        match ConsoleCommand::parse(&line) {
            Some(ConsoleCommand::Peers) => {
                for peer in engine.peers() {
                    info!(
                        "{} ({}) seen {}",
                        peer.ipfs_id,
                        peer.node_type,
                        peer.updated_at.to_rfc3339()
                    );
                }
            }
            Some(ConsoleCommand::Relays) => {
                for relay in engine.relays() {
                    info!("{} {} connected={}", relay.name, relay.address, relay.connected);
                }
            }
            Some(ConsoleCommand::Send { peer, message }) => {
                if let Err(err) = engine
                    .send_private_message(peer, message, handle.as_deref())
                    .await
                {
                    warn!("Could not send to {}: {}", peer, err);
                }
            }
            None => {
                if !line.trim().is_empty() {
                    warn!("Usage: <peer id> <message> | /peers | /relays");
                }
            }
        }
    }
}

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_config() -> PathBuf {
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("config")
            .join("peercoord.toml")
    }

    fn parse(args: &[&str]) -> clap::ArgMatches {
        let mut argv = vec!["peercoord-node"];
        argv.extend_from_slice(args);
        build_cli().try_get_matches_from(argv).unwrap()
    }

    #[test]
    fn sample_config_loads() {
        let path = fixture_config();
        let config = AppConfig::load(Some(path.to_str().unwrap())).unwrap();

        assert_eq!(config.node_type, NodeType::Node);
        assert!(!config.circuit_relay);
        assert_eq!(config.listen_addresses, vec![DEFAULT_LISTEN.to_string()]);
        assert_eq!(config.relay_interval_secs, 60);
        assert_eq!(config.peer_interval_secs, 21);
        assert_eq!(config.announce_interval_secs, 22);
        assert_eq!(config.max_peers, 1024);
        assert_eq!(config.data_dir, PathBuf::from("./data/peercoord"));
        assert_eq!(config.key_file, PathBuf::from("./data/peercoord/node.key"));
        assert_eq!(config.timings(), CoordTimings::default());
        config.validate().unwrap();
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let err = AppConfig::load(Some("/definitely/not/here.toml")).unwrap_err();
        assert!(err.to_string().contains("not found"), "unexpected error: {err}");
    }

    #[test]
    fn cli_flags_override_file_values() {
        let path = fixture_config();
        let mut config = AppConfig::load(Some(path.to_str().unwrap())).unwrap();
        let matches = parse(&[
            "--node-type",
            "browser",
            "--listen",
            "/ip4/127.0.0.1/tcp/0",
            "--relay",
            "/ip4/10.0.0.9/tcp/4001/p2p/QmRelay",
            "--circuit-relay",
            "--data-dir",
            "/tmp/pc",
            "--max-peers",
            "16",
            "--log-format",
            "json",
        ]);

        apply_overrides(&matches, &mut config).unwrap();

        assert_eq!(config.node_type, NodeType::Browser);
        assert!(config.circuit_relay);
        assert_eq!(config.listen_addresses, vec!["/ip4/127.0.0.1/tcp/0".to_string()]);
        assert_eq!(
            config.relays,
            vec!["/ip4/10.0.0.9/tcp/4001/p2p/QmRelay".to_string()]
        );
        assert_eq!(config.key_file, PathBuf::from("/tmp/pc/node.key"));
        assert_eq!(config.eviction().max_peers, 16);
        assert_eq!(config.log_format, "json");
    }

    #[test]
    fn explicit_key_file_survives_data_dir_override() {
        let path = fixture_config();
        let mut config = AppConfig::load(Some(path.to_str().unwrap())).unwrap();
        let matches = parse(&["--key-file", "/keys/me.key", "--data-dir", "/tmp/pc"]);

        apply_overrides(&matches, &mut config).unwrap();

        assert_eq!(config.key_file, PathBuf::from("/keys/me.key"));
        assert_eq!(config.data_dir, PathBuf::from("/tmp/pc"));
    }

    #[test]
    fn validation_rejects_zero_cadence() {
        let path = fixture_config();
        let mut config = AppConfig::load(Some(path.to_str().unwrap())).unwrap();
        config.announce_interval_secs = 0;

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("announce_interval_secs"));
    }

    #[test]
    fn comma_separated_lists_are_split() {
        assert_eq!(
            split_list(" /ip4/1.1.1.1/tcp/1 ,, /ip4/2.2.2.2/tcp/2"),
            vec!["/ip4/1.1.1.1/tcp/1".to_string(), "/ip4/2.2.2.2/tcp/2".to_string()]
        );
    }

    #[test]
    fn invalid_multiaddrs_are_skipped() {
        let parsed = parse_multiaddrs(
            &["/ip4/127.0.0.1/tcp/4001".to_string(), "not-an-addr".to_string()],
            "listen",
        );
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn console_commands() {
        assert_eq!(ConsoleCommand::parse("/peers"), Some(ConsoleCommand::Peers));
        assert_eq!(ConsoleCommand::parse(" /relays "), Some(ConsoleCommand::Relays));
        assert_eq!(
            ConsoleCommand::parse("QmBob  hello there"),
            Some(ConsoleCommand::Send {
                peer: "QmBob",
                message: "hello there"
            })
        );
        assert_eq!(ConsoleCommand::parse("QmBob"), None);
        assert_eq!(ConsoleCommand::parse("/unknown thing"), None);
        assert_eq!(ConsoleCommand::parse("   "), None);
    }
}
