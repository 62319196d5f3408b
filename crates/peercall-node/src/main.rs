use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use peercall_crypto::PublicKey;
use peercall_node::address::Candidate;
use peercall_node::media::PassthroughMedia;
use peercall_node::network::SystemNetwork;
use peercall_node::store::StoreError;
use peercall_node::{
    acceptor, presence, CallSession, Contact, NodeConfig, NodeEvent, NodeState, Notifier,
    Settings, StoreOwner,
};

#[derive(Parser)]
#[command(name = "peercall-node", about = "Peer-to-peer call signaling node")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (IP), overrides config
    #[arg(long)]
    host: Option<String>,

    /// Signaling port, overrides config
    #[arg(long)]
    port: Option<u16>,

    /// Port to dial contacts on, overrides config
    #[arg(long)]
    peer_port: Option<u16>,

    /// Database file, overrides config
    #[arg(long)]
    store: Option<PathBuf>,

    /// Database password (may be empty)
    #[arg(long, env = "PEERCALL_PASSWORD", default_value = "", hide_env_values = true)]
    password: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new identity and database
    Init {
        /// Name shown to contacts
        #[arg(long)]
        name: String,
        /// Addresses to advertise in the contact card
        #[arg(long = "address")]
        addresses: Vec<String>,
    },
    /// Print this node's contact card as JSON
    Identity,
    /// Add a contact from its JSON contact card
    AddContact {
        /// Contact card, or @path to read it from a file
        card: String,
    },
    /// List contacts
    Contacts,
    /// Check which contacts are reachable
    Ping,
    /// Call a contact by public key
    Call { public_key: String },
    /// Listen for pings and calls until interrupted. Incoming calls are
    /// answered from stdin unless --auto-accept is given
    Run {
        /// Answer incoming calls without asking
        #[arg(long)]
        auto_accept: bool,
    },
    /// Write an encrypted backup of the database
    Export { path: PathBuf },
    /// Merge an encrypted backup into the database
    Import {
        path: PathBuf,
        /// Password of the backup, defaults to the database password
        #[arg(long)]
        backup_password: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "peercall_node=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let notifier = Notifier::default();

    let command = match args.command {
        Command::Init { name, addresses } => {
            return init(&config, &args.password, name, &addresses, notifier).await;
        }
        command => command,
    };

    let store = match StoreOwner::open(&config.store_path, &args.password, notifier).await {
        Ok(store) => store,
        Err(StoreError::NotFound) => bail!(
            "no database at {}, run `peercall-node init` first",
            config.store_path.display()
        ),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to open {}", config.store_path.display()))
        }
    };

    match command {
        Command::Init { .. } => {}
        Command::Identity => {
            let own = store.settings().await.own_contact();
            println!("{}", serde_json::to_string_pretty(&own)?);
        }
        Command::AddContact { card } => {
            let card = match card.strip_prefix('@') {
                Some(path) => fs::read_to_string(path)
                    .with_context(|| format!("failed to read contact card: {}", path))?,
                None => card,
            };
            let contact: Contact = serde_json::from_str(&card).context("invalid contact card")?;
            let name = contact.name.clone();
            if !store.add_contact(contact).await? {
                bail!("a contact with this public key already exists");
            }
            info!(contact = %name, "contact added");
        }
        Command::Contacts => {
            for contact in store.contacts().await {
                let addresses: Vec<String> =
                    contact.addresses().iter().map(ToString::to_string).collect();
                println!(
                    "{}\t{}\t{}{}",
                    contact.public_key(),
                    contact.name,
                    addresses.join(","),
                    if contact.blocked { "\tblocked" } else { "" }
                );
            }
        }
        Command::Ping => {
            let node = start_node(config, store).await?;
            for result in presence::probe_all(&node).await {
                let name = node
                    .store
                    .contact(&result.public_key)
                    .await
                    .map(|c| c.name)
                    .unwrap_or_default();
                println!("{}\t{}\t{:?}", result.public_key.short(), name, result.state);
            }
        }
        Command::Call { public_key } => {
            let key: PublicKey = public_key.parse().context("invalid public key")?;
            let node = start_node(config, store).await?;
            let call = node.start_call(&key).await?;
            call.start();
            follow_call(&node, &call).await;
        }
        Command::Run { auto_accept } => {
            let node = start_node(config, store).await?;
            run(node, auto_accept).await?;
        }
        Command::Export { path } => {
            let blob = store.export().await?;
            fs::write(&path, blob)
                .with_context(|| format!("failed to write backup: {}", path.display()))?;
            info!(path = %path.display(), "backup written");
        }
        Command::Import {
            path,
            backup_password,
        } => {
            let blob = fs::read(&path)
                .with_context(|| format!("failed to read backup: {}", path.display()))?;
            let password = backup_password.unwrap_or(args.password);
            store
                .import(blob, &password)
                .await
                .context("failed to import backup")?;
            info!(path = %path.display(), "backup merged");
        }
    }

    Ok(())
}

async fn init(
    config: &NodeConfig,
    password: &str,
    name: String,
    addresses: &[String],
    notifier: Notifier,
) -> Result<()> {
    let mut settings = Settings::generate(name);
    settings.addresses = addresses
        .iter()
        .map(|a| a.parse::<Candidate>().with_context(|| format!("invalid address {a}")))
        .collect::<Result<_>>()?;
    let store = StoreOwner::create(&config.store_path, password, settings, notifier)
        .await
        .with_context(|| format!("failed to create {}", config.store_path.display()))?;
    let own = store.settings().await.own_contact();
    println!("{}", serde_json::to_string_pretty(&own)?);
    Ok(())
}

fn load_config(args: &Args) -> Result<NodeConfig> {
    let mut config = if let Some(path) = &args.config {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&content)?
    } else {
        NodeConfig::default()
    };

    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(port) = args.peer_port {
        config.peer_port = port;
    }
    if let Some(store) = &args.store {
        config.store_path = store.clone();
    }
    Ok(config)
}

async fn start_node(config: NodeConfig, store: StoreOwner) -> Result<Arc<NodeState>> {
    let node = NodeState::new(
        config,
        store,
        Arc::new(SystemNetwork),
        Arc::new(PassthroughMedia),
    )
    .await?;
    info!(identity = %node.identity.public().short(), "node ready");
    Ok(node)
}

/// Print state changes of `call` until it ends. Ctrl-C hangs up.
async fn follow_call(node: &NodeState, call: &Arc<CallSession>) {
    let mut events = node.notifier.subscribe();
    let peer = *call.contact().public_key();
    while !call.state().is_terminal() {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                call.hangup().await;
            }
            event = events.recv() => match event {
                Ok(NodeEvent::CallStateChanged { peer: p, state }) if p == peer => {
                    println!("{state}");
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

/// Whether a line typed at the incoming call prompt means yes.
fn parse_answer(line: &str) -> bool {
    matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

async fn run(node: Arc<NodeState>, auto_accept: bool) -> Result<()> {
    let listener = acceptor::bind(&node.config.host, node.config.port).with_context(|| {
        format!(
            "failed to bind signaling on {}:{}",
            node.config.host, node.config.port
        )
    })?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let acceptor_task = tokio::spawn(acceptor::run_acceptor(
        listener,
        node.clone(),
        shutdown_rx,
    ));

    let mut events = node.notifier.subscribe();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut ringing: Option<Arc<CallSession>> = None;
    info!(auto_accept, "node running, press Ctrl-C to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = stdin.next_line(), if ringing.is_some() => {
                let Some(call) = ringing.take() else { continue };
                match line {
                    Ok(Some(line)) if parse_answer(&line) => {
                        call.accept();
                    }
                    Ok(_) => {
                        call.decline();
                    }
                    Err(e) => {
                        warn!("cannot read answer: {}", e);
                        call.decline();
                    }
                }
            }
            event = events.recv() => match event {
                Ok(NodeEvent::IncomingCall(call)) => {
                    println!("incoming call from {} ({})", call.contact().name, call.contact().public_key().short());
                    if auto_accept {
                        call.accept();
                    } else {
                        println!("accept? [y/N]");
                        ringing = Some(call);
                    }
                }
                Ok(NodeEvent::CallStateChanged { peer, state }) => {
                    println!("{} {}", peer.short(), state);
                    if ringing.as_ref().is_some_and(|c| *c.contact().public_key() == peer && state.is_terminal()) {
                        ringing = None;
                    }
                }
                Ok(NodeEvent::CallRejected { peer }) => println!("refused call from {}", peer.short()),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "event stream lagged"),
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    info!("shutting down");
    if let Some(call) = node.current_call() {
        call.hangup().await;
    }
    node.announce_offline().await;
    let _ = shutdown_tx.send(true);
    if let Err(e) = acceptor_task.await {
        warn!("acceptor task failed: {}", e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answer_prompt() {
        assert!(parse_answer("y"));
        assert!(parse_answer(" Yes\n"));
        assert!(!parse_answer(""));
        assert!(!parse_answer("n"));
        assert!(!parse_answer("yep"));
    }
}
