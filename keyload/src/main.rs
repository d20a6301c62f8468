mod offline;
mod output;

use std::io::{self, BufRead, Read as _};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result, anyhow, bail};
use keyload_agent::SessionAgent;
use keyload_core::config::{self, Config};
use keyload_core::{Agent, KeyId, KeyManager, LoadedKey};
use keyload_store::FileStore;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use crate::offline::OfflineAgent;
use crate::output::OutputFormat;

#[tokio::main]
async fn main() -> Result<()> {
    // Reset SIGPIPE to default so piping output to `head` etc. exits cleanly
    // instead of panicking with "broken pipe".
    // SAFETY: restoring a default signal disposition has no preconditions.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let (config_path, args) = split_config_arg(std::env::args().skip(1).collect())?;
    let config_path = config_path.unwrap_or_else(config::default_config_path);

    run(config_path, &args).await
}

async fn run(config_path: PathBuf, args: &[String]) -> Result<()> {
    let cmd = args.first().map(String::as_str).unwrap_or("help");

    // Help must work even when the config file is broken.
    if matches!(cmd, "help" | "--help" | "-h") {
        print_help();
        return Ok(());
    }

    let ctx = Ctx::open(config_path)?;

    match cmd {
        "list" | "ls" => cmd_list(&ctx, &args[1..]).await,
        "add" => cmd_add(&ctx, &args[1..]).await,
        "remove" | "rm" => cmd_remove(&ctx, &args[1..]).await,
        "loaded" => cmd_loaded(&ctx, &args[1..]).await,
        "load" => cmd_load(&ctx, &args[1..]).await,
        "unload" => cmd_unload(&ctx, &args[1..]).await,
        "status" => cmd_status(&ctx).await,
        other => {
            eprintln!("unknown command: {other}");
            print_help();
            std::process::exit(1);
        }
    }
}

fn print_help() {
    println!(
        "\
keyload - keep SSH private keys in a local store and load them into an agent

USAGE:
    keyload [--config <path>] <command> [args...]

COMMANDS:
    list [--format=<fmt>]               List configured keys (alias: ls)
    add <name> [<pem-file>|-]           Store a PEM private key under <name>
                                        (reads stdin when no file or '-' is given)
    remove <id>                         Delete a configured key (alias: rm)
                                        Keys already loaded stay loaded
    loaded [--format=<fmt>]             List keys currently held by the agent
    load [--passphrase-stdin] <id>      Load a configured key into the agent
                                        Prompts for the passphrase if the key is encrypted
    unload <id|fingerprint>             Remove a loaded key from the agent
    unload --all                        Remove every key loaded by keyload
    status                              Show store and agent status
    help                                Show this help

OUTPUT FORMATS (--format):
    table                               Aligned columns [default]
    json                                JSON array

AGENT:
    By default keyload talks to keyloadd at $XDG_RUNTIME_DIR/keyload/agent.sock.
    Set `use_ssh_auth_sock = true` under [agent] in the config file to use the
    agent named by $SSH_AUTH_SOCK instead.

EXAMPLES:
    keyload add work ~/.ssh/id_ed25519
    keyload list
    keyload load 4811298392049216931
    keyload loaded --format=json
    keyload unload SHA256:2aSp0ZB3wK5hPIKF0lH0Xl1h6uWWqcNhn4wBmL9JQ5E
    keyload unload --all"
    );
}

/// Pull `--config <path>` / `--config=<path>` out of `args`.
fn split_config_arg(args: Vec<String>) -> Result<(Option<PathBuf>, Vec<String>)> {
    let mut path = None;
    let mut rest = Vec::with_capacity(args.len());
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" || arg == "-c" {
            let value = iter
                .next()
                .ok_or_else(|| anyhow!("--config requires a path argument"))?;
            path = Some(PathBuf::from(value));
        } else if let Some(value) = arg.strip_prefix("--config=") {
            path = Some(PathBuf::from(value));
        } else {
            rest.push(arg);
        }
    }
    Ok((path, rest))
}

fn parse_format(args: &[String]) -> Result<(OutputFormat, Vec<&str>)> {
    let mut format = OutputFormat::Table;
    let mut rest = Vec::new();
    for arg in args {
        if let Some(fmt_str) = arg.strip_prefix("--format=") {
            format = OutputFormat::parse(fmt_str)
                .ok_or_else(|| anyhow!("unknown format '{fmt_str}': use table or json"))?;
        } else if arg == "--format" {
            bail!("--format requires a value: --format=table|json");
        } else {
            rest.push(arg.as_str());
        }
    }
    Ok((format, rest))
}

// ---------------------------------------------------------------------------
// Command context
// ---------------------------------------------------------------------------

struct Ctx {
    config_path: PathBuf,
    config: Config,
}

impl Ctx {
    fn open(config_path: PathBuf) -> Result<Self> {
        let config = config::load(&config_path)?;
        config::check_permissions(&config_path);
        Ok(Self {
            config_path,
            config,
        })
    }

    /// A manager over the configured store and agent.
    ///
    /// An unreachable agent is not an error here; only commands that need
    /// it fail, with the connection error.
    async fn manager(&self) -> KeyManager {
        let store = Arc::new(FileStore::new(self.config.store_path()));
        KeyManager::new(self.agent().await, store)
    }

    async fn agent(&self) -> Arc<dyn Agent> {
        let Some(socket) = self.config.agent_socket() else {
            return Arc::new(OfflineAgent::new(
                "use_ssh_auth_sock is set but SSH_AUTH_SOCK is not",
            ));
        };
        match SessionAgent::connect(&socket).await {
            Ok(agent) => Arc::new(agent),
            Err(e) => {
                tracing::debug!(socket = %socket.display(), "agent not reachable: {e}");
                Arc::new(OfflineAgent::new(format!("{}: {e}", socket.display())))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_list(ctx: &Ctx, args: &[String]) -> Result<()> {
    let (format, rest) = parse_format(args)?;
    if let Some(extra) = rest.first() {
        bail!("invalid argument: {extra}");
    }

    let mut keys = ctx.manager().await.configured().await?;
    keys.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));

    match format {
        OutputFormat::Table => print!("{}", output::configured_table(&keys)),
        OutputFormat::Json => println!("{}", output::configured_json(&keys)?),
    }
    Ok(())
}

async fn cmd_add(ctx: &Ctx, args: &[String]) -> Result<()> {
    let name = args
        .first()
        .ok_or_else(|| anyhow!("usage: keyload add <name> [<pem-file>|-]"))?;

    let pem = match args.get(1).map(String::as_str) {
        None | Some("-") => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .context("read private key from stdin")?;
            Zeroizing::new(buf)
        }
        Some(path) => Zeroizing::new(
            std::fs::read_to_string(path).with_context(|| format!("read {path}"))?,
        ),
    };

    let id = ctx.manager().await.add(name, &pem).await?;
    println!("{id}");
    Ok(())
}

async fn cmd_remove(ctx: &Ctx, args: &[String]) -> Result<()> {
    let id = args
        .first()
        .ok_or_else(|| anyhow!("usage: keyload remove <id>"))?;
    ctx.manager().await.remove(&KeyId::from(id.as_str())).await?;
    Ok(())
}

async fn cmd_loaded(ctx: &Ctx, args: &[String]) -> Result<()> {
    let (format, rest) = parse_format(args)?;
    if let Some(extra) = rest.first() {
        bail!("invalid argument: {extra}");
    }

    let keys = ctx.manager().await.loaded().await?;
    match format {
        OutputFormat::Table => print!("{}", output::loaded_table(&keys)),
        OutputFormat::Json => println!("{}", output::loaded_json(&keys)?),
    }
    Ok(())
}

async fn cmd_load(ctx: &Ctx, args: &[String]) -> Result<()> {
    let mut passphrase_stdin = false;
    let mut id = None;
    for arg in args {
        match arg.as_str() {
            "--passphrase-stdin" => passphrase_stdin = true,
            other if id.is_none() => id = Some(KeyId::from(other)),
            other => bail!("invalid argument: {other}"),
        }
    }
    let id = id.ok_or_else(|| anyhow!("usage: keyload load [--passphrase-stdin] <id>"))?;

    let manager = ctx.manager().await;
    let key = manager
        .configured()
        .await?
        .into_iter()
        .find(|k| k.id == id)
        .ok_or_else(|| anyhow!("failed to find key with ID {id}"))?;

    let passphrase = if !key.encrypted {
        Zeroizing::new(String::new())
    } else if passphrase_stdin {
        read_passphrase_line(io::stdin().lock())?
    } else {
        Zeroizing::new(
            rpassword::prompt_password(format!("Passphrase for '{}': ", key.name))
                .context("read passphrase")?,
        )
    };

    manager.load(&id, &passphrase).await?;
    eprintln!("Loaded '{}' ({id}).", key.name);
    Ok(())
}

/// First line of `reader` without its line terminator.
fn read_passphrase_line(mut reader: impl BufRead) -> Result<Zeroizing<String>> {
    let mut line = Zeroizing::new(String::new());
    reader
        .read_line(&mut line)
        .context("read passphrase from stdin")?;
    let len = line.trim_end_matches(['\r', '\n']).len();
    line.truncate(len);
    Ok(line)
}

async fn cmd_unload(ctx: &Ctx, args: &[String]) -> Result<()> {
    let target = args
        .first()
        .ok_or_else(|| anyhow!("usage: keyload unload <id|fingerprint> | --all"))?;

    let manager = ctx.manager().await;
    let loaded = manager.loaded().await?;

    if target == "--all" {
        let ours: Vec<&LoadedKey> = loaded.iter().filter(|k| k.id().is_some()).collect();
        for key in &ours {
            manager.unload(key).await?;
        }
        eprintln!("Unloaded {} key(s).", ours.len());
        return Ok(());
    }

    let matches = select_loaded(&loaded, target);
    if matches.is_empty() {
        bail!("no loaded key matches '{target}'");
    }
    for key in matches {
        manager.unload(key).await?;
    }
    Ok(())
}

/// Loaded keys whose configured id or SHA-256 fingerprint equals `target`.
fn select_loaded<'a>(loaded: &'a [LoadedKey], target: &str) -> Vec<&'a LoadedKey> {
    loaded
        .iter()
        .filter(|k| {
            k.id().is_some_and(|id| id.as_str() == target)
                || k.fingerprint().is_some_and(|fp| fp == target)
        })
        .collect()
}

async fn cmd_status(ctx: &Ctx) -> Result<()> {
    let manager = ctx.manager().await;

    let config_state = if ctx.config_path.exists() { "" } else { " (not found, using defaults)" };
    println!("Config:      {}{config_state}", ctx.config_path.display());
    println!("Store:       {}", ctx.config.store_path().display());
    match manager.configured().await {
        Ok(keys) => println!("Configured:  {} key(s)", keys.len()),
        Err(e) => println!("Configured:  error: {e}"),
    }

    match ctx.config.agent_socket() {
        Some(socket) => println!("Agent:       {}", socket.display()),
        None => println!("Agent:       SSH_AUTH_SOCK not set"),
    }
    match manager.loaded().await {
        Ok(keys) => {
            let ours = keys.iter().filter(|k| k.id().is_some()).count();
            println!("Loaded:      {} key(s), {ours} from keyload", keys.len());
        }
        Err(e) => println!("Loaded:      unavailable ({e})"),
    }
    Ok(())
}
