mod bootstrap;
mod socket;

use std::path::PathBuf;

use anyhow::{Context, Result};
use keyload_agent::{KeyStore, SshAgent};
use keyload_core::config;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "\
Usage: keyloadd [--config <path>]

Options:
  -c, --config <path>  Path to config file (default: $XDG_CONFIG_HOME/keyload/config.toml)
  -h, --help           Show this help message
";

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = match parse_args(std::env::args().skip(1)) {
        Ok(Invocation::Help) => {
            print!("{USAGE}");
            return Ok(());
        }
        Ok(Invocation::Run { config }) => config.unwrap_or_else(config::default_config_path),
        Err(msg) => {
            eprintln!("keyloadd: {msg}\n\n{USAGE}");
            std::process::exit(2);
        }
    };
    let config = config::load(&config_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log.filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Before the first key can arrive over the socket.
    bootstrap::Hardening::apply().log();

    config::check_permissions(&config_path);
    tracing::info!("loaded config from {}", config_path.display());

    let mut shutdown = Shutdown::register()?;

    let socket_path = config.daemon_socket();
    socket::prepare(&socket_path)?;

    let agent = SshAgent::new(KeyStore::new(), socket_path.clone());

    // Shell-evaluable, like ssh-agent's own output.
    println!(
        "SSH_AUTH_SOCK={}; export SSH_AUTH_SOCK;",
        socket_path.display()
    );

    let result = tokio::select! {
        r = agent.listen() => r,
        name = shutdown.recv() => {
            tracing::info!(signal = name, "shutting down");
            Ok(())
        }
    };

    socket::cleanup(&socket_path);
    result
}

#[derive(Debug, PartialEq, Eq)]
enum Invocation {
    Run { config: Option<PathBuf> },
    Help,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Invocation, String> {
    let mut config = None;
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Invocation::Help),
            "-c" | "--config" => {
                let path = args.next().ok_or("--config requires a path argument")?;
                config = Some(PathBuf::from(path));
            }
            other => match other.strip_prefix("--config=") {
                Some(path) => config = Some(PathBuf::from(path)),
                None => return Err(format!("unknown argument: {other}")),
            },
        }
    }

    Ok(Invocation::Run { config })
}

/// Termination signals, registered before the socket is bound so an early
/// signal still removes it.
///
/// SIGHUP is included: like `ssh-agent`, the daemon exits when its session
/// goes away.
struct Shutdown {
    interrupt: Signal,
    terminate: Signal,
    hangup: Signal,
}

impl Shutdown {
    fn register() -> Result<Self> {
        let install = |kind| signal(kind).context("failed to install signal handler");
        Ok(Self {
            interrupt: install(SignalKind::interrupt())?,
            terminate: install(SignalKind::terminate())?,
            hangup: install(SignalKind::hangup())?,
        })
    }

    /// Name of the first signal to arrive.
    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.hangup.recv() => "SIGHUP",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Invocation, String> {
        parse_args(args.iter().map(|a| a.to_string()))
    }

    #[test]
    fn no_arguments_uses_default_config() {
        assert_eq!(parse(&[]), Ok(Invocation::Run { config: None }));
    }

    #[test]
    fn config_path_forms() {
        let expected = Ok(Invocation::Run {
            config: Some(PathBuf::from("/etc/keyload.toml")),
        });
        assert_eq!(parse(&["--config", "/etc/keyload.toml"]), expected);
        assert_eq!(parse(&["-c", "/etc/keyload.toml"]), expected);
        assert_eq!(parse(&["--config=/etc/keyload.toml"]), expected);
    }

    #[test]
    fn help_wins_over_other_arguments() {
        assert_eq!(parse(&["--config", "x", "--help"]), Ok(Invocation::Help));
        assert_eq!(parse(&["-h"]), Ok(Invocation::Help));
    }

    #[test]
    fn bad_arguments_are_errors() {
        assert!(parse(&["--config"]).unwrap_err().contains("requires a path"));
        assert_eq!(parse(&["--verbose"]), Err("unknown argument: --verbose".to_string()));
    }

    #[tokio::test]
    async fn shutdown_reports_signal_name() {
        let mut shutdown = Shutdown::register().unwrap();
        // SAFETY: raising a signal this process has a handler for.
        assert_eq!(unsafe { libc::raise(libc::SIGHUP) }, 0);
        assert_eq!(shutdown.recv().await, "SIGHUP");
    }
}
