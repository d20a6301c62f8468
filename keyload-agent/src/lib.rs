//! SSH agent for keyload.
//!
//! Holds decrypted keys in memory and serves them over the standard OpenSSH
//! agent protocol.  `keyloadd` runs the listener; the `keyload` CLI talks to
//! it (or to any other agent) through [`SessionAgent`].
//!
//! # Architecture
//!
//! ```text
//! keyload CLI ── KeyManager ── SessionAgent<Client<UnixStream>> ──┐
//!                                                                 │ agent protocol
//! keyloadd ─── SshAgent (listen) ◄── UnixListener ◄───────────────┘
//!                 │ per-connection clone
//!                 ▼
//!           KeyStore (Arc<RwLock<…>>)
//! ```
//!
//! [`SessionAgent`] accepts any [`ssh_agent_lib::agent::Session`], so the
//! in-process [`SshAgent`] can be driven directly without a socket.

pub mod adapter;
pub mod keystore;
pub mod session;

pub use adapter::SessionAgent;
pub use keystore::{KeyEntry, KeyStore};
pub use session::SshAgent;
