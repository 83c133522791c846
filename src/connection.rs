// ABOUTME: SSH connection management using russh.
// ABOUTME: Handles connection, authentication, and starting remote commands.

use crate::channel::run_adapter;
use crate::command::{CommandShared, RemoteCommand};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use russh::client::{self, Config, Handle};
use russh::keys::agent::client::AgentClient;
use russh::keys::known_hosts::{
    check_known_hosts, check_known_hosts_path, learn_known_hosts, learn_known_hosts_path,
};
use russh::keys::{PrivateKeyWithHashAlg, load_secret_key, ssh_key};
use russh::Disconnect;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::mpsc;

/// Configuration for establishing an SSH session.
///
/// Defaults are tuned for zero-user-interaction automation: no prompts, and
/// the SSH agent is only consulted when neither a password nor a key file is
/// given explicitly.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Remote host to connect to.
    pub host: String,
    /// SSH port (default: 22).
    pub port: u16,
    /// Username for authentication.
    pub user: String,
    /// Optional password for authentication.
    pub password: Option<String>,
    /// Optional path to private key file.
    /// If neither this nor a password is set, the SSH agent and default key
    /// locations are tried.
    pub key_path: Option<PathBuf>,
    /// Whether to accept unknown hosts (Trust On First Use).
    /// If false, connection to unknown hosts will fail.
    pub trust_on_first_use: bool,
    /// Optional path to known_hosts file.
    /// If None, uses the default ~/.ssh/known_hosts.
    pub known_hosts_path: Option<PathBuf>,
    /// Optional timeout for establishing the connection.
    pub connect_timeout: Option<Duration>,
    /// Optional cap, in bytes, on each captured output stream per command.
    /// When reached, the oldest bytes are dropped. Unbounded by default.
    pub output_limit: Option<usize>,
}

impl SessionConfig {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: user.into(),
            password: None,
            key_path: None,
            trust_on_first_use: false,
            known_hosts_path: None,
            connect_timeout: None,
            output_limit: None,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(path.into());
        self
    }

    pub fn trust_on_first_use(mut self, tofu: bool) -> Self {
        self.trust_on_first_use = tofu;
        self
    }

    pub fn known_hosts_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts_path = Some(path.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn output_limit(mut self, limit: usize) -> Self {
        self.output_limit = Some(limit);
        self
    }
}

/// SSH client handler for russh.
pub(crate) struct SshHandler {
    host: String,
    port: u16,
    trust_on_first_use: bool,
    known_hosts_path: Option<PathBuf>,
}

impl SshHandler {
    fn new(
        host: String,
        port: u16,
        trust_on_first_use: bool,
        known_hosts_path: Option<PathBuf>,
    ) -> Self {
        Self {
            host,
            port,
            trust_on_first_use,
            known_hosts_path,
        }
    }
}

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let check_result = match &self.known_hosts_path {
            Some(path) => check_known_hosts_path(&self.host, self.port, server_public_key, path),
            None => check_known_hosts(&self.host, self.port, server_public_key),
        };

        match check_result {
            Ok(true) => Ok(true),
            Ok(false) => {
                // Host not in known_hosts
                if self.trust_on_first_use {
                    tracing::warn!(
                        "Trust-On-First-Use: accepting unknown host key for {}:{}",
                        self.host,
                        self.port
                    );
                    let learn_result = match &self.known_hosts_path {
                        Some(path) => {
                            learn_known_hosts_path(&self.host, self.port, server_public_key, path)
                        }
                        None => learn_known_hosts(&self.host, self.port, server_public_key),
                    };
                    if let Err(e) = learn_result {
                        tracing::warn!("Failed to save host key to known_hosts: {}", e);
                    }
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Err(russh::keys::Error::KeyChanged { .. }) => Ok(false),
            Err(_) => {
                // Other errors - treat as unknown host
                if self.trust_on_first_use {
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }
}

/// Authentication methods resolved from config, tried in order.
enum AuthMethod {
    KeyFile(Arc<ssh_key::PrivateKey>),
    Password(String),
    Agent(AgentClient<UnixStream>),
}

/// An established SSH connection that can run remote commands.
///
/// Commands started with [`exec`](Connection::exec) are tracked; any still
/// live when [`close`](Connection::close) is called are closed (and thereby
/// aborted) before the transport is disconnected.
pub struct Connection {
    config: SessionConfig,
    handle: Arc<Handle<SshHandler>>,
    /// Internals of commands started on this connection, for cascade close.
    commands: Mutex<Vec<Arc<CommandShared>>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("config", &self.config)
            .field("handle", &"<russh::Handle>")
            .finish()
    }
}

impl Connection {
    /// Connect to the remote host.
    pub async fn connect(config: SessionConfig) -> Result<Self> {
        // Resolve authentication methods
        let auth_methods = Self::resolve_auth_methods(&config).await?;

        // Configure client
        let russh_config = Config {
            inactivity_timeout: None,
            ..Default::default()
        };

        let handler = SshHandler::new(
            config.host.clone(),
            config.port,
            config.trust_on_first_use,
            config.known_hosts_path.clone(),
        );

        // Connect
        let connecting = client::connect(
            Arc::new(russh_config),
            (config.host.as_str(), config.port),
            handler,
        );
        let connected = match config.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connecting)
                .await
                .map_err(|_| {
                    Error::Connection(format!(
                        "connection to {}:{} timed out after {:?}",
                        config.host, config.port, timeout
                    ))
                })?,
            None => connecting.await,
        };
        let mut session = connected.map_err(|e| {
            if e.to_string().contains("Connection refused") {
                Error::Connection(format!(
                    "connection refused to {}:{}",
                    config.host, config.port
                ))
            } else {
                Error::Connection(e.to_string())
            }
        })?;

        // Authenticate
        let auth_success = Self::authenticate(&mut session, &config, auth_methods).await?;
        if !auth_success {
            return Err(Error::AuthenticationFailed);
        }

        Ok(Self {
            config,
            handle: Arc::new(session),
            commands: Mutex::new(Vec::new()),
        })
    }

    /// Resolve which authentication methods to try.
    async fn resolve_auth_methods(config: &SessionConfig) -> Result<Vec<AuthMethod>> {
        let mut methods = Vec::new();

        // Explicit credentials take precedence: key first, password as the
        // fallback alongside it.
        if let Some(key_path) = &config.key_path {
            let key = load_secret_key(key_path, None).map_err(|e| Error::KeyLoadFailed {
                path: key_path.clone(),
                reason: e.to_string(),
            })?;
            methods.push(AuthMethod::KeyFile(Arc::new(key)));
        }
        if let Some(password) = &config.password {
            methods.push(AuthMethod::Password(password.clone()));
        }
        if !methods.is_empty() {
            return Ok(methods);
        }

        // Try SSH agent
        if let Ok(agent) = AgentClient::connect_env().await {
            return Ok(vec![AuthMethod::Agent(agent)]);
        }

        // Fall back to default key locations
        let home = std::env::var("HOME").map_err(|_| {
            Error::AgentUnavailable("SSH agent not available and HOME not set".to_string())
        })?;

        let default_keys = [
            format!("{}/.ssh/id_ed25519", home),
            format!("{}/.ssh/id_rsa", home),
            format!("{}/.ssh/id_ecdsa", home),
        ];

        for key_path in &default_keys {
            if let Ok(key) = load_secret_key(key_path, None) {
                return Ok(vec![AuthMethod::KeyFile(Arc::new(key))]);
            }
        }

        Err(Error::AgentUnavailable(
            "SSH agent not available and no default keys found".to_string(),
        ))
    }

    /// Try each resolved method until one authenticates.
    async fn authenticate(
        session: &mut Handle<SshHandler>,
        config: &SessionConfig,
        auth_methods: Vec<AuthMethod>,
    ) -> Result<bool> {
        for method in auth_methods {
            match method {
                AuthMethod::KeyFile(key) => {
                    let hash_alg = session
                        .best_supported_rsa_hash()
                        .await
                        .map_err(Error::Protocol)?
                        .flatten();

                    let result = session
                        .authenticate_publickey(
                            &config.user,
                            PrivateKeyWithHashAlg::new(key, hash_alg),
                        )
                        .await
                        .map_err(Error::Protocol)?;

                    if result.success() {
                        return Ok(true);
                    }
                }
                AuthMethod::Password(password) => {
                    let result = session
                        .authenticate_password(&config.user, &password)
                        .await
                        .map_err(Error::Protocol)?;

                    if result.success() {
                        return Ok(true);
                    }
                }
                AuthMethod::Agent(mut agent) => {
                    let keys = agent.request_identities().await.map_err(|e| {
                        Error::AgentUnavailable(format!("failed to list agent keys: {}", e))
                    })?;

                    if keys.is_empty() {
                        return Err(Error::AgentUnavailable("no keys in SSH agent".to_string()));
                    }

                    for key in &keys {
                        match session
                            .authenticate_publickey_with(&config.user, key.clone(), None, &mut agent)
                            .await
                        {
                            Ok(result) if result.success() => return Ok(true),
                            _ => continue,
                        }
                    }
                }
            }
        }
        Ok(false)
    }

    /// Start a command on the remote host.
    ///
    /// The returned [`RemoteCommand`] captures output in the background from
    /// the moment the command starts. Escaping of the command line is up to
    /// the caller and depends on the remote shell.
    pub async fn exec(&self, command: &str) -> Result<RemoteCommand> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| Error::ChannelOpen(e.to_string()))?;

        channel.exec(true, command).await?;

        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(CommandShared::new(
            command.to_string(),
            ops_tx,
            self.config.output_limit,
        ));

        tokio::spawn(run_adapter(channel, Arc::clone(&shared), ops_rx));

        {
            let mut commands = self.commands.lock();
            commands.retain(|c| !c.is_closed());
            commands.push(Arc::clone(&shared));
        }

        Ok(RemoteCommand::new(shared))
    }

    /// Close the connection.
    ///
    /// Any command still live on this connection is closed first, which
    /// aborts it if it has not exited yet.
    pub async fn close(self) -> Result<()> {
        // Close live commands first (drain to Vec to release lock before await)
        let commands: Vec<_> = self.commands.lock().drain(..).collect();
        for shared in commands {
            if shared.begin_close() {
                shared.join_task().await;
                shared.finalize_close();
            }
        }

        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(Error::Protocol)?;
        Ok(())
    }
}
