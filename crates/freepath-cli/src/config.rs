//! Configuration and identity files for the Freepath CLI.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use freepath_core::{ContactBook, ContactInfo, LinkConfig, LocalIdentity, NodeId, ProtocolConfig};
use freepath_crypto::signatures::VerifyingKey;
use freepath_crypto::x25519;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Freepath node configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Node configuration
    #[serde(default)]
    pub node: NodeConfig,
    /// Session engine configuration
    #[serde(default)]
    pub protocol: ProtocolSection,
    /// Link adapter configuration
    #[serde(default)]
    pub link: LinkSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Trusted contacts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contacts: Vec<ContactEntry>,
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Identity file, relative paths resolve against the config file's directory
    #[serde(default = "default_identity_file")]
    pub identity_file: PathBuf,
    /// LAN listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

/// Session engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolSection {
    /// Pending handshakes older than this many seconds are abandoned
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

/// Link adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSection {
    /// Incomplete reassemblies older than this many seconds are discarded
    #[serde(default = "default_reassembly_timeout_secs")]
    pub reassembly_timeout_secs: u64,
    /// Seconds a new inbound connection has to send its handshake
    #[serde(default = "default_first_frame_timeout_secs")]
    pub first_frame_timeout_secs: u64,
    /// Maximum concurrent inbound connections
    #[serde(default = "default_max_inbound_connections")]
    pub max_inbound_connections: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// A trusted contact as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactEntry {
    /// Local display name
    pub name: String,
    /// Base58 node ID
    pub node_id: String,
    /// Hex Ed25519 public key
    pub sig_key: String,
    /// Hex X25519 public key
    pub enc_key: String,
    /// LAN address (`host:port`) to dial, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

// Default values

fn default_identity_file() -> PathBuf {
    PathBuf::from("identity.toml")
}

fn default_listen_addr() -> String {
    "0.0.0.0:7420".to_string()
}

fn default_handshake_timeout_secs() -> u64 {
    ProtocolConfig::default().handshake_timeout.as_secs()
}

fn default_reassembly_timeout_secs() -> u64 {
    LinkConfig::default().reassembly_timeout.as_secs()
}

fn default_first_frame_timeout_secs() -> u64 {
    LinkConfig::default().first_frame_timeout.as_secs()
}

fn default_max_inbound_connections() -> usize {
    LinkConfig::default().max_inbound_connections
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            identity_file: default_identity_file(),
            listen_addr: default_listen_addr(),
        }
    }
}

impl Default for ProtocolSection {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_handshake_timeout_secs(),
        }
    }
}

impl Default for LinkSection {
    fn default() -> Self {
        Self {
            reassembly_timeout_secs: default_reassembly_timeout_secs(),
            first_frame_timeout_secs: default_first_frame_timeout_secs(),
            max_inbound_connections: default_max_inbound_connections(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ContactEntry {
    /// Describe `info` as a config entry.
    #[must_use]
    pub fn new(name: impl Into<String>, info: &ContactInfo, address: Option<String>) -> Self {
        Self {
            name: name.into(),
            node_id: info.node_id().to_base58(),
            sig_key: hex::encode(info.sig_key_public.as_bytes()),
            enc_key: hex::encode(info.enc_key_public.as_bytes()),
            address,
        }
    }

    /// Parsed node ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the node ID is not valid Base58.
    pub fn node_id(&self) -> anyhow::Result<NodeId> {
        self.node_id
            .parse()
            .map_err(|e| anyhow::anyhow!("contact '{}' has invalid node_id: {}", self.name, e))
    }

    /// Parsed keys, checked against the declared node ID.
    ///
    /// # Errors
    ///
    /// Returns an error if a key is malformed or the node ID was not derived
    /// from the signing key.
    pub fn info(&self) -> anyhow::Result<ContactInfo> {
        let sig_bytes = decode_key(&self.sig_key, &self.name, "sig_key")?;
        let enc_bytes = decode_key(&self.enc_key, &self.name, "enc_key")?;
        let sig_key_public = VerifyingKey::from_bytes(&sig_bytes)
            .map_err(|e| anyhow::anyhow!("contact '{}' has invalid sig_key: {}", self.name, e))?;
        let info = ContactInfo {
            sig_key_public,
            enc_key_public: x25519::PublicKey::from_bytes(enc_bytes),
        };

        if info.node_id() != self.node_id()? {
            anyhow::bail!(
                "contact '{}': node_id {} does not match sig_key (expected {})",
                self.name,
                self.node_id,
                info.node_id()
            );
        }
        Ok(info)
    }

    /// Parsed dial address, if one is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is not `ip:port`.
    pub fn socket_addr(&self) -> anyhow::Result<Option<SocketAddr>> {
        self.address
            .as_deref()
            .map(|addr| {
                addr.parse().map_err(|_| {
                    anyhow::anyhow!("contact '{}' has invalid address: {}", self.name, addr)
                })
            })
            .transpose()
    }
}

fn decode_key(text: &str, contact: &str, field: &str) -> anyhow::Result<[u8; 32]> {
    let bytes = hex::decode(text)
        .map_err(|e| anyhow::anyhow!("contact '{}' has invalid {}: {}", contact, field, e))?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("contact '{}': {} must be 32 bytes", contact, field))
}

impl Config {
    /// Load and validate configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config {}: {}", path.display(), e))?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("freepath/config.toml")
    }

    /// Identity file location for a config loaded from `config_path`.
    #[must_use]
    pub fn identity_path(&self, config_path: &Path) -> PathBuf {
        let file = &self.node.identity_file;
        if file.is_absolute() {
            return file.clone();
        }
        config_path
            .parent()
            .map_or_else(|| file.clone(), |dir| dir.join(file))
    }

    /// Parse listen address as `SocketAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.node
            .listen_addr
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid listen_addr: {}", self.node.listen_addr))
    }

    /// Session engine settings.
    #[must_use]
    pub fn protocol_config(&self) -> ProtocolConfig {
        ProtocolConfig {
            handshake_timeout: Duration::from_secs(self.protocol.handshake_timeout_secs),
        }
    }

    /// Link adapter settings.
    #[must_use]
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            reassembly_timeout: Duration::from_secs(self.link.reassembly_timeout_secs),
            first_frame_timeout: Duration::from_secs(self.link.first_frame_timeout_secs),
            max_inbound_connections: self.link.max_inbound_connections,
            ..LinkConfig::default()
        }
    }

    /// Build a contact book from every configured contact.
    ///
    /// # Errors
    ///
    /// Returns an error if any contact entry is invalid.
    pub fn contact_book(&self) -> anyhow::Result<ContactBook> {
        let book = ContactBook::new();
        for entry in &self.contacts {
            book.add(entry.info()?);
        }
        Ok(book)
    }

    /// Find a contact by display name or Base58 node ID.
    #[must_use]
    pub fn find_contact(&self, name_or_id: &str) -> Option<&ContactEntry> {
        self.contacts
            .iter()
            .find(|c| c.name == name_or_id)
            .or_else(|| self.contacts.iter().find(|c| c.node_id == name_or_id))
    }

    /// Display name for `node_id`, falling back to its Base58 form.
    #[must_use]
    pub fn display_name(&self, node_id: &NodeId) -> String {
        let id = node_id.to_base58();
        self.contacts
            .iter()
            .find(|c| c.node_id == id)
            .map_or(id, |c| c.name.clone())
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_listen_addr()?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        self.protocol_config()
            .validate()
            .map_err(|e| anyhow::anyhow!("[protocol] {}", e))?;
        self.link_config()
            .validate()
            .map_err(|e| anyhow::anyhow!("[link] {}", e))?;

        let mut seen_names = std::collections::HashSet::new();
        let mut seen_ids = std::collections::HashSet::new();
        for entry in &self.contacts {
            if entry.name.trim().is_empty() || entry.name.contains(char::is_whitespace) {
                anyhow::bail!("contact name '{}' must be a single non-empty word", entry.name);
            }
            if !seen_names.insert(entry.name.as_str()) {
                anyhow::bail!("duplicate contact name: {}", entry.name);
            }
            let info = entry.info()?;
            if !seen_ids.insert(info.node_id()) {
                anyhow::bail!("duplicate contact node_id: {}", entry.node_id);
            }
            entry.socket_addr()?;
        }

        Ok(())
    }
}

/// Secret key material of a node, stored as hex in TOML.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct IdentityFile {
    /// Hex Ed25519 signing seed
    sig_seed: String,
    /// Hex X25519 secret
    enc_secret: String,
}

impl IdentityFile {
    /// Capture the secrets of `identity`.
    #[must_use]
    pub fn from_identity(identity: &LocalIdentity) -> Self {
        let sig_seed = Zeroizing::new(identity.signing_key().to_bytes());
        let enc_secret = Zeroizing::new(identity.enc_key().to_bytes());
        Self {
            sig_seed: hex::encode(sig_seed.as_ref()),
            enc_secret: hex::encode(enc_secret.as_ref()),
        }
    }

    /// Restore the identity.
    ///
    /// # Errors
    ///
    /// Returns an error if a key is not 32 bytes of hex.
    pub fn to_identity(&self) -> anyhow::Result<LocalIdentity> {
        let sig_seed = decode_secret(&self.sig_seed, "sig_seed")?;
        let enc_secret = decode_secret(&self.enc_secret, "enc_secret")?;
        Ok(LocalIdentity::from_secret_keys(&sig_seed, *enc_secret))
    }

    /// Read an identity file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<LocalIdentity> {
        let path = path.as_ref();
        let contents = Zeroizing::new(
            fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("cannot read identity {}: {}", path.display(), e))?,
        );
        let file: Self = toml::from_str(&contents)?;
        file.to_identity()
    }

    /// Write an identity file, owner-readable only on Unix.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists or cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        if path.exists() {
            anyhow::bail!("refusing to overwrite existing identity {}", path.display());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = Zeroizing::new(toml::to_string_pretty(self)?);
        fs::write(path, contents.as_bytes())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

fn decode_secret(text: &str, field: &str) -> anyhow::Result<Zeroizing<[u8; 32]>> {
    let bytes = Zeroizing::new(
        hex::decode(text).map_err(|e| anyhow::anyhow!("identity {} is not hex: {}", field, e))?,
    );
    let mut out = Zeroizing::new([0u8; 32]);
    if bytes.len() != out.len() {
        anyhow::bail!("identity {} must be 32 bytes", field);
    }
    out.copy_from_slice(&bytes);
    Ok(out)
}
