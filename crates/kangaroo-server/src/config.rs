//! Server configuration: JSON (or TOML) file + CLI overrides.
//!
//! Keys: `addr`, `port`, `sshkey`, `prober`, `dial_timeout_secs`, `IPSet`
//! and `Policy`. `Policy` is either a list of policies or an object keyed by
//! source set; either way the table keeps document order.

use crate::gateway::ProbeStrategy;
use kangaroo_core::{
    AddressSets, DefaultAction, KangarooError, KangarooResult, PolicySpec, PolicyTable, ALL_SET,
};
use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::Deserialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Top-level config file structure.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub addr: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub sshkey: String,
    #[serde(default)]
    pub prober: ProbeStrategy,
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
    /// Address sets in document order.
    #[serde(
        rename = "IPSet",
        default = "default_sets",
        deserialize_with = "ordered_sets"
    )]
    pub ip_sets: Vec<(String, Vec<String>)>,
    #[serde(rename = "Policy", default, deserialize_with = "ordered_policies")]
    pub policies: Vec<PolicyEntry>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            addr: String::new(),
            port: default_port(),
            sshkey: String::new(),
            prober: ProbeStrategy::default(),
            dial_timeout_secs: default_dial_timeout_secs(),
            ip_sets: default_sets(),
            policies: Vec::new(),
        }
    }
}

/// One `Policy` entry as written in the file.
///
/// The capitalized aliases accept files written for case-insensitive
/// decoders.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyEntry {
    /// Source set. Taken from the object key in the map form.
    #[serde(default, alias = "Source")]
    pub source: String,
    #[serde(default, alias = "SameL2", alias = "requireSameLink")]
    pub samel2: bool,
    #[serde(default, alias = "Default")]
    pub default: String,
    #[serde(default, alias = "Allow")]
    pub allow: Vec<String>,
    #[serde(default, alias = "Deny")]
    pub deny: Vec<String>,
}

impl PolicyEntry {
    fn to_spec(&self, position: usize) -> KangarooResult<PolicySpec> {
        if self.source.trim().is_empty() {
            return Err(KangarooError::Config(format!(
                "policy #{} has no source address set",
                position + 1
            )));
        }
        Ok(PolicySpec {
            source: self.source.clone(),
            allow: self.allow.clone(),
            deny: self.deny.clone(),
            default: self.default.parse::<DefaultAction>()?,
            require_same_link: self.samel2,
        })
    }
}

fn default_port() -> u16 {
    2222
}
fn default_dial_timeout_secs() -> u64 {
    10
}
fn default_sets() -> Vec<(String, Vec<String>)> {
    vec![(ALL_SET.to_string(), vec!["::/0".to_string()])]
}

/// Deserialize a map into `(key, value)` pairs without losing key order.
fn ordered_sets<'de, D>(deserializer: D) -> Result<Vec<(String, Vec<String>)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct SetsVisitor;

    impl<'de> Visitor<'de> for SetsVisitor {
        type Value = Vec<(String, Vec<String>)>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a map of address set names to address lists")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut sets = Vec::new();
            while let Some((name, entries)) = map.next_entry::<String, Vec<String>>()? {
                sets.push((name, entries));
            }
            Ok(sets)
        }
    }

    deserializer.deserialize_map(SetsVisitor)
}

/// Accept either `[{source, ...}, ...]` or `{ "<source>": {...}, ... }`.
fn ordered_policies<'de, D>(deserializer: D) -> Result<Vec<PolicyEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    struct PoliciesVisitor;

    impl<'de> Visitor<'de> for PoliciesVisitor {
        type Value = Vec<PolicyEntry>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a list of policies or a map of source set to policy")
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut policies = Vec::new();
            while let Some(entry) = seq.next_element::<PolicyEntry>()? {
                policies.push(entry);
            }
            Ok(policies)
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut policies = Vec::new();
            while let Some((source, mut entry)) = map.next_entry::<String, PolicyEntry>()? {
                if !entry.source.is_empty() && entry.source != source {
                    return Err(de::Error::custom(format!(
                        "policy {source:?} names a different source {:?}",
                        entry.source
                    )));
                }
                entry.source = source;
                policies.push(entry);
            }
            Ok(policies)
        }
    }

    deserializer.deserialize_any(PoliciesVisitor)
}

/// Where the SSH host key comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeySource {
    /// Key file on disk (`~` expanded).
    Path(PathBuf),
    /// Key material given inline after the `raw:` prefix.
    Inline(String),
}

impl HostKeySource {
    fn from_config(value: &str) -> KangarooResult<Self> {
        if value.is_empty() {
            return Err(KangarooError::Config("SSH host key not specified (sshkey)".into()));
        }
        match value.strip_prefix("raw:") {
            Some(material) => Ok(Self::Inline(material.to_string())),
            None => Ok(Self::Path(expand_tilde_str(value))),
        }
    }
}

/// Resolved server configuration (paths expanded, CLI overrides applied,
/// policy compiled).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub host_key: HostKeySource,
    pub prober: ProbeStrategy,
    pub dial_timeout: Duration,
    pub policy: Arc<PolicyTable>,
}

impl ServerConfig {
    /// Load config from file, then apply CLI overrides.
    ///
    /// Without a config file the defaults apply, which still lack a host key,
    /// so startup fails the same way an incomplete file does.
    ///
    /// # Errors
    ///
    /// Any unreadable or malformed file, invalid address, undefined set
    /// reference or missing host key.
    pub fn load(
        config_path: Option<&Path>,
        cli_port: Option<u16>,
        cli_addr: Option<&str>,
        cli_prober: Option<ProbeStrategy>,
    ) -> KangarooResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded).map_err(|e| {
                    KangarooError::Config(format!("cannot read {}: {e}", expanded.display()))
                })?;
                parse_config(&content, &expanded)?
            }
            None => {
                info!("no config file given, using defaults");
                ConfigFile::default()
            }
        };

        Self::resolve(file_config, cli_port, cli_addr, cli_prober)
    }

    /// Merge CLI overrides into a parsed file and compile the policy table.
    pub fn resolve(
        file_config: ConfigFile,
        cli_port: Option<u16>,
        cli_addr: Option<&str>,
        cli_prober: Option<ProbeStrategy>,
    ) -> KangarooResult<Self> {
        let port = cli_port.unwrap_or(file_config.port);
        let addr = cli_addr.unwrap_or(&file_config.addr);
        let listen = SocketAddr::new(parse_listen_addr(addr)?, port);
        let host_key = HostKeySource::from_config(&file_config.sshkey)?;
        let prober = cli_prober.unwrap_or(file_config.prober);
        if file_config.dial_timeout_secs == 0 {
            return Err(KangarooError::Config(
                "dial_timeout_secs must be at least 1".into(),
            ));
        }
        let dial_timeout = Duration::from_secs(file_config.dial_timeout_secs);
        let policy = build_policy_table(&file_config)?;

        for set in policy.sets().iter() {
            info!(set = %set, "address set");
        }
        let order: Vec<&str> = policy.policy_names().collect();
        if order.is_empty() {
            warn!("no policies configured, every forward request will be denied");
        } else {
            info!(order = ?order, "policy order");
        }

        Ok(Self {
            listen,
            host_key,
            prober,
            dial_timeout,
            policy: Arc::new(policy),
        })
    }
}

/// Pick the parser by file extension; anything but `.toml` is JSON.
pub fn parse_config(content: &str, path: &Path) -> KangarooResult<ConfigFile> {
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    if is_toml {
        toml::from_str(content)
            .map_err(|e| KangarooError::Config(format!("config parse error: {e}")))
    } else {
        serde_json::from_str(content)
            .map_err(|e| KangarooError::Config(format!("config parse error: {e}")))
    }
}

fn build_policy_table(file_config: &ConfigFile) -> KangarooResult<PolicyTable> {
    let sets = AddressSets::compile(file_config.ip_sets.clone())?.with_default_all()?;
    let specs = file_config
        .policies
        .iter()
        .enumerate()
        .map(|(i, entry)| entry.to_spec(i))
        .collect::<KangarooResult<Vec<_>>>()?;
    PolicyTable::new(sets, specs)
}

/// Empty means every IPv4 interface.
fn parse_listen_addr(addr: &str) -> KangarooResult<IpAddr> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }
    addr.trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .map_err(|_| KangarooError::Config(format!("invalid listen address {addr:?}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if s == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
