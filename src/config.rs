//! VoxBridge configuration management
//!
//! Configuration is a two-level structure: shared fields at
//! `channels.fortivoice.*` and per-account overrides at
//! `channels.fortivoice.accounts.<id>.*`. [`ChannelConfig::resolve_account`]
//! merges the two (per-account wins), applies the env-var fallback for the
//! default account, and derives the enabled/configured state the monitor
//! needs before dialing.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::bridge::{ChunkMode, TableMode};
use crate::error::{Error, Result};

/// Channel name, used for env vars, target prefixes, and routing keys.
pub const CHANNEL: &str = "fortivoice";

/// Account id used when the config names no default.
pub const DEFAULT_ACCOUNT_ID: &str = "default";

/// URL fallback for the default account.
pub const ENV_WS_URL: &str = "FORTIVOICE_WS_URL";

/// Phone fallback for the default account.
pub const ENV_PHONE: &str = "FORTIVOICE_PHONE";

pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 2_000;
pub const MIN_RECONNECT_DELAY_MS: u64 = 250;
pub const MAX_RECONNECT_DELAY_MS: u64 = 60_000;

/// Top-level configuration file shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub channels: ChannelsConfig,
}

/// Channel configurations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    /// FortiVoice channel config
    pub fortivoice: Option<ChannelConfig>,
}

/// Shared channel fields plus per-account overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelConfig {
    pub enabled: Option<bool>,
    pub name: Option<String>,
    /// E.164-ish caller id, e.g. "+15550100"
    pub phone: Option<String>,
    /// ws:// or wss:// endpoint of the voice peer
    pub url: Option<String>,
    /// Delay between redials, clamped to 250..=60000
    pub reconnect_delay_ms: Option<u64>,
    /// Speak a greeting on every session start
    pub hello_world_on_start: Option<bool>,
    /// Voice-prep settings passed through to the bridge adapter
    pub markdown: Option<MarkdownConfig>,
    pub accounts: HashMap<String, AccountConfig>,
    pub default_account: Option<String>,
}

/// Per-account overrides; every field shadows the shared one when set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccountConfig {
    pub enabled: Option<bool>,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub url: Option<String>,
    pub reconnect_delay_ms: Option<u64>,
    pub hello_world_on_start: Option<bool>,
    pub markdown: Option<MarkdownConfig>,
}

/// How agent prose is prepared for speech.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MarkdownConfig {
    /// What to do with pipe tables
    pub tables: TableMode,
    /// How prose is split into speak actions
    pub chunking: ChunkMode,
    /// Maximum characters per speak action
    pub text_chunk_limit: usize,
}

impl Default for MarkdownConfig {
    fn default() -> Self {
        Self {
            tables: TableMode::Bullets,
            chunking: ChunkMode::Sentence,
            text_chunk_limit: 700,
        }
    }
}

/// An account with shared and per-account fields merged and validated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedAccount {
    pub account_id: String,
    pub enabled: bool,
    /// True when both url and phone are present and valid
    pub configured: bool,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub url: Option<String>,
    pub reconnect_delay_ms: u64,
    pub hello_world_on_start: bool,
    pub markdown: MarkdownConfig,
}

impl BridgeConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse config: {e}")))
    }

    /// The FortiVoice channel config, defaulted when absent.
    pub fn fortivoice(&self) -> ChannelConfig {
        self.channels.fortivoice.clone().unwrap_or_default()
    }
}

impl ChannelConfig {
    /// The id resolution falls back to when none is requested:
    /// `defaultAccount`, then a literal `default` account if one is
    /// configured, then the lexicographically first configured id.
    pub fn default_account_id(&self) -> String {
        if let Some(id) = &self.default_account {
            let id = normalize_account_id(id);
            if !id.is_empty() {
                return id;
            }
        }
        let mut ids: BTreeSet<String> = self
            .accounts
            .keys()
            .map(|k| normalize_account_id(k))
            .filter(|k| !k.is_empty())
            .collect();
        if ids.contains(DEFAULT_ACCOUNT_ID) {
            return DEFAULT_ACCOUNT_ID.to_string();
        }
        ids.pop_first()
            .unwrap_or_else(|| DEFAULT_ACCOUNT_ID.to_string())
    }

    /// All account ids this channel knows about, sorted. The default id is
    /// included when any shared field is set or no accounts are configured.
    pub fn list_account_ids(&self) -> Vec<String> {
        let mut ids: BTreeSet<String> = self
            .accounts
            .keys()
            .map(|k| normalize_account_id(k))
            .filter(|k| !k.is_empty())
            .collect();
        if self.has_shared_field() || self.accounts.is_empty() {
            ids.insert(self.default_account_id());
        }
        ids.into_iter().collect()
    }

    /// Merge shared and per-account fields into a [`ResolvedAccount`].
    pub fn resolve_account(&self, requested: Option<&str>) -> ResolvedAccount {
        let requested = requested
            .map(normalize_account_id)
            .filter(|id| !id.is_empty());
        let account_id = requested.unwrap_or_else(|| self.default_account_id());
        let account = self
            .accounts
            .iter()
            .find(|(key, _)| normalize_account_id(key) == account_id)
            .map(|(_, value)| value);

        let enabled = self.enabled.unwrap_or(true)
            && account.and_then(|a| a.enabled).unwrap_or(true);
        let name = account
            .and_then(|a| a.name.clone())
            .or_else(|| self.name.clone());
        let mut phone = account
            .and_then(|a| a.phone.clone())
            .or_else(|| self.phone.clone());
        let mut url = account
            .and_then(|a| a.url.clone())
            .or_else(|| self.url.clone());
        let reconnect_delay_ms = account
            .and_then(|a| a.reconnect_delay_ms)
            .or(self.reconnect_delay_ms)
            .unwrap_or(DEFAULT_RECONNECT_DELAY_MS)
            .clamp(MIN_RECONNECT_DELAY_MS, MAX_RECONNECT_DELAY_MS);
        let hello_world_on_start = account
            .and_then(|a| a.hello_world_on_start)
            .or(self.hello_world_on_start)
            .unwrap_or(true);
        let markdown = account
            .and_then(|a| a.markdown.clone())
            .or_else(|| self.markdown.clone())
            .unwrap_or_default();

        // Process-wide env fallback, default account only
        if account_id == self.default_account_id() {
            if url.is_none() {
                url = env_value(ENV_WS_URL);
            }
            if phone.is_none() {
                phone = env_value(ENV_PHONE);
            }
        }

        let configured = url.as_deref().is_some_and(is_valid_ws_url)
            && phone.as_deref().is_some_and(is_valid_phone);

        ResolvedAccount {
            account_id,
            enabled,
            configured,
            name,
            phone,
            url,
            reconnect_delay_ms,
            hello_world_on_start,
            markdown,
        }
    }

    fn has_shared_field(&self) -> bool {
        self.enabled.is_some()
            || self.name.is_some()
            || self.phone.is_some()
            || self.url.is_some()
            || self.reconnect_delay_ms.is_some()
            || self.hello_world_on_start.is_some()
            || self.markdown.is_some()
    }
}

/// Trim and ASCII-lowercase an account id.
pub fn normalize_account_id(id: &str) -> String {
    id.trim().to_ascii_lowercase()
}

/// True for a parseable ws:// or wss:// URL.
pub fn is_valid_ws_url(value: &str) -> bool {
    url::Url::parse(value)
        .map(|u| matches!(u.scheme(), "ws" | "wss"))
        .unwrap_or(false)
}

/// True for an E.164-ish phone number: optional `+`, 7-15 digits.
pub fn is_valid_phone(value: &str) -> bool {
    static PHONE_RE: OnceLock<Regex> = OnceLock::new();
    let re = PHONE_RE.get_or_init(|| Regex::new(r"^\+?[0-9]{7,15}$").unwrap());
    re.is_match(value)
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
