use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::core::models::{FeedId, GroupId};
use crate::sync::puller::{PullerSettings, SyncAlgorithm};

const DEFAULT_POLL_SECS: u64 = 30;

/// Runtime config, fully resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub db_path: PathBuf,
    /// 0 means unlimited.
    pub history_limit_days: u32,
    pub algorithm: SyncAlgorithm,
    pub groups: Vec<GroupId>,
    pub sync_all_company: bool,
    pub sync_private_conversations: bool,
    pub sync_inbox: bool,
    pub trust_reported_message_counts: bool,
    pub poll_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            db_path: default_db_path(),
            history_limit_days: 0,
            algorithm: SyncAlgorithm::default(),
            groups: Vec::new(),
            sync_all_company: true,
            sync_private_conversations: true,
            sync_inbox: false,
            trust_reported_message_counts: false,
            poll_interval_secs: DEFAULT_POLL_SECS,
        }
    }
}

/// On-disk representation. Every field is optional; missing ones fall back
/// to the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_limit_days: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<SyncAlgorithm>,
    #[serde(default)]
    pub groups: Vec<GroupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feeds: Option<SyntheticFeeds>,
    #[serde(default)]
    pub trust_reported_message_counts: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntheticFeeds {
    pub all_company: bool,
    pub private_conversations: bool,
    pub inbox: bool,
}

fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("feedkeeper")
        .join("config.json")
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("feedkeeper")
        .join("feedkeeper.db")
}

impl FileConfig {
    pub fn load() -> Result<Option<Self>, String> {
        let path = config_path();
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&path).map_err(|e| format!("read config: {e}"))?;
        let cfg: FileConfig = serde_json::from_str(&data).map_err(|e| format!("parse config: {e}"))?;
        Ok(Some(cfg))
    }

    pub fn save(&self) -> Result<(), String> {
        let path = config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| format!("create config dir: {e}"))?;
        }
        let data = serde_json::to_string_pretty(self).map_err(|e| format!("serialize config: {e}"))?;
        fs::write(&path, data).map_err(|e| format!("write config: {e}"))
    }
}

impl From<&Config> for FileConfig {
    fn from(config: &Config) -> Self {
        FileConfig {
            db_path: Some(config.db_path.clone()),
            history_limit_days: Some(config.history_limit_days),
            algorithm: Some(config.algorithm),
            groups: config.groups.clone(),
            feeds: Some(SyntheticFeeds {
                all_company: config.sync_all_company,
                private_conversations: config.sync_private_conversations,
                inbox: config.sync_inbox,
            }),
            trust_reported_message_counts: config.trust_reported_message_counts,
            poll_interval_secs: Some(config.poll_interval_secs),
        }
    }
}

impl Config {
    /// Resolution order: env vars → config file → defaults.
    pub fn resolve() -> Self {
        let mut config = Config::default();
        match FileConfig::load() {
            Ok(Some(fc)) => {
                log::info!("Config loaded from {}", config_path().display());
                config.apply_file(&fc);
            }
            Ok(None) => log::info!("No config file found, using defaults"),
            Err(e) => log::warn!("Config file error: {}", e),
        }
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    pub fn apply_file(&mut self, fc: &FileConfig) {
        if let Some(path) = &fc.db_path {
            self.db_path = path.clone();
        }
        if let Some(days) = fc.history_limit_days {
            self.history_limit_days = days;
        }
        if let Some(algorithm) = fc.algorithm {
            self.algorithm = algorithm;
        }
        self.groups = fc.groups.clone();
        if let Some(feeds) = fc.feeds {
            self.sync_all_company = feeds.all_company;
            self.sync_private_conversations = feeds.private_conversations;
            self.sync_inbox = feeds.inbox;
        }
        self.trust_reported_message_counts = fc.trust_reported_message_counts;
        if let Some(secs) = fc.poll_interval_secs {
            self.poll_interval_secs = secs;
        }
    }

    /// Overlay `FEEDKEEPER_*` variables. Unparseable values are ignored
    /// with a warning.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(path) = var("FEEDKEEPER_DB") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(days) = var("FEEDKEEPER_HISTORY_DAYS") {
            match days.trim().parse() {
                Ok(days) => self.history_limit_days = days,
                Err(e) => log::warn!("FEEDKEEPER_HISTORY_DAYS={days:?}: {e}"),
            }
        }
        if let Some(algorithm) = var("FEEDKEEPER_ALGORITHM") {
            match algorithm.trim().parse() {
                Ok(algorithm) => self.algorithm = algorithm,
                Err(e) => log::warn!("FEEDKEEPER_ALGORITHM: {e}"),
            }
        }
        if let Some(groups) = var("FEEDKEEPER_GROUPS") {
            let parsed: Result<Vec<GroupId>, _> = groups
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::parse)
                .collect();
            match parsed {
                Ok(ids) => self.groups = ids,
                Err(e) => log::warn!("FEEDKEEPER_GROUPS={groups:?}: {e}"),
            }
        }
    }

    pub fn puller_settings(&self) -> PullerSettings {
        PullerSettings {
            algorithm: self.algorithm,
            history_limit_days: self.history_limit_days,
            trust_reported_message_counts: self.trust_reported_message_counts,
            ..PullerSettings::default()
        }
    }

    /// Active feeds in selection order: synthetic feeds first, then groups.
    pub fn feeds(&self) -> Vec<FeedId> {
        let mut feeds = Vec::new();
        if self.sync_inbox {
            feeds.push(FeedId::Inbox);
        }
        if self.sync_all_company {
            feeds.push(FeedId::AllCompany);
        }
        if self.sync_private_conversations {
            feeds.push(FeedId::PrivateConversations);
        }
        for &group in &self.groups {
            let feed = FeedId::Group(group);
            if !feeds.contains(&feed) {
                feeds.push(feed);
            }
        }
        feeds
    }
}
