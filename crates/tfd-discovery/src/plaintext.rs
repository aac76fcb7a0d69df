//! Hosts-file discovery.
//!
//! One logical record per non-empty, non-comment line: the first token is
//! the instance name (`tfs-{team}-{project}`), the remaining tokens are
//! `ip:port` endpoints. `#` and `;` open comments.

use std::path::PathBuf;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;

use tfd_core::{ServableId, MAX_PROJECT_LEN, MAX_TEAM_LEN};

use crate::{Discoverer, DiscoveryError, Result};

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[[:space:]]+").expect("whitespace regex"))
}

fn comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[[:space:]]*[#;]+").expect("comment regex"))
}

fn instance_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            "^tfs-[[:alnum:]]{{1,{MAX_TEAM_LEN}}}-[[:alnum:]]{{1,{MAX_PROJECT_LEN}}}"
        ))
        .expect("instance name regex")
    })
}

fn ipv4_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(([0-9]|[1-9][0-9]|1[0-9]{2}|2[0-4][0-9]|25[0-5])\.){3}([0-9]|[1-9][0-9]|1[0-9]{2}|2[0-4][0-9]|25[0-5])$",
        )
        .expect("ipv4 regex")
    })
}

/// Discovery from a plaintext hosts file.
#[derive(Debug, Clone)]
pub struct PlaintextDiscovery {
    hosts_path: PathBuf,
}

impl PlaintextDiscovery {
    /// Creates a discoverer reading the given hosts file on every call.
    #[must_use]
    pub fn new(hosts_path: impl Into<PathBuf>) -> Self {
        Self {
            hosts_path: hosts_path.into(),
        }
    }

    fn skip_line(line: &str) -> bool {
        line.is_empty() || comment_re().is_match(line)
    }

    fn extract_instance_name(line: &str) -> Result<&str> {
        let trimmed = line.trim_start();
        if trimmed.is_empty() {
            return Err(DiscoveryError::InstanceNameIsEmpty);
        }
        let first = whitespace_re()
            .split(trimmed)
            .next()
            .ok_or(DiscoveryError::InstanceNameIsEmpty)?;
        if !instance_name_re().is_match(first) {
            return Err(DiscoveryError::InvalidInstanceName);
        }
        Ok(first)
    }

    fn extract_instances(line: &str) -> Result<Vec<&str>> {
        let tokens: Vec<&str> = whitespace_re()
            .split(line.trim_start())
            .filter(|t| !t.is_empty())
            .collect();
        if tokens.len() <= 1 {
            return Err(DiscoveryError::NotFoundInstanceAddress);
        }
        Ok(tokens[1..].to_vec())
    }

    fn is_valid_instance(entry: &str) -> bool {
        let Some((ip, port)) = entry.split_once(':') else {
            return false;
        };
        if port.contains(':') || !ipv4_re().is_match(ip) {
            return false;
        }
        // no leading-zero ports
        if port.starts_with('0') {
            return false;
        }
        matches!(port.parse::<u32>(), Ok(p) if (1..=65535).contains(&p))
    }

    fn read_record(line_no: usize, line: &str) -> Result<Vec<String>> {
        Self::extract_instance_name(line)?;
        let entries = Self::extract_instances(line)?;

        let mut instances = Vec::with_capacity(entries.len());
        for entry in entries {
            if !Self::is_valid_instance(entry) {
                return Err(DiscoveryError::InvalidInstanceAddress {
                    line: line_no + 1,
                    address: entry.to_string(),
                });
            }
            instances.push(entry.to_string());
        }
        Ok(instances)
    }
}

#[async_trait]
impl Discoverer for PlaintextDiscovery {
    async fn discover(&self, id: &ServableId) -> Result<Vec<String>> {
        let contents = std::fs::read_to_string(&self.hosts_path)?;
        let wanted = id.instance_name();

        let mut instances = Vec::new();
        for (line_no, line) in contents.lines().enumerate() {
            if Self::skip_line(line) {
                continue;
            }
            if Self::extract_instance_name(line)? != wanted {
                continue;
            }
            instances.extend(Self::read_record(line_no, line)?);
        }
        Ok(instances)
    }
}
