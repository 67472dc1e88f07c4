//! Capability tags granted to agents.
//!
//! Skills form a closed registry: a mission string from config or from a
//! parent agent is validated here instead of being passed around as free
//! text. A child may only receive skills its parent already holds.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A single capability tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Skill {
    /// Passive reconnaissance and asset discovery
    Recon,
    /// Port and service enumeration
    PortScan,
    /// Crawling and endpoint mapping
    WebCrawl,
    /// Active web vulnerability probing
    WebScan,
    /// Exploitation of confirmed weaknesses
    Exploit,
    /// Static analysis of retrieved source or binaries
    Sast,
    /// Out-of-band callback probing
    OobProbe,
    /// Writing notes and intermediate knowledge
    Notes,
    /// Drafting and escalating findings
    Report,
}

impl Skill {
    pub const ALL: [Skill; 9] = [
        Skill::Recon,
        Skill::PortScan,
        Skill::WebCrawl,
        Skill::WebScan,
        Skill::Exploit,
        Skill::Sast,
        Skill::OobProbe,
        Skill::Notes,
        Skill::Report,
    ];
}

impl fmt::Display for Skill {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Skill::Recon => write!(f, "recon"),
            Skill::PortScan => write!(f, "port_scan"),
            Skill::WebCrawl => write!(f, "web_crawl"),
            Skill::WebScan => write!(f, "web_scan"),
            Skill::Exploit => write!(f, "exploit"),
            Skill::Sast => write!(f, "sast"),
            Skill::OobProbe => write!(f, "oob_probe"),
            Skill::Notes => write!(f, "notes"),
            Skill::Report => write!(f, "report"),
        }
    }
}

impl std::str::FromStr for Skill {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "recon" => Ok(Skill::Recon),
            "port_scan" | "portscan" => Ok(Skill::PortScan),
            "web_crawl" | "crawl" => Ok(Skill::WebCrawl),
            "web_scan" | "webscan" => Ok(Skill::WebScan),
            "exploit" => Ok(Skill::Exploit),
            "sast" => Ok(Skill::Sast),
            "oob_probe" | "oob" => Ok(Skill::OobProbe),
            "notes" => Ok(Skill::Notes),
            "report" => Ok(Skill::Report),
            _ => Err(format!("Unknown skill: {}", s)),
        }
    }
}

/// An ordered set of capability tags
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SkillSet(BTreeSet<Skill>);

impl SkillSet {
    pub fn empty() -> Self {
        Self(BTreeSet::new())
    }

    /// Every known skill. Granted to the root agent unless config narrows it.
    pub fn full() -> Self {
        Skill::ALL.into_iter().collect()
    }

    /// Validate a list of capability tags against the registry
    pub fn parse(tags: &[String]) -> Result<Self> {
        let mut skills = BTreeSet::new();
        for tag in tags {
            let skill = tag
                .parse::<Skill>()
                .map_err(|_| Error::UnknownSkill(tag.clone()))?;
            skills.insert(skill);
        }
        Ok(Self(skills))
    }

    pub fn insert(&mut self, skill: Skill) -> bool {
        self.0.insert(skill)
    }

    pub fn contains(&self, skill: Skill) -> bool {
        self.0.contains(&skill)
    }

    pub fn is_subset(&self, other: &SkillSet) -> bool {
        self.0.is_subset(&other.0)
    }

    /// Skills present here but missing from `other`
    pub fn missing_from(&self, other: &SkillSet) -> Vec<Skill> {
        self.0.difference(&other.0).copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = Skill> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Skill> for SkillSet {
    fn from_iter<I: IntoIterator<Item = Skill>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for SkillSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tags: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "{}", tags.join(","))
    }
}
