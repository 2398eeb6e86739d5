//! Firmware version parsing, comparison and risk classification
//!
//! Supported syntaxes:
//! - standard releases `MM.mm[R]b` (e.g. `21.4R3`)
//! - service packs appended as `-Sx.y` (e.g. `20.4R3-S2.3`)
//! - lettered releases `MM.mmXnn-Dpp` (e.g. `15.1X49-D170.4`)
//!
//! Unparseable strings yield the all-zero tuple, which means "unknown".

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Parsed version: (major, minor, release flag, build, service pack, patch)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct VersionTuple {
    pub major: u32,
    pub minor: u32,
    pub release: u32,
    pub build: u32,
    pub service_pack: u32,
    pub patch: u32,
}

impl VersionTuple {
    pub fn is_unknown(&self) -> bool {
        *self == VersionTuple::default()
    }
}

impl fmt::Display for VersionTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}, {}, {}, {})",
            self.major, self.minor, self.release, self.build, self.service_pack, self.patch
        )
    }
}

/// Classification of a version transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionAction {
    SameVersion,
    MinorUpgrade,
    MinorDowngrade,
    MajorUpgrade,
    MajorDowngrade,
    Unknown,
}

impl VersionAction {
    pub fn is_downgrade(&self) -> bool {
        matches!(self, VersionAction::MinorDowngrade | VersionAction::MajorDowngrade)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VersionAction::SameVersion => "same_version",
            VersionAction::MinorUpgrade => "minor_upgrade",
            VersionAction::MinorDowngrade => "minor_downgrade",
            VersionAction::MajorUpgrade => "major_upgrade",
            VersionAction::MajorDowngrade => "major_downgrade",
            VersionAction::Unknown => "unknown",
        }
    }
}

impl fmt::Display for VersionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Risk attached to a version transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    None,
    Low,
    Medium,
    High,
    Unknown,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::None => "none",
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Parse a version string. Never fails; unparseable input is all-zero.
pub fn parse(version: &str) -> VersionTuple {
    let version = version.trim();

    let (base, service_pack, patch) = match version.split_once("-S") {
        Some((base, sp)) => {
            let (service_pack, rest) = take_number(sp).unwrap_or((0, sp));
            let patch = rest
                .strip_prefix('.')
                .and_then(take_number)
                .map(|(n, _)| n)
                .unwrap_or(0);
            (base, service_pack, patch)
        }
        None => (version, 0, 0),
    };

    let Some((major, rest)) = take_number(base) else {
        return VersionTuple::default();
    };
    let Some(rest) = rest.strip_prefix('.') else {
        return VersionTuple::default();
    };
    let Some((minor, rest)) = take_number(rest) else {
        return VersionTuple::default();
    };

    if let Some(rest) = rest.strip_prefix('X') {
        // Lettered release: MM.mmXnn[-Dpp]
        let Some((x, rest)) = take_number(rest) else {
            return VersionTuple::default();
        };
        let d = rest
            .strip_prefix("-D")
            .and_then(take_number)
            .map(|(n, _)| n)
            .unwrap_or(0);
        return VersionTuple {
            major,
            minor,
            release: 1,
            build: 0,
            service_pack: x,
            patch: d,
        };
    }

    let (release, rest) = match rest.strip_prefix(['R', 'r']) {
        Some(rest) => (1, rest),
        None => (0, rest),
    };
    let build = take_number(rest).map(|(n, _)| n).unwrap_or(0);

    VersionTuple {
        major,
        minor,
        release,
        build,
        service_pack,
        patch,
    }
}

fn take_number(s: &str) -> Option<(u32, &str)> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    let n = s[..end].parse().ok()?;
    Some((n, &s[end..]))
}

/// Classify the transition from `current` to `target`
pub fn compare(current: &str, target: &str) -> VersionAction {
    compare_tuples(&parse(current), &parse(target))
}

pub fn compare_tuples(current: &VersionTuple, target: &VersionTuple) -> VersionAction {
    if current.is_unknown() || target.is_unknown() {
        return VersionAction::Unknown;
    }
    if current == target {
        return VersionAction::SameVersion;
    }
    match target.major.cmp(&current.major) {
        Ordering::Greater => VersionAction::MajorUpgrade,
        Ordering::Less => VersionAction::MajorDowngrade,
        Ordering::Equal => match target.cmp(current) {
            Ordering::Greater => VersionAction::MinorUpgrade,
            Ordering::Less => VersionAction::MinorDowngrade,
            Ordering::Equal => VersionAction::SameVersion,
        },
    }
}

/// Risk lookup table. Callers may override entries without touching comparison.
#[derive(Debug, Clone)]
pub struct RiskTable {
    entries: HashMap<VersionAction, RiskLevel>,
}

impl Default for RiskTable {
    fn default() -> Self {
        let entries = HashMap::from([
            (VersionAction::SameVersion, RiskLevel::None),
            (VersionAction::MinorUpgrade, RiskLevel::Low),
            (VersionAction::MinorDowngrade, RiskLevel::Medium),
            (VersionAction::MajorUpgrade, RiskLevel::Medium),
            (VersionAction::MajorDowngrade, RiskLevel::High),
            (VersionAction::Unknown, RiskLevel::Unknown),
        ]);
        Self { entries }
    }
}

impl RiskTable {
    /// Override one entry
    pub fn with(mut self, action: VersionAction, level: RiskLevel) -> Self {
        self.entries.insert(action, level);
        self
    }

    pub fn risk(&self, action: VersionAction) -> RiskLevel {
        self.entries.get(&action).copied().unwrap_or(RiskLevel::Unknown)
    }

    /// Downgrades at high risk require an explicit force
    pub fn requires_force(&self, action: VersionAction) -> bool {
        action.is_downgrade() && self.risk(action) == RiskLevel::High
    }
}

/// Risk from the default table
pub fn risk(action: VersionAction) -> RiskLevel {
    RiskTable::default().risk(action)
}

/// Advisory note for large jumps, which often need an intermediate release
pub fn compatibility_note(current: &VersionTuple, target: &VersionTuple) -> Option<String> {
    if current.is_unknown() || target.is_unknown() {
        return None;
    }
    let major_gap = current.major.abs_diff(target.major);
    if major_gap > 1 {
        return Some(format!(
            "Major version jump of {} releases ({} -> {}); an intermediate release may be required",
            major_gap, current.major, target.major
        ));
    }
    if major_gap == 0 {
        let minor_gap = current.minor.abs_diff(target.minor);
        if minor_gap > 3 {
            return Some(format!(
                "Minor version gap of {} ({}.{} -> {}.{})",
                minor_gap, current.major, current.minor, target.major, target.minor
            ));
        }
    }
    None
}
