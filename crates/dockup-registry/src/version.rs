//! Version-like tag parsing and update selection.
//!
//! A tag is `[v|version-]N(.N)*` optionally followed by a qualifier from a
//! fixed vocabulary (`rc`, `beta`, `alpha`, `nightly`, `edge`, `dev`, `pre`)
//! with an optional trailing number. Anything else (`latest`, `-alpine`,
//! `-ls123`, architecture suffixes) does not parse and is never suggested.

use std::cmp::Ordering;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::VersionError;

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(\d+(?:\.\d+)*)(?:[-._]?(rc|beta|alpha|nightly|edge|dev|pre)[-._]?(\d+)?)?$")
        .expect("tag regex is valid")
});

/// Trailing qualifier of a version tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qualifier {
    Stable,
    Rc,
    Beta,
    Alpha,
    Nightly,
    Edge,
    Dev,
    Pre,
}

impl Qualifier {
    fn from_word(word: &str) -> Self {
        match word.to_ascii_lowercase().as_str() {
            "rc" => Self::Rc,
            "beta" => Self::Beta,
            "alpha" => Self::Alpha,
            "nightly" => Self::Nightly,
            "edge" => Self::Edge,
            "dev" => Self::Dev,
            _ => Self::Pre,
        }
    }

    /// stable > rc > beta > alpha > the development channels (equal rank).
    fn rank(self) -> u8 {
        match self {
            Self::Stable => 4,
            Self::Rc => 3,
            Self::Beta => 2,
            Self::Alpha => 1,
            Self::Nightly | Self::Edge | Self::Dev | Self::Pre => 0,
        }
    }

    pub fn is_prerelease(self) -> bool {
        self != Self::Stable
    }
}

/// A parsed version tag.
#[derive(Debug, Clone)]
pub struct Version {
    pub segments: Vec<u64>,
    pub qualifier: Qualifier,
    pub qualifier_num: Option<u64>,
}

impl Version {
    /// Parse a tag, or `None` if it is not version-like.
    pub fn parse(tag: &str) -> Option<Self> {
        let cleaned = tag.strip_prefix("version-").unwrap_or(tag);
        let cleaned = cleaned
            .strip_prefix('v')
            .or_else(|| cleaned.strip_prefix('V'))
            .unwrap_or(cleaned);

        let caps = TAG_RE.captures(cleaned)?;
        let segments = caps[1]
            .split('.')
            .map(|s| s.parse::<u64>().ok())
            .collect::<Option<Vec<_>>>()?;
        let qualifier = caps
            .get(2)
            .map_or(Qualifier::Stable, |m| Qualifier::from_word(m.as_str()));
        let qualifier_num = match caps.get(3) {
            Some(m) => Some(m.as_str().parse::<u64>().ok()?),
            None => None,
        };

        Some(Self {
            segments,
            qualifier,
            qualifier_num,
        })
    }

    pub fn is_prerelease(&self) -> bool {
        self.qualifier.is_prerelease()
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.segments.len().max(other.segments.len());
        for i in 0..len {
            let a = self.segments.get(i).copied().unwrap_or(0);
            let b = other.segments.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        self.qualifier
            .rank()
            .cmp(&other.qualifier.rank())
            .then_with(|| {
                self.qualifier_num
                    .unwrap_or(0)
                    .cmp(&other.qualifier_num.unwrap_or(0))
            })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<String> = self.segments.iter().map(u64::to_string).collect();
        write!(f, "{}", joined.join("."))?;
        if self.qualifier != Qualifier::Stable {
            write!(f, "-{:?}", self.qualifier)?;
            if let Some(n) = self.qualifier_num {
                write!(f, "{n}")?;
            }
        }
        Ok(())
    }
}

/// Pick the highest eligible candidate strictly newer than `current`.
///
/// Returns `Err` when `current` itself is not version-like: no update can
/// ever be suggested for such a container.
pub fn pick_update<S: AsRef<str>>(
    current: &str,
    candidates: &[S],
    allow_prerelease: bool,
) -> Result<Option<String>, VersionError> {
    let current_version =
        Version::parse(current).ok_or_else(|| VersionError::Unparseable(current.to_string()))?;

    let mut best: Option<(Version, &str)> = None;
    for candidate in candidates {
        let tag = candidate.as_ref();
        if tag == current {
            continue;
        }
        let Some(version) = Version::parse(tag) else {
            continue;
        };
        if version.is_prerelease() && !allow_prerelease {
            continue;
        }
        if version <= current_version {
            continue;
        }
        if best.as_ref().is_none_or(|(b, _)| version > *b) {
            best = Some((version, tag));
        }
    }
    Ok(best.map(|(_, tag)| tag.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(tag: &str) -> Version {
        Version::parse(tag).unwrap()
    }

    #[test]
    fn parses_common_tags() {
        assert_eq!(v("1.2.3").segments, vec![1, 2, 3]);
        assert_eq!(v("v2.0").segments, vec![2, 0]);
        assert_eq!(v("version-4.0.1").segments, vec![4, 0, 1]);
        assert_eq!(v("1.4.0-rc1").qualifier, Qualifier::Rc);
        assert_eq!(v("1.4.0-rc1").qualifier_num, Some(1));
        assert_eq!(v("2.0.0-beta.2").qualifier_num, Some(2));
        assert_eq!(v("3.1-nightly").qualifier, Qualifier::Nightly);
        assert_eq!(v("2024.01.1").segments, vec![2024, 1, 1]);
    }

    #[test]
    fn rejects_non_version_tags() {
        for tag in ["latest", "alpine", "1.2.3-alpine", "5.2.1-ls204", "1.0-arm64", "nightly", ""] {
            assert!(Version::parse(tag).is_none(), "{tag} should not parse");
        }
    }

    #[test]
    fn missing_segments_are_zero() {
        assert_eq!(v("1.2"), v("1.2.0"));
        assert!(v("1.2.1") > v("1.2"));
    }

    #[test]
    fn qualifier_ranking() {
        assert!(v("1.0.0") > v("1.0.0-rc1"));
        assert!(v("1.0.0-rc1") > v("1.0.0-beta3"));
        assert!(v("1.0.0-beta1") > v("1.0.0-alpha9"));
        assert!(v("1.0.0-alpha1") > v("1.0.0-dev"));
        assert_eq!(v("1.0.0-nightly"), v("1.0.0-edge"));
        assert!(v("1.0.0-rc2") > v("1.0.0-rc1"));
        assert!(v("1.0.1-alpha") > v("1.0.0"));
    }

    #[test]
    fn picks_stable_update_without_prerelease() {
        let candidates = ["1.2.0", "1.3.0", "1.4.0-rc1"];
        assert_eq!(
            pick_update("1.2.0", &candidates, false).unwrap().as_deref(),
            Some("1.3.0")
        );
    }

    #[test]
    fn picks_prerelease_when_allowed() {
        let candidates = ["1.2.0", "1.3.0", "1.4.0-rc1"];
        assert_eq!(
            pick_update("1.2.0", &candidates, true).unwrap().as_deref(),
            Some("1.4.0-rc1")
        );
    }

    #[test]
    fn never_returns_prerelease_when_disallowed() {
        let candidates = ["2.0.0-beta1", "2.0.0-alpha", "1.9.9-rc3", "3.0-nightly"];
        assert_eq!(pick_update("1.0.0", &candidates, false).unwrap(), None);
    }

    #[test]
    fn nothing_newer_or_only_same_tag() {
        assert_eq!(pick_update("1.3.0", &["1.2.0", "1.3.0"], false).unwrap(), None);
        assert_eq!(pick_update("1.3", &["1.3.0"], false).unwrap(), None);
        let empty: [&str; 0] = [];
        assert_eq!(pick_update("1.3", &empty, false).unwrap(), None);
    }

    #[test]
    fn unparseable_current_is_an_error() {
        let err = pick_update("latest", &["1.0.0"], true).unwrap_err();
        assert_eq!(err, VersionError::Unparseable("latest".to_string()));
    }

    #[test]
    fn unparseable_candidates_are_skipped() {
        let candidates = ["latest", "9.9.9-alpine", "1.1.0"];
        assert_eq!(
            pick_update("v1.0.0", &candidates, false).unwrap().as_deref(),
            Some("1.1.0")
        );
    }
}
