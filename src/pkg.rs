//! Package identifiers.
//!
//! A package is identified by `(name, arch, upstream_version,
//! distri_revision)`, rendered `name[-arch][-upstream][-revision]`, e.g.
//! `less-amd64-530-2`. Names may themselves contain hyphens, so parsing
//! anchors on the architecture token: everything before it is the name,
//! the trailing integer (if any) is the revision, and whatever sits in
//! between is the upstream version. A string without an architecture
//! token is a bare name, which is how partial identifiers are written.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

pub const ARCHES: &[&str] = &["amd64", "i686"];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageId {
    pub name: String,
    pub arch: Option<String>,
    pub upstream: Option<String>,
    pub revision: Option<i64>,
}

impl PackageId {
    pub fn parse(s: &str) -> Result<Self, Error> {
        if s.is_empty()
            || !s
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'+' | b'.' | b'-'))
        {
            return Err(Error::InvalidIdentifier(s.to_string()));
        }

        let tokens: Vec<&str> = s.split('-').collect();
        let arch_pos = tokens.iter().rposition(|t| ARCHES.contains(t));
        let Some(arch_pos) = arch_pos else {
            return Ok(Self { name: s.to_string(), arch: None, upstream: None, revision: None });
        };
        if arch_pos == 0 {
            return Err(Error::InvalidIdentifier(s.to_string()));
        }

        let name = tokens[..arch_pos].join("-");
        let arch = Some(tokens[arch_pos].to_string());
        let rest = &tokens[arch_pos + 1..];
        let (upstream, revision) = match rest {
            [] => (None, None),
            [.., last] => match last.parse::<i64>() {
                Ok(rev) if rest.len() > 1 => {
                    (Some(rest[..rest.len() - 1].join("-")), Some(rev))
                }
                // a single trailing token that parses as an integer is
                // still the upstream version ("foo-amd64-2" has no
                // revision), except it cannot be told apart; treat a lone
                // integer as the upstream version
                _ => (Some(rest.join("-")), None),
            },
        };
        Ok(Self { name, arch, upstream, revision })
    }

    /// A fully qualified identifier names all four components.
    pub fn is_fully_qualified(&self) -> bool {
        self.arch.is_some() && self.upstream.is_some() && self.revision.is_some()
    }

    /// Whether `self` (a store entry) satisfies `partial` (a query).
    pub fn matches(&self, partial: &PackageId) -> bool {
        if self.name != partial.name {
            return false;
        }
        if let Some(arch) = &partial.arch {
            if self.arch.as_ref() != Some(arch) {
                return false;
            }
        }
        if let Some(upstream) = &partial.upstream {
            if self.upstream.as_ref() != Some(upstream) {
                return false;
            }
        }
        if let Some(rev) = partial.revision {
            if self.revision != Some(rev) {
                return false;
            }
        }
        true
    }

    /// Ordering used wherever scan order matters: by revision when name
    /// and arch agree, otherwise by the rendered string.
    pub fn revision_less(&self, other: &PackageId) -> bool {
        if self.name == other.name && self.arch == other.arch {
            return self.revision.unwrap_or(-1) < other.revision.unwrap_or(-1);
        }
        self.to_string() < other.to_string()
    }

    pub fn revision_cmp(&self, other: &PackageId) -> Ordering {
        if self.revision_less(other) {
            Ordering::Less
        } else if other.revision_less(self) {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(arch) = &self.arch {
            write!(f, "-{arch}")?;
        }
        if let Some(upstream) = &self.upstream {
            write!(f, "-{upstream}")?;
        }
        if let Some(rev) = self.revision {
            write!(f, "-{rev}")?;
        }
        Ok(())
    }
}

impl FromStr for PackageId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fully_qualified() {
        let id = PackageId::parse("less-amd64-530-2").unwrap();
        assert_eq!(id.name, "less");
        assert_eq!(id.arch.as_deref(), Some("amd64"));
        assert_eq!(id.upstream.as_deref(), Some("530"));
        assert_eq!(id.revision, Some(2));
        assert!(id.is_fully_qualified());
    }

    #[test]
    fn test_parse_hyphenated_name_and_version() {
        let id = PackageId::parse("pkg-config-amd64-0.29.2-4").unwrap();
        assert_eq!(id.name, "pkg-config");
        assert_eq!(id.upstream.as_deref(), Some("0.29.2"));
        assert_eq!(id.revision, Some(4));

        let id = PackageId::parse("glib-amd64-2.58.0-11").unwrap();
        assert_eq!(id.name, "glib");
        assert_eq!(id.upstream.as_deref(), Some("2.58.0"));
    }

    #[test]
    fn test_parse_partial() {
        let id = PackageId::parse("less").unwrap();
        assert_eq!(id.name, "less");
        assert!(id.arch.is_none());
        assert!(!id.is_fully_qualified());

        let id = PackageId::parse("less-amd64").unwrap();
        assert_eq!(id.name, "less");
        assert_eq!(id.arch.as_deref(), Some("amd64"));
        assert!(id.upstream.is_none());
    }

    #[test]
    fn test_roundtrip() {
        for s in ["less", "less-amd64", "less-amd64-530", "less-amd64-530-2", "gtk+-3.0-i686-3.24.8-1"] {
            assert_eq!(PackageId::parse(s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn test_rejects_invalid() {
        assert!(PackageId::parse("").is_err());
        assert!(PackageId::parse("Has-Upper").is_err());
        assert!(PackageId::parse("amd64").is_err());
    }

    #[test]
    fn test_revision_ordering() {
        let a = PackageId::parse("less-amd64-530-2").unwrap();
        let b = PackageId::parse("less-amd64-530-3").unwrap();
        let c = PackageId::parse("zsh-amd64-5.9-1").unwrap();
        assert!(a.revision_less(&b));
        assert!(!b.revision_less(&a));
        assert!(a.revision_less(&c));

        let mut v = vec![b.clone(), c.clone(), a.clone()];
        v.sort_by(|x, y| x.revision_cmp(y));
        assert_eq!(v, vec![a, b, c]);
    }

    #[test]
    fn test_matches() {
        let full = PackageId::parse("less-amd64-530-2").unwrap();
        assert!(full.matches(&PackageId::parse("less").unwrap()));
        assert!(full.matches(&PackageId::parse("less-amd64").unwrap()));
        assert!(full.matches(&full));
        assert!(!full.matches(&PackageId::parse("zsh").unwrap()));
        assert!(!full.matches(&PackageId::parse("less-i686").unwrap()));
    }
}
