//! Transaction identifier handling
//!
//! MariaDB identifies every replicated transaction with a
//! `domain-server-sequence` triple. Identifiers from different domains are
//! not ordered relative to each other, so resume logic always works against
//! the full set of identifiers valid at a binlog boundary.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A global transaction id, rendered as `domain-server-sequence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gtid {
    /// Replication domain the transaction belongs to
    pub domain: u32,
    /// Server that originally committed the transaction
    pub server_id: u32,
    /// Monotonic sequence number within the domain
    pub sequence: u64,
}

impl Gtid {
    pub fn new(domain: u32, server_id: u32, sequence: u64) -> Self {
        Self {
            domain,
            server_id,
            sequence,
        }
    }

    /// True iff any candidate in the same domain has a higher sequence
    /// number than `self`. Candidates from other domains are not comparable
    /// and are ignored.
    pub fn any_newer<'a>(&self, candidates: impl IntoIterator<Item = &'a Gtid>) -> bool {
        candidates
            .into_iter()
            .any(|c| c.domain == self.domain && c.sequence > self.sequence)
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.domain, self.server_id, self.sequence)
    }
}

impl FromStr for Gtid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('-');
        let parsed = (|| {
            let domain = parts.next()?.parse().ok()?;
            let server_id = parts.next()?.parse().ok()?;
            let sequence = parts.next()?.parse().ok()?;
            if parts.next().is_some() {
                return None;
            }
            Some(Gtid {
                domain,
                server_id,
                sequence,
            })
        })();
        parsed.ok_or_else(|| Error::MalformedGtid(s.to_string()))
    }
}

/// Parse the list form returned by the binlog position scan.
///
/// The server renders the set parenthesized and comma-separated, e.g.
/// `(0-1-10,1-3-42)`; a bare comma-separated list and the empty string are
/// accepted as well. The empty string parses to the empty set.
pub fn parse_gtid_list(s: &str) -> Result<Vec<Gtid>> {
    let trimmed = s.trim();
    let inner = trimmed
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
        .unwrap_or(trimmed);

    if inner.is_empty() {
        return Ok(Vec::new());
    }

    inner.split(',').map(|part| part.trim().parse()).collect()
}

/// Render a set of ids back into the comma-separated form the upstream
/// session accepts as a starting position.
pub fn render_gtid_list(gtids: &[Gtid]) -> String {
    gtids
        .iter()
        .map(Gtid::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_render_round_trip() {
        for text in ["0-1-10", "4294967295-1-18446744073709551615", "1-2-0"] {
            let gtid: Gtid = text.parse().unwrap();
            assert_eq!(gtid.to_string(), text);
        }
    }

    #[test]
    fn test_parse_fields() {
        let gtid: Gtid = "2-30-400".parse().unwrap();
        assert_eq!(gtid.domain, 2);
        assert_eq!(gtid.server_id, 30);
        assert_eq!(gtid.sequence, 400);
    }

    #[test]
    fn test_parse_malformed() {
        for text in ["", "0-1", "0-1-2-3", "a-b-c", "0--1", "0-1-", "1.5-1-2"] {
            let err = text.parse::<Gtid>().unwrap_err();
            assert!(matches!(err, Error::MalformedGtid(_)), "accepted {text:?}");
        }
    }

    #[test]
    fn test_any_newer_same_domain() {
        let target: Gtid = "0-1-10".parse().unwrap();
        let older = vec!["0-1-5".parse().unwrap(), "0-2-10".parse().unwrap()];
        let newer = vec!["0-1-5".parse().unwrap(), "0-3-11".parse().unwrap()];

        assert!(!target.any_newer(&older));
        assert!(target.any_newer(&newer));
    }

    #[test]
    fn test_any_newer_ignores_other_domains() {
        let target: Gtid = "0-1-10".parse().unwrap();
        // A higher sequence in another domain says nothing about ours.
        let candidates = vec!["1-1-999".parse().unwrap(), "2-1-12".parse().unwrap()];
        assert!(!target.any_newer(&candidates));
    }

    #[test]
    fn test_parse_gtid_list() {
        assert_eq!(parse_gtid_list("").unwrap(), vec![]);
        assert_eq!(parse_gtid_list("()").unwrap(), vec![]);

        let set = parse_gtid_list("(0-1-10,1-3-42)").unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set[0], Gtid::new(0, 1, 10));
        assert_eq!(set[1], Gtid::new(1, 3, 42));

        // Bare list without parentheses
        let bare = parse_gtid_list("0-1-10, 1-3-42").unwrap();
        assert_eq!(bare, set);

        assert!(parse_gtid_list("(0-1)").is_err());
    }

    #[test]
    fn test_render_gtid_list() {
        let set = vec![Gtid::new(0, 1, 10), Gtid::new(1, 3, 42)];
        assert_eq!(render_gtid_list(&set), "0-1-10,1-3-42");
        assert_eq!(render_gtid_list(&[]), "");
    }
}
