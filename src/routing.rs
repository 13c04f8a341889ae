//! Per-domain upstream routing with longest-suffix matching.

use std::collections::HashMap;
use std::sync::Arc;

use crate::upstream::Upstream;

/// Target of a reserved-domain entry
pub enum RouteTarget {
    /// Names under the suffix resolve through this ordered upstream list
    Reserved(Vec<Arc<dyn Upstream>>),
    /// Names under the suffix receive an empty positive answer and are
    /// never forwarded
    Unresolvable,
}

/// Immutable qname-to-upstreams routing table.
///
/// Reserved keys are lowercased suffixes in trailing-dot form. The empty
/// suffix stands for the root and overrides the default list when present.
/// Read-only after construction, so lookups take no lock.
pub struct RoutingTable {
    default_upstreams: Vec<Arc<dyn Upstream>>,
    reserved: HashMap<String, RouteTarget>,
}

impl RoutingTable {
    pub fn new(
        default_upstreams: Vec<Arc<dyn Upstream>>,
        reserved: HashMap<String, RouteTarget>,
    ) -> Self {
        let reserved = reserved
            .into_iter()
            .map(|(suffix, target)| (Self::normalize(&suffix), target))
            .collect();

        Self {
            default_upstreams,
            reserved,
        }
    }

    /// Normalize a domain to its lowercased trailing-dot form. The empty
    /// string stays empty (the root suffix).
    pub fn normalize(name: &str) -> String {
        let mut name = name.to_lowercase();
        if !name.is_empty() && !name.ends_with('.') {
            name.push('.');
        }
        name
    }

    /// Ordered upstreams for a query name.
    ///
    /// Suffixes are probed from longest to shortest, the empty suffix last;
    /// the first reserved entry wins. Returns `false` when the name matches
    /// an unresolvable marker, in which case the caller must answer with an
    /// empty positive response instead of forwarding.
    pub fn upstreams_for(&self, qname: &str) -> (Vec<Arc<dyn Upstream>>, bool) {
        let name = Self::normalize(qname);

        let mut suffix = name.as_str();
        loop {
            if let Some(target) = self.reserved.get(suffix) {
                return match target {
                    RouteTarget::Reserved(upstreams) => (upstreams.clone(), true),
                    RouteTarget::Unresolvable => (Vec::new(), false),
                };
            }
            if suffix.is_empty() {
                break;
            }
            suffix = match suffix.split_once('.') {
                Some((_, rest)) => rest,
                None => "",
            };
        }

        (self.default_upstreams.clone(), true)
    }

    /// Whether any upstream can ever be selected
    pub fn is_empty(&self) -> bool {
        self.default_upstreams.is_empty()
            && !self
                .reserved
                .values()
                .any(|t| matches!(t, RouteTarget::Reserved(u) if !u.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use hickory_proto::op::Message;

    /// Upstream stand-in carrying only an address
    struct StubUpstream(String);

    #[async_trait]
    impl Upstream for StubUpstream {
        async fn exchange(&self, _query: &Message) -> Result<Message> {
            anyhow::bail!("stub upstream {} cannot resolve", self.0)
        }

        fn address(&self) -> &str {
            &self.0
        }
    }

    fn stub(address: &str) -> Arc<dyn Upstream> {
        Arc::new(StubUpstream(address.to_string()))
    }

    fn addresses(upstreams: &[Arc<dyn Upstream>]) -> Vec<&str> {
        upstreams.iter().map(|u| u.address()).collect()
    }

    /// Reservations mirroring the config lines
    /// `[/google.com/local/]4.3.2.1`, `[/www.google.com//]1.2.3.4`,
    /// `[/maps.google.com/]#`, `[/www.google.com/]tls://1.1.1.1`.
    fn reserved_table() -> RoutingTable {
        let mut reserved = HashMap::new();
        reserved.insert(
            "google.com.".to_string(),
            RouteTarget::Reserved(vec![stub("4.3.2.1:53")]),
        );
        reserved.insert(
            "local.".to_string(),
            RouteTarget::Reserved(vec![stub("4.3.2.1:53")]),
        );
        reserved.insert(
            "www.google.com.".to_string(),
            RouteTarget::Reserved(vec![stub("1.2.3.4:53"), stub("tls://1.1.1.1:853")]),
        );
        reserved.insert(
            "".to_string(),
            RouteTarget::Reserved(vec![stub("1.2.3.4:53")]),
        );
        reserved.insert("maps.google.com.".to_string(), RouteTarget::Unresolvable);

        RoutingTable::new(Vec::new(), reserved)
    }

    #[test]
    fn test_reserved_domains() {
        let table = reserved_table();

        let (upstreams, ok) = table.upstreams_for("www.google.com.");
        assert!(ok);
        assert_eq!(addresses(&upstreams), vec!["1.2.3.4:53", "tls://1.1.1.1:853"]);

        let (upstreams, ok) = table.upstreams_for("www2.google.com.");
        assert!(ok);
        assert_eq!(addresses(&upstreams), vec!["4.3.2.1:53"]);

        let (upstreams, ok) = table.upstreams_for("internal.local.");
        assert!(ok);
        assert_eq!(addresses(&upstreams), vec!["4.3.2.1:53"]);

        // Single label: matches the root override, not google.com.
        let (upstreams, ok) = table.upstreams_for("google.");
        assert!(ok);
        assert_eq!(addresses(&upstreams), vec!["1.2.3.4:53"]);

        let (upstreams, ok) = table.upstreams_for("maps.google.com.");
        assert!(!ok);
        assert!(upstreams.is_empty());
    }

    #[test]
    fn test_longest_suffix_wins() {
        let mut reserved = HashMap::new();
        reserved.insert(
            "a.b.".to_string(),
            RouteTarget::Reserved(vec![stub("1.1.1.1:53")]),
        );
        reserved.insert(
            "b.".to_string(),
            RouteTarget::Reserved(vec![stub("2.2.2.2:53")]),
        );
        let table = RoutingTable::new(vec![stub("9.9.9.9:53")], reserved);

        let (upstreams, _) = table.upstreams_for("x.a.b.");
        assert_eq!(addresses(&upstreams), vec!["1.1.1.1:53"]);

        let (upstreams, _) = table.upstreams_for("x.b.");
        assert_eq!(addresses(&upstreams), vec!["2.2.2.2:53"]);

        let (upstreams, _) = table.upstreams_for("x.c.");
        assert_eq!(addresses(&upstreams), vec!["9.9.9.9:53"]);
    }

    #[test]
    fn test_normalization() {
        let mut reserved = HashMap::new();
        reserved.insert(
            "Example.COM".to_string(),
            RouteTarget::Reserved(vec![stub("1.1.1.1:53")]),
        );
        let table = RoutingTable::new(Vec::new(), reserved);

        let (upstreams, _) = table.upstreams_for("WWW.EXAMPLE.com");
        assert_eq!(addresses(&upstreams), vec!["1.1.1.1:53"]);
    }

    #[test]
    fn test_default_fallthrough() {
        let table = RoutingTable::new(vec![stub("8.8.8.8:53")], HashMap::new());

        let (upstreams, ok) = table.upstreams_for("anything.example.org.");
        assert!(ok);
        assert_eq!(addresses(&upstreams), vec!["8.8.8.8:53"]);
        assert!(!table.is_empty());
    }
}
