use crate::mapping::{Mapping, MappingError, Upstream};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no mapping found for {0}")]
    NotFound(String),
    #[error(transparent)]
    Mapping(#[from] MappingError),
}

/// Turns a recipient address into the upstream server that should
/// receive the message, by consulting an ordered chain of mappings.
pub struct Resolver {
    mappings: Vec<Box<dyn Mapping>>,
    recipient_delimiter: String,
}

impl Resolver {
    pub fn new(mappings: Vec<Box<dyn Mapping>>, recipient_delimiter: String) -> Self {
        Self {
            mappings,
            recipient_delimiter,
        }
    }

    /// The first mapping that knows any of the candidate keys wins;
    /// within a mapping the keys are tried most-specific first. An
    /// operational error from a mapping is surfaced immediately rather
    /// than falling through to a catch-all: routing mail to the wrong
    /// server during a partial outage is worse than tempfailing it.
    pub async fn resolve(&self, recipient: &str) -> Result<Upstream, ResolveError> {
        let keys = candidate_keys(recipient, &self.recipient_delimiter);

        for mapping in &self.mappings {
            tracing::debug!(mapping = %mapping, "consulting mapping");
            for key in &keys {
                if let Some(mut upstream) = mapping.lookup(key).await? {
                    upstream.server = ensure_port(&upstream.server);
                    tracing::debug!(key = %key, upstream = %upstream, "resolved");
                    return Ok(upstream);
                }
            }
        }

        Err(ResolveError::NotFound(recipient.to_string()))
    }
}

/// Lookup keys for one recipient, most specific first: the full
/// address, the address with any sub-address tag stripped from the
/// local part, and the bare domain.
fn candidate_keys(recipient: &str, delimiter: &str) -> Vec<String> {
    let mut keys = vec![recipient.to_string()];

    if let Some((local_part, domain)) = recipient.rsplit_once('@') {
        if !delimiter.is_empty() {
            if let Some((stem, _tag)) = local_part.split_once(delimiter) {
                let stripped = format!("{stem}@{domain}");
                if stripped != recipient {
                    keys.push(stripped);
                }
            }
        }
        keys.push(domain.to_string());
    }

    keys
}

/// Append the default SMTP port when the server field has none,
/// taking care not to mistake a bracketed IPv6 literal for host:port.
fn ensure_port(server: &str) -> String {
    let has_port = match server.rfind(']') {
        Some(idx) => server[idx + 1..].starts_with(':'),
        None => server.contains(':'),
    };
    if has_port {
        server.to_string()
    } else {
        format!("{server}:25")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mapping::{CsvMapping, StaticMapping};
    use async_trait::async_trait;
    use std::fmt;

    struct BrokenMapping;

    #[async_trait]
    impl Mapping for BrokenMapping {
        async fn lookup(&self, _key: &str) -> Result<Option<Upstream>, MappingError> {
            Err(MappingError::Sql(sqlx::Error::PoolTimedOut))
        }
    }

    impl fmt::Display for BrokenMapping {
        fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
            write!(fmt, "{{broken}}")
        }
    }

    fn csv(records: &str) -> Box<dyn Mapping> {
        let text = format!("pattern;server;tls_verify\n{records}");
        Box::new(CsvMapping::parse(&text).unwrap())
    }

    #[test]
    fn key_derivation() {
        assert_eq!(
            candidate_keys("foo@bar.com", ""),
            vec!["foo@bar.com".to_string(), "bar.com".to_string()]
        );
        assert_eq!(
            candidate_keys("foo+spam@bar.com", "+"),
            vec![
                "foo+spam@bar.com".to_string(),
                "foo@bar.com".to_string(),
                "bar.com".to_string()
            ]
        );
        // delimiter configured but absent from the local part
        assert_eq!(
            candidate_keys("foo@bar.com", "+"),
            vec!["foo@bar.com".to_string(), "bar.com".to_string()]
        );
        // only the local part is considered for stripping
        assert_eq!(
            candidate_keys("foo@bar+baz.com", "+"),
            vec!["foo@bar+baz.com".to_string(), "bar+baz.com".to_string()]
        );
        assert_eq!(candidate_keys("postmaster", "+"), vec!["postmaster".to_string()]);
    }

    #[test]
    fn port_normalization() {
        assert_eq!(ensure_port("mx.int"), "mx.int:25");
        assert_eq!(ensure_port("mx.int:2525"), "mx.int:2525");
        assert_eq!(ensure_port("[::1]"), "[::1]:25");
        assert_eq!(ensure_port("[::1]:587"), "[::1]:587");
    }

    #[tokio::test]
    async fn full_address_wins_over_domain() {
        let resolver = Resolver::new(
            vec![csv(
                "foo@bar.com;mx1.int:25;true\nbar.com;mx-domain.int:25;true\n",
            )],
            String::new(),
        );
        let upstream = resolver.resolve("foo@bar.com").await.unwrap();
        assert_eq!(upstream.server, "mx1.int:25");
    }

    #[tokio::test]
    async fn domain_fallback_within_mapping() {
        let resolver = Resolver::new(
            vec![csv("bar.com;mx2.int:25;false\n")],
            String::new(),
        );
        let upstream = resolver.resolve("anybody@bar.com").await.unwrap();
        assert_eq!(upstream.server, "mx2.int:25");
        assert!(!upstream.tls_verify);
    }

    #[tokio::test]
    async fn chain_falls_through_to_catch_all() {
        let resolver = Resolver::new(
            vec![
                csv("foo@bar.com;mx1.int:25;true\n"),
                Box::new(StaticMapping::new("mx-default", true)),
            ],
            String::new(),
        );
        let upstream = resolver.resolve("nobody@nowhere").await.unwrap();
        assert_eq!(upstream.server, "mx-default:25");
    }

    #[tokio::test]
    async fn delimiter_stripping() {
        let resolver = Resolver::new(
            vec![csv("foo@bar.com;mx:25;true\n")],
            "+".to_string(),
        );
        let upstream = resolver.resolve("foo+spam@bar.com").await.unwrap();
        assert_eq!(upstream.server, "mx:25");
    }

    #[tokio::test]
    async fn operational_error_aborts_chain() {
        let resolver = Resolver::new(
            vec![
                Box::new(BrokenMapping),
                Box::new(StaticMapping::new("mx-default", true)),
            ],
            String::new(),
        );
        let err = resolver.resolve("user@example.com").await.unwrap_err();
        assert!(
            matches!(err, ResolveError::Mapping(_)),
            "catch-all must not mask the outage, got {err:?}"
        );
    }

    #[tokio::test]
    async fn exhausted_chain_is_not_found() {
        let resolver = Resolver::new(vec![csv("")], String::new());
        let err = resolver.resolve("user@example.com").await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(_)));
    }
}
