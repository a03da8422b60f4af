use crate::mapping::Upstream;
use esmtp::ReversePath;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    /// An SMTP error from the upstream, passed through to the client
    Upstream,
    /// Anything else: resolution, transport, TLS, invariant violations
    Internal,
}

impl ErrorSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upstream => "upstream",
            Self::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Verdict {
    Accepted,
    Rejected { error: String, source: ErrorSource },
}

pub struct LogDisposition<'a> {
    pub verdict: Verdict,
    pub peer: SocketAddr,
    pub helo: &'a str,
    pub client_tls: bool,
    pub sender: Option<&'a ReversePath>,
    pub recipients: &'a [String],
    pub upstream: Option<&'a Upstream>,
    pub upstream_tls: bool,
}

/// The one canonical record per message transaction. Everything else
/// relayd logs is debug-level colour; this line is the operational
/// audit trail.
pub fn log_disposition(args: LogDisposition<'_>) {
    let LogDisposition {
        verdict,
        peer,
        helo,
        client_tls,
        sender,
        recipients,
        upstream,
        upstream_tls,
    } = args;

    let from = sender.map(|s| s.to_string()).unwrap_or_default();
    let to = recipients.join(",");
    let upstream = upstream.map(|u| u.server.clone()).unwrap_or_default();

    match verdict {
        Verdict::Accepted => {
            tracing::info!(
                client = %peer,
                helo = %helo,
                client_tls,
                from = %from,
                to = %to,
                upstream = %upstream,
                upstream_tls,
                "Message accepted"
            );
        }
        Verdict::Rejected { error, source } => {
            tracing::info!(
                client = %peer,
                helo = %helo,
                client_tls,
                from = %from,
                to = %to,
                upstream = %upstream,
                upstream_tls,
                error = %error,
                error_src = source.as_str(),
                "Message rejected"
            );
        }
    }
}
