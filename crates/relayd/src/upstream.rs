use crate::dns;
use crate::mapping::Upstream;
use anyhow::Context;
use esmtp::{
    ClientError, Command, EsmtpParameter, ForwardPath, Response, ReversePath, SmtpClient,
    SmtpClientTimeouts, TlsOptions, TlsStatus, XClientParameter,
};
use std::net::{IpAddr, SocketAddr};

/// One live connection to the upstream chosen for the current
/// transaction. MAIL FROM has already been accepted by the time
/// `establish` returns; recipients and the message body are then
/// forwarded command by command.
pub struct UpstreamSession {
    pub upstream: Upstream,
    pub tls: bool,
    client: SmtpClient,
}

pub struct EstablishArgs<'a> {
    pub upstream: Upstream,
    /// Our own name: the upstream sees the proxy as the client
    pub ehlo_name: &'a str,
    pub client_addr: SocketAddr,
    pub client_helo: &'a str,
    pub client_tls: bool,
    pub sender: &'a ReversePath,
    pub sender_params: &'a [EsmtpParameter],
    pub timeouts: SmtpClientTimeouts,
}

impl UpstreamSession {
    /// Dial and prime the upstream for this transaction. Failures up to
    /// and including XCLIENT come back as plain errors (the client sees
    /// a generic transient reply); an SMTP rejection of the replayed
    /// MAIL FROM comes back as `ClientError::Rejected` so the caller can
    /// pass the upstream's own reply through.
    pub async fn establish(args: EstablishArgs<'_>) -> anyhow::Result<Self> {
        let EstablishArgs {
            upstream,
            ehlo_name,
            client_addr,
            client_helo,
            client_tls,
            sender,
            sender_params,
            timeouts,
        } = args;

        tracing::debug!(upstream = %upstream, "dialing upstream");
        let mut client = tokio::time::timeout(
            timeouts.connect_timeout,
            SmtpClient::new(upstream.server.as_str(), timeouts),
        )
        .await
        .map_err(|_| anyhow::anyhow!("timed out connecting to {upstream}"))?
        .with_context(|| format!("connect to {upstream}"))?;

        let banner = client
            .read_response(None, timeouts.connect_timeout)
            .await
            .with_context(|| format!("reading banner from {upstream}"))?;
        if banner.code != 220 {
            anyhow::bail!("unexpected banner from {upstream}: {}", banner.to_single_line());
        }

        client
            .ehlo(ehlo_name)
            .await
            .map_err(|err| anyhow::anyhow!("EHLO to {upstream} failed: {err:#}"))?;

        let mut tls_active = false;
        if client.has_capability("STARTTLS") && client_tls {
            match client
                .starttls(TlsOptions {
                    insecure: !upstream.tls_verify,
                })
                .await
                .map_err(|err| anyhow::anyhow!("STARTTLS to {upstream} failed: {err:#}"))?
            {
                TlsStatus::FailedHandshake(error) => {
                    anyhow::bail!("TLS handshake with {upstream} failed: {error}");
                }
                TlsStatus::Info(info) => {
                    tracing::debug!(
                        cipher = %info.cipher,
                        version = %info.protocol_version,
                        "upstream TLS established"
                    );
                    tls_active = true;
                }
            }

            // The handshake reset the SMTP session; greet again and
            // pick up the capabilities the upstream only shows to a
            // secured peer
            client
                .ehlo(ehlo_name)
                .await
                .map_err(|err| anyhow::anyhow!("EHLO to {upstream} after TLS failed: {err:#}"))?;
        }

        if client.has_capability("XCLIENT") {
            let name = dns::reverse_lookup(client_addr.ip())
                .await
                .unwrap_or_else(|| "[TEMPUNAVAIL]".to_string());
            let parameters = vec![
                XClientParameter {
                    name: "ADDR".to_string(),
                    value: xclient_addr(client_addr.ip()),
                },
                XClientParameter {
                    name: "HELO".to_string(),
                    value: client_helo.to_string(),
                },
                XClientParameter {
                    name: "NAME".to_string(),
                    value: name,
                },
            ];
            let resp = client
                .send_command(&Command::XClient(parameters))
                .await
                .map_err(|err| anyhow::anyhow!("XCLIENT to {upstream} failed: {err:#}"))?;
            if resp.code != 220 {
                anyhow::bail!("XCLIENT rejected by {upstream}: {}", resp.to_single_line());
            }
        }

        let resp = client
            .send_command(&Command::MailFrom {
                address: sender.clone(),
                parameters: sender_params.to_vec(),
            })
            .await?;
        if resp.code != 250 {
            return Err(ClientError::Rejected(resp).into());
        }

        Ok(Self {
            upstream,
            tls: tls_active,
            client,
        })
    }

    pub async fn rcpt(
        &mut self,
        address: &ForwardPath,
        parameters: &[EsmtpParameter],
    ) -> Result<Response, ClientError> {
        self.client
            .send_command(&Command::RcptTo {
                address: address.clone(),
                parameters: parameters.to_vec(),
            })
            .await
    }

    pub async fn start_data(&mut self) -> Result<Response, ClientError> {
        self.client.send_command(&Command::Data).await
    }

    /// Forward raw body bytes exactly as the client sent them; the
    /// client's own dot-stuffing and terminating dot line pass through
    /// untouched.
    pub async fn write_body(&mut self, data: &[u8]) -> Result<(), ClientError> {
        self.client.write_data(data).await
    }

    /// Read the upstream's verdict for the terminating dot.
    pub async fn finish_data(&mut self) -> Result<Response, ClientError> {
        let timeout = Command::DataDot.client_timeout(self.client.timeouts());
        self.client
            .read_response(Some(&Command::DataDot), timeout)
            .await
    }

    /// Polite teardown; a failed QUIT just drops the socket.
    pub async fn quit(mut self) {
        if let Err(err) = self.client.send_command(&Command::Quit).await {
            tracing::debug!("QUIT to {} failed: {err:#}", self.upstream);
        }
    }

    /// Hard close, for when the connection state is no longer coherent
    /// (mid-DATA abort, transport error).
    pub fn close(self) {}
}

fn xclient_addr(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("IPV6:{v6}"),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn xclient_address_form() {
        assert_eq!(xclient_addr("10.0.0.1".parse().unwrap()), "10.0.0.1");
        assert_eq!(xclient_addr("::1".parse().unwrap()), "IPV6:::1");
    }
}
