use crate::client_types::SmtpClientTimeouts;
use std::fmt;
use std::time::Duration;

/// An SMTP envelope mailbox, `local-part@domain`. The local part is
/// kept verbatim (it may be a quoted string and is case-sensitive);
/// the domain may be a name or a bracketed address literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub local_part: String,
    pub domain: String,
}

impl Mailbox {
    fn parse(text: &str) -> Result<Self, String> {
        // rsplit: a quoted local part may legally contain '@',
        // but the domain cannot
        let (local_part, domain) = text
            .rsplit_once('@')
            .ok_or_else(|| format!("expected user@domain: {text:?}"))?;
        if local_part.is_empty() || domain.is_empty() {
            return Err(format!("expected user@domain: {text:?}"));
        }
        Ok(Self {
            local_part: local_part.to_string(),
            domain: domain.to_string(),
        })
    }
}

impl fmt::Display for Mailbox {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}@{}", self.local_part, self.domain)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReversePath {
    NullSender,
    Mailbox(Mailbox),
}

impl TryFrom<&str> for ReversePath {
    type Error = String;
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        if s.is_empty() {
            Ok(Self::NullSender)
        } else {
            Ok(Self::Mailbox(Mailbox::parse(s)?))
        }
    }
}

impl fmt::Display for ReversePath {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NullSender => Ok(()),
            Self::Mailbox(mailbox) => mailbox.fmt(fmt),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardPath {
    Postmaster,
    Mailbox(Mailbox),
}

impl TryFrom<&str> for ForwardPath {
    type Error = String;
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        if s.is_empty() {
            Err("null path not permitted as a recipient".to_string())
        } else if s.eq_ignore_ascii_case("postmaster") {
            Ok(Self::Postmaster)
        } else {
            Ok(Self::Mailbox(Mailbox::parse(s)?))
        }
    }
}

impl fmt::Display for ForwardPath {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Postmaster => write!(fmt, "postmaster"),
            Self::Mailbox(mailbox) => mailbox.fmt(fmt),
        }
    }
}

/// An ESMTP `name` or `name=value` parameter, as found after the
/// path in MAIL FROM and RCPT TO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsmtpParameter {
    pub name: String,
    pub value: Option<String>,
}

impl fmt::Display for EsmtpParameter {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match &self.value {
            Some(value) => write!(fmt, "{}={}", self.name, value),
            None => write!(fmt, "{}", self.name),
        }
    }
}

/// An XCLIENT attribute; unlike ESMTP parameters the value is mandatory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XClientParameter {
    pub name: String,
    pub value: String,
}

impl fmt::Display for XClientParameter {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}={}", self.name, self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ehlo(String),
    Helo(String),
    MailFrom {
        address: ReversePath,
        parameters: Vec<EsmtpParameter>,
    },
    RcptTo {
        address: ForwardPath,
        parameters: Vec<EsmtpParameter>,
    },
    Data,
    DataDot,
    Rset,
    Quit,
    StartTls,
    XClient(Vec<XClientParameter>),
    Vrfy(String),
    Noop(Option<String>),
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, String> {
        fn prefix_match(line: &str, candidate: &str) -> bool {
            line.len() >= candidate.len() && line[..candidate.len()].eq_ignore_ascii_case(candidate)
        }

        fn parse_parameters(text: &str) -> Vec<EsmtpParameter> {
            text.split_whitespace()
                .map(|p| match p.split_once('=') {
                    Some((name, value)) => EsmtpParameter {
                        name: name.to_string(),
                        value: Some(value.to_string()),
                    },
                    None => EsmtpParameter {
                        name: p.to_string(),
                        value: None,
                    },
                })
                .collect()
        }

        // Returns (path, remainder, had_no_angle_brackets). The angle
        // bracket form is required once ESMTP parameters follow.
        fn extract_path(text: &str) -> Result<(&str, &str, bool), String> {
            let text = text.trim_start();
            if let Some(rest) = text.strip_prefix('<') {
                let rangle = rest
                    .find('>')
                    .ok_or_else(|| format!("expected >: {text:?}"))?;
                Ok((&rest[..rangle], &rest[rangle + 1..], false))
            } else {
                match text.split_once(' ') {
                    Some((path, rest)) => Ok((path, rest, true)),
                    None => Ok((text, "", true)),
                }
            }
        }

        Ok(if line.eq_ignore_ascii_case("QUIT") {
            Self::Quit
        } else if line.eq_ignore_ascii_case("DATA") {
            Self::Data
        } else if line.eq_ignore_ascii_case("RSET") {
            Self::Rset
        } else if line.eq_ignore_ascii_case("STARTTLS") {
            Self::StartTls
        } else if line.eq_ignore_ascii_case("NOOP") {
            Self::Noop(None)
        } else if prefix_match(line, "NOOP ") {
            Self::Noop(Some(line[5..].to_string()))
        } else if prefix_match(line, "EHLO ") {
            let domain = line[5..].trim();
            if domain.is_empty() {
                return Err("EHLO requires a domain".to_string());
            }
            Self::Ehlo(domain.to_string())
        } else if prefix_match(line, "HELO ") {
            let domain = line[5..].trim();
            if domain.is_empty() {
                return Err("HELO requires a domain".to_string());
            }
            Self::Helo(domain.to_string())
        } else if prefix_match(line, "MAIL FROM:") {
            let (path, rest, no_angles) = extract_path(&line[10..])?;
            let parameters = parse_parameters(rest);
            if no_angles && !parameters.is_empty() {
                return Err(
                    "must enclose address in <> if you want to use ESMTP parameters".to_string(),
                );
            }
            Self::MailFrom {
                address: ReversePath::try_from(path)?,
                parameters,
            }
        } else if prefix_match(line, "RCPT TO:") {
            let (path, rest, no_angles) = extract_path(&line[8..])?;
            let parameters = parse_parameters(rest);
            if no_angles && !parameters.is_empty() {
                return Err(
                    "must enclose address in <> if you want to use ESMTP parameters".to_string(),
                );
            }
            Self::RcptTo {
                address: ForwardPath::try_from(path)?,
                parameters,
            }
        } else if prefix_match(line, "VRFY ") {
            Self::Vrfy(line[5..].to_string())
        } else if prefix_match(line, "XCLIENT ") {
            let mut parameters = vec![];
            for p in line[8..].split_whitespace() {
                let (name, value) = p
                    .split_once('=')
                    .ok_or_else(|| format!("malformed XCLIENT attribute: {p:?}"))?;
                parameters.push(XClientParameter {
                    name: name.to_string(),
                    value: value.to_string(),
                });
            }
            if parameters.is_empty() {
                return Err("XCLIENT requires at least one attribute".to_string());
            }
            Self::XClient(parameters)
        } else {
            Self::Unknown(line.to_string())
        })
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Ehlo(domain) => format!("EHLO {domain}\r\n"),
            Self::Helo(domain) => format!("HELO {domain}\r\n"),
            Self::MailFrom {
                address,
                parameters,
            } => {
                let mut params = String::new();
                for p in parameters {
                    params.push(' ');
                    params.push_str(&p.to_string());
                }

                format!("MAIL FROM:<{address}>{params}\r\n")
            }
            Self::RcptTo {
                address,
                parameters,
            } => {
                let mut params = String::new();
                for p in parameters {
                    params.push(' ');
                    params.push_str(&p.to_string());
                }

                format!("RCPT TO:<{address}>{params}\r\n")
            }
            Self::Data => "DATA\r\n".to_string(),
            Self::DataDot => ".\r\n".to_string(),
            Self::Rset => "RSET\r\n".to_string(),
            Self::Quit => "QUIT\r\n".to_string(),
            Self::StartTls => "STARTTLS\r\n".to_string(),
            Self::XClient(parameters) => {
                let params: Vec<String> = parameters.iter().map(|p| p.to_string()).collect();
                format!("XCLIENT {}\r\n", params.join(" "))
            }
            Self::Vrfy(param) => format!("VRFY {param}\r\n"),
            Self::Noop(Some(param)) => format!("NOOP {param}\r\n"),
            Self::Noop(None) => "NOOP\r\n".to_string(),
            Self::Unknown(line) => format!("{line}\r\n"),
        }
    }

    /// Timeout for reading the response to this command
    pub fn client_timeout(&self, timeouts: &SmtpClientTimeouts) -> Duration {
        match self {
            Self::Helo(_) | Self::Ehlo(_) | Self::XClient(_) => timeouts.ehlo_timeout,
            Self::MailFrom { .. } => timeouts.mail_from_timeout,
            Self::RcptTo { .. } => timeouts.rcpt_to_timeout,
            Self::Data => timeouts.data_timeout,
            Self::DataDot => timeouts.data_dot_timeout,
            Self::Rset => timeouts.rset_timeout,
            Self::StartTls => timeouts.starttls_timeout,
            Self::Quit | Self::Vrfy(_) | Self::Noop(_) | Self::Unknown(_) => timeouts.idle_timeout,
        }
    }

    /// Timeout for writing the request itself
    pub fn client_timeout_request(&self, timeouts: &SmtpClientTimeouts) -> Duration {
        let one_minute = Duration::from_secs(60);
        self.client_timeout(timeouts).min(one_minute)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    fn mailbox(local: &str, domain: &str) -> Mailbox {
        Mailbox {
            local_part: local.to_string(),
            domain: domain.to_string(),
        }
    }

    #[test]
    fn parse_single_verbs() {
        assert_equal!(Command::parse("QUIT").unwrap(), Command::Quit);
        assert_equal!(Command::parse("quit").unwrap(), Command::Quit);
        assert_equal!(Command::parse("data").unwrap(), Command::Data);
        assert_equal!(Command::parse("rset").unwrap(), Command::Rset);
        assert_equal!(Command::parse("starttls").unwrap(), Command::StartTls);
        assert_equal!(
            Command::parse("quite").unwrap(),
            Command::Unknown("quite".to_string())
        );
        assert_equal!(
            Command::parse("flibble").unwrap(),
            Command::Unknown("flibble".to_string())
        );
    }

    #[test]
    fn parse_noop() {
        assert_equal!(Command::parse("noop").unwrap(), Command::Noop(None));
        assert_equal!(
            Command::parse("noop param").unwrap(),
            Command::Noop(Some("param".to_string()))
        );
    }

    #[test]
    fn parse_vrfy() {
        assert_equal!(
            Command::parse("VRFY someone").unwrap(),
            Command::Vrfy("someone".to_string())
        );
    }

    #[test]
    fn parse_ehlo() {
        assert_equal!(
            Command::parse("EHLO there").unwrap(),
            Command::Ehlo("there".to_string())
        );
        assert_equal!(
            Command::parse("EHLO [127.0.0.1]").unwrap(),
            Command::Ehlo("[127.0.0.1]".to_string())
        );
        assert!(Command::parse("EHLO ").is_err());
    }

    #[test]
    fn parse_mail_from() {
        assert_equal!(
            Command::parse("MAIL From:<>").unwrap(),
            Command::MailFrom {
                address: ReversePath::NullSender,
                parameters: vec![],
            }
        );
        assert_equal!(
            Command::parse("Mail FROM:<user@host>").unwrap(),
            Command::MailFrom {
                address: ReversePath::Mailbox(mailbox("user", "host")),
                parameters: vec![],
            }
        );
        assert_equal!(
            Command::parse("Mail FROM:user@host").unwrap(),
            Command::MailFrom {
                address: ReversePath::Mailbox(mailbox("user", "host")),
                parameters: vec![],
            }
        );
        assert_equal!(
            Command::parse("Mail FROM:<user@host> foo bar=baz").unwrap(),
            Command::MailFrom {
                address: ReversePath::Mailbox(mailbox("user", "host")),
                parameters: vec![
                    EsmtpParameter {
                        name: "foo".to_string(),
                        value: None,
                    },
                    EsmtpParameter {
                        name: "bar".to_string(),
                        value: Some("baz".to_string()),
                    }
                ],
            }
        );
        assert_equal!(
            Command::parse("Mail FROM:user@host foo bar=baz")
                .unwrap_err(),
            "must enclose address in <> if you want to use ESMTP parameters".to_string()
        );
        assert_equal!(
            Command::parse("mail from:<user@[10.0.0.1]>").unwrap(),
            Command::MailFrom {
                address: ReversePath::Mailbox(mailbox("user", "[10.0.0.1]")),
                parameters: vec![],
            }
        );
    }

    #[test]
    fn parse_rcpt_to() {
        assert_equal!(
            Command::parse("Rcpt To:<user@host>").unwrap(),
            Command::RcptTo {
                address: ForwardPath::Mailbox(mailbox("user", "host")),
                parameters: vec![],
            }
        );
        assert_equal!(
            Command::parse("Rcpt To:  user@host").unwrap(),
            Command::RcptTo {
                address: ForwardPath::Mailbox(mailbox("user", "host")),
                parameters: vec![],
            }
        );
        assert_equal!(
            Command::parse("Rcpt To:<\"asking for trouble\"@host.name>").unwrap(),
            Command::RcptTo {
                address: ForwardPath::Mailbox(mailbox("\"asking for trouble\"", "host.name")),
                parameters: vec![],
            }
        );
        assert_equal!(
            Command::parse("Rcpt To:<PostMastER>").unwrap(),
            Command::RcptTo {
                address: ForwardPath::Postmaster,
                parameters: vec![],
            }
        );
        assert_equal!(
            Command::parse("rcpt to:<>").unwrap_err(),
            "null path not permitted as a recipient".to_string()
        );
    }

    #[test]
    fn parse_xclient() {
        assert_equal!(
            Command::parse("XCLIENT ADDR=10.0.0.1 NAME=[TEMPUNAVAIL]").unwrap(),
            Command::XClient(vec![
                XClientParameter {
                    name: "ADDR".to_string(),
                    value: "10.0.0.1".to_string(),
                },
                XClientParameter {
                    name: "NAME".to_string(),
                    value: "[TEMPUNAVAIL]".to_string(),
                },
            ])
        );
        assert!(Command::parse("XCLIENT ADDR").is_err());
    }

    #[test]
    fn encode_commands() {
        assert_equal!(
            Command::MailFrom {
                address: ReversePath::try_from("a@x").unwrap(),
                parameters: vec![EsmtpParameter {
                    name: "BODY".to_string(),
                    value: Some("8BITMIME".to_string()),
                }],
            }
            .encode(),
            "MAIL FROM:<a@x> BODY=8BITMIME\r\n".to_string()
        );
        assert_equal!(
            Command::MailFrom {
                address: ReversePath::NullSender,
                parameters: vec![],
            }
            .encode(),
            "MAIL FROM:<>\r\n".to_string()
        );
        assert_equal!(
            Command::XClient(vec![
                XClientParameter {
                    name: "ADDR".to_string(),
                    value: "IPV6:::1".to_string(),
                },
                XClientParameter {
                    name: "HELO".to_string(),
                    value: "mua.example".to_string(),
                },
            ])
            .encode(),
            "XCLIENT ADDR=IPV6:::1 HELO=mua.example\r\n".to_string()
        );
        assert_equal!(Command::DataDot.encode(), ".\r\n".to_string());
    }

    #[test]
    fn roundtrip_paths() {
        assert_equal!(
            ReversePath::try_from("").unwrap().to_string(),
            "".to_string()
        );
        assert_equal!(
            ForwardPath::try_from("u@d.tld").unwrap().to_string(),
            "u@d.tld".to_string()
        );
        assert_equal!(
            ForwardPath::try_from("PostMaster").unwrap().to_string(),
            "postmaster".to_string()
        );
        assert!(ForwardPath::try_from("no-at-sign").is_err());
    }
}
