use std::fmt;

/// Transport family of a connection description.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum TransportKind {
    Tcp,
    Pipe,
    Rdma,
    Multicast,
}

impl TransportKind {
    /// Multicast transports never carry primary (unicast) traffic.
    pub fn is_multicast(self) -> bool {
        matches!(self, TransportKind::Multicast)
    }

    fn as_str(self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Pipe => "pipe",
            TransportKind::Rdma => "rdma",
            TransportKind::Multicast => "mcast",
        }
    }

    fn parse(token: &str) -> Option<TransportKind> {
        match token {
            "tcp" => Some(TransportKind::Tcp),
            "pipe" => Some(TransportKind::Pipe),
            "rdma" => Some(TransportKind::Rdma),
            "mcast" => Some(TransportKind::Multicast),
            _ => None,
        }
    }
}

/// How to reach one endpoint: colon-delimited text form
/// `kind:host[:port[:extras]]`.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct ConnectionDescription {
    pub kind: TransportKind,
    pub hostname: String,
    pub port: u16,
    pub extras: String,
}

impl ConnectionDescription {
    pub fn new(kind: TransportKind, hostname: impl Into<String>, port: u16) -> Self {
        Self {
            kind,
            hostname: hostname.into(),
            port,
            extras: String::new(),
        }
    }

    /// Parse the text form, filling a missing port with `default_port`.
    pub fn from_str_with_port(text: &str, default_port: u16) -> Option<Self> {
        let mut parts = text.splitn(4, ':');
        let kind = TransportKind::parse(parts.next()?)?;
        let hostname = parts.next()?.to_string();
        if hostname.is_empty() {
            return None;
        }
        let port = match parts.next() {
            Some(raw) if !raw.is_empty() => raw.parse().ok()?,
            _ => default_port,
        };
        let extras = parts.next().unwrap_or("").to_string();
        Some(Self {
            kind,
            hostname,
            port,
            extras,
        })
    }

    /// Two descriptions name the same multicast group when kind, host and
    /// port all match.
    pub fn is_same_multicast_group(&self, other: &ConnectionDescription) -> bool {
        self.kind.is_multicast()
            && self.kind == other.kind
            && self.hostname == other.hostname
            && self.port == other.port
    }
}

impl fmt::Display for ConnectionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind.as_str(), self.hostname, self.port)?;
        if !self.extras.is_empty() {
            write!(f, ":{}", self.extras)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_form() {
        let desc = ConnectionDescription::from_str_with_port("tcp:render1:7777", 4242).unwrap();
        assert_eq!(desc.kind, TransportKind::Tcp);
        assert_eq!(desc.hostname, "render1");
        assert_eq!(desc.port, 7777);
        assert!(desc.extras.is_empty());
    }

    #[test]
    fn parse_defaults_port() {
        let desc = ConnectionDescription::from_str_with_port("pipe:local", 4242).unwrap();
        assert_eq!(desc.port, 4242);
    }

    #[test]
    fn parse_extras() {
        let desc =
            ConnectionDescription::from_str_with_port("mcast:239.255.42.42:4242:ttl=4", 0).unwrap();
        assert_eq!(desc.kind, TransportKind::Multicast);
        assert_eq!(desc.extras, "ttl=4");
    }

    #[test]
    fn reject_garbage() {
        assert!(ConnectionDescription::from_str_with_port("warp:somewhere", 1).is_none());
        assert!(ConnectionDescription::from_str_with_port("tcp", 1).is_none());
        assert!(ConnectionDescription::from_str_with_port("tcp::1", 1).is_none());
        assert!(ConnectionDescription::from_str_with_port("tcp:host:notaport", 1).is_none());
    }

    #[test]
    fn display_round_trip() {
        let desc = ConnectionDescription::from_str_with_port("mcast:239.1.2.3:5555", 0).unwrap();
        let text = desc.to_string();
        let again = ConnectionDescription::from_str_with_port(&text, 0).unwrap();
        assert_eq!(desc, again);
    }

    #[test]
    fn multicast_group_equality() {
        let a = ConnectionDescription::from_str_with_port("mcast:239.1.2.3:5555", 0).unwrap();
        let b = ConnectionDescription::from_str_with_port("mcast:239.1.2.3:5555:x", 0).unwrap();
        let c = ConnectionDescription::from_str_with_port("mcast:239.9.9.9:5555", 0).unwrap();
        let t = ConnectionDescription::from_str_with_port("tcp:239.1.2.3:5555", 0).unwrap();
        assert!(a.is_same_multicast_group(&b));
        assert!(!a.is_same_multicast_group(&c));
        assert!(!t.is_same_multicast_group(&a));
    }
}
