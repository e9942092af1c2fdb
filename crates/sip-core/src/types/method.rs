//! SIP request methods

use std::fmt;
use std::str::FromStr;

/// SIP request method (RFC 3261 plus the extension methods voxide handles)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Info,
    Register,
    Refer,
    Notify,
    Options,
    /// Any other method, preserved verbatim
    Other(String),
}

impl Method {
    /// Canonical on-wire spelling
    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Info => "INFO",
            Method::Register => "REGISTER",
            Method::Refer => "REFER",
            Method::Notify => "NOTIFY",
            Method::Options => "OPTIONS",
            Method::Other(s) => s.as_str(),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "INFO" => Method::Info,
            "REGISTER" => Method::Register,
            "REFER" => Method::Refer,
            "NOTIFY" => Method::Notify,
            "OPTIONS" => Method::Options,
            other => Method::Other(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_known_methods() {
        for name in ["INVITE", "ACK", "BYE", "CANCEL", "REFER", "NOTIFY"] {
            let m: Method = name.parse().unwrap();
            assert_eq!(m.as_str(), name);
        }
    }

    #[test]
    fn preserves_unknown_methods() {
        let m: Method = "PUBLISH".parse().unwrap();
        assert_eq!(m, Method::Other("PUBLISH".into()));
        assert_eq!(m.as_str(), "PUBLISH");
    }
}
