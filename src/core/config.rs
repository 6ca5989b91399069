//! Process-level transport configuration.

use std::fmt;
use std::str::FromStr;

use crate::core::constants::{DEFAULT_PORT_RANGE_HIGH, DEFAULT_PORT_RANGE_LOW};
use crate::core::error::NetworkError;

/// Which transports a session instantiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    /// Datagram transport only.
    UdpOnly,
    /// Stream transport only.
    TcpOnly,
    /// Both, with UDP preferred and TCP as fallback.
    #[default]
    PreferUdp,
}

impl FromStr for TransportMode {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "udp" => Ok(TransportMode::UdpOnly),
            "tcp" => Ok(TransportMode::TcpOnly),
            "prefer-udp" => Ok(TransportMode::PreferUdp),
            other => Err(NetworkError::InvalidConfig(format!(
                "unknown transport mode {other:?} (expected udp, tcp, or prefer-udp)"
            ))),
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::UdpOnly => write!(f, "udp"),
            TransportMode::TcpOnly => write!(f, "tcp"),
            TransportMode::PreferUdp => write!(f, "prefer-udp"),
        }
    }
}

/// An inclusive port range, parsed from `"port"` or `"low:high"`.
///
/// A single port of 0 asks the OS for an ephemeral port. Port 0 is not
/// permitted as the low end of a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    /// Low end, inclusive.
    pub low: u16,
    /// High end, inclusive.
    pub high: u16,
}

impl PortRange {
    /// A range containing exactly one port.
    pub fn single(port: u16) -> Self {
        PortRange {
            low: port,
            high: port,
        }
    }
}

impl Default for PortRange {
    fn default() -> Self {
        PortRange {
            low: DEFAULT_PORT_RANGE_LOW,
            high: DEFAULT_PORT_RANGE_HIGH,
        }
    }
}

impl FromStr for PortRange {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad_port =
            |part: &str| NetworkError::InvalidConfig(format!("invalid port number {part:?}"));

        match s.split_once(':') {
            None => {
                let port: u16 = s.parse().map_err(|_| bad_port(s))?;
                Ok(PortRange::single(port))
            }
            Some((low_str, high_str)) => {
                let low: u16 = low_str.parse().map_err(|_| bad_port(low_str))?;
                let high: u16 = high_str.parse().map_err(|_| bad_port(high_str))?;
                if low == 0 {
                    return Err(NetworkError::InvalidConfig(
                        "low port 0 incompatible with port ranges".to_string(),
                    ));
                }
                if low > high {
                    return Err(NetworkError::InvalidConfig(format!(
                        "low port {low} greater than high port {high}"
                    )));
                }
                Ok(PortRange { low, high })
            }
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.low == self.high {
            write!(f, "{}", self.low)
        } else {
            write!(f, "{}:{}", self.low, self.high)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_port() {
        let range: PortRange = "60001".parse().unwrap();
        assert_eq!(range, PortRange::single(60001));
    }

    #[test]
    fn test_parse_port_zero() {
        let range: PortRange = "0".parse().unwrap();
        assert_eq!(range, PortRange::single(0));
    }

    #[test]
    fn test_parse_range() {
        let range: PortRange = "60001:60999".parse().unwrap();
        assert_eq!(range.low, 60001);
        assert_eq!(range.high, 60999);
    }

    #[test]
    fn test_parse_inverted_range() {
        let result = "9000:8000".parse::<PortRange>();
        assert!(matches!(result, Err(NetworkError::InvalidConfig(_))));
    }

    #[test]
    fn test_parse_zero_low_range() {
        let result = "0:100".parse::<PortRange>();
        assert!(matches!(result, Err(NetworkError::InvalidConfig(_))));
    }

    #[test]
    fn test_parse_garbage() {
        assert!("porthole".parse::<PortRange>().is_err());
        assert!("60001:manyports".parse::<PortRange>().is_err());
        assert!("70000".parse::<PortRange>().is_err());
    }

    #[test]
    fn test_default_range() {
        let range = PortRange::default();
        assert_eq!(range.low, DEFAULT_PORT_RANGE_LOW);
        assert_eq!(range.high, DEFAULT_PORT_RANGE_HIGH);
    }

    #[test]
    fn test_transport_mode_parse() {
        assert_eq!("udp".parse::<TransportMode>().unwrap(), TransportMode::UdpOnly);
        assert_eq!("tcp".parse::<TransportMode>().unwrap(), TransportMode::TcpOnly);
        assert_eq!(
            "prefer-udp".parse::<TransportMode>().unwrap(),
            TransportMode::PreferUdp
        );
        assert!("quic".parse::<TransportMode>().is_err());
    }
}
