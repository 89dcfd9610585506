//! MQTT protocol types shared by the broker core
//!
//! These are the decoded control packets the core consumes and produces.
//! Byte-level encoding lives in the transport that embeds the broker.

mod error;
mod packet;
mod return_code;

pub use error::ProtocolError;
pub use packet::*;
pub use return_code::{ConnectReturnCode, SubAckReturnCode};

use std::fmt;

/// Protocol level from CONNECT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtocolVersion {
    V31 = 3,
    V311 = 4,
}

impl ProtocolVersion {
    pub fn from_u8(level: u8) -> Option<Self> {
        [Self::V31, Self::V311]
            .into_iter()
            .find(|v| *v as u8 == level)
    }

    /// CONNACK carries session-present only from 3.1.1 on
    pub fn supports_session_present(self) -> bool {
        self == Self::V311
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::V31 => "3.1",
            Self::V311 => "3.1.1",
        })
    }
}

/// Delivery guarantee. Ordered, so `a.min(b)` is the effective QoS of a
/// message published at `a` to a subscription granted `b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(level: u8) -> Option<Self> {
        [Self::AtMostOnce, Self::AtLeastOnce, Self::ExactlyOnce]
            .into_iter()
            .find(|q| *q as u8 == level)
    }

    /// Whether delivery needs a packet id and an acknowledgement
    pub fn is_acknowledged(self) -> bool {
        self != Self::AtMostOnce
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0, 0 => QoS::AtMostOnce)]
    #[test_case(0, 2 => QoS::AtMostOnce)]
    #[test_case(1, 2 => QoS::AtLeastOnce)]
    #[test_case(2, 1 => QoS::AtLeastOnce)]
    #[test_case(2, 2 => QoS::ExactlyOnce)]
    fn qos_min(a: u8, b: u8) -> QoS {
        QoS::from_u8(a).unwrap().min(QoS::from_u8(b).unwrap())
    }

    #[test]
    fn protocol_levels() {
        assert_eq!(ProtocolVersion::from_u8(3), Some(ProtocolVersion::V31));
        assert_eq!(ProtocolVersion::from_u8(4), Some(ProtocolVersion::V311));
        assert_eq!(ProtocolVersion::from_u8(5), None);
        assert!(!ProtocolVersion::V31.supports_session_present());
        assert!(ProtocolVersion::V311.supports_session_present());
        assert_eq!(QoS::from_u8(3), None);
        assert_eq!(ProtocolVersion::V31.to_string(), "3.1");
    }

    #[test_case(QoS::AtMostOnce => false)]
    #[test_case(QoS::AtLeastOnce => true)]
    #[test_case(QoS::ExactlyOnce => true)]
    fn qos_acknowledged(qos: QoS) -> bool {
        qos.is_acknowledged()
    }
}
