//! CONNACK and SUBACK return codes (MQTT v3.1 / v3.1.1)

use std::fmt;

use super::QoS;

/// CONNACK return code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ConnectReturnCode {
    #[default]
    Accepted = 0x00,
    UnacceptableProtocolVersion = 0x01,
    IdentifierRejected = 0x02,
    ServerUnavailable = 0x03,
    BadUsernameOrPassword = 0x04,
    NotAuthorized = 0x05,
}

impl ConnectReturnCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(Self::Accepted),
            0x01 => Some(Self::UnacceptableProtocolVersion),
            0x02 => Some(Self::IdentifierRejected),
            0x03 => Some(Self::ServerUnavailable),
            0x04 => Some(Self::BadUsernameOrPassword),
            0x05 => Some(Self::NotAuthorized),
            _ => None,
        }
    }

    pub fn is_accepted(self) -> bool {
        self == Self::Accepted
    }
}

impl fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Accepted => "connection accepted",
            Self::UnacceptableProtocolVersion => "unacceptable protocol version",
            Self::IdentifierRejected => "identifier rejected",
            Self::ServerUnavailable => "server unavailable",
            Self::BadUsernameOrPassword => "bad user name or password",
            Self::NotAuthorized => "not authorized",
        };
        f.write_str(s)
    }
}

/// Per-filter SUBACK return code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubAckReturnCode {
    /// Subscription accepted with the granted QoS
    Success(QoS),
    /// Subscription refused (0x80)
    Failure,
}

impl SubAckReturnCode {
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Success(qos) => qos as u8,
            Self::Failure => 0x80,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x80 => Some(Self::Failure),
            v => QoS::from_u8(v).map(Self::Success),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connack_codes() {
        for v in 0u8..=5 {
            let code = ConnectReturnCode::from_u8(v).unwrap();
            assert_eq!(code as u8, v);
        }
        assert_eq!(ConnectReturnCode::from_u8(6), None);
        assert!(ConnectReturnCode::Accepted.is_accepted());
        assert!(!ConnectReturnCode::NotAuthorized.is_accepted());
    }

    #[test]
    fn suback_codes() {
        assert_eq!(SubAckReturnCode::Failure.to_u8(), 0x80);
        assert_eq!(
            SubAckReturnCode::from_u8(1),
            Some(SubAckReturnCode::Success(QoS::AtLeastOnce))
        );
        assert_eq!(SubAckReturnCode::from_u8(3), None);
    }
}
