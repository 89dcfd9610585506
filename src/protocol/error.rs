//! Protocol error types

use std::fmt;

use crate::topic::TopicError;

/// Protocol-level errors raised while handling decoded packets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Topic name rejected by validation
    InvalidTopicName(TopicError),
    /// Topic filter rejected by validation
    InvalidTopicFilter(TopicError),
    /// QoS > 0 publish without a packet identifier
    MissingPacketId,
    /// Packet not valid in the current connection state
    UnexpectedPacket(&'static str),
    /// Protocol violation
    ProtocolViolation(&'static str),
    /// Keep alive timeout
    KeepAliveTimeout,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTopicName(e) => write!(f, "invalid topic name: {}", e),
            Self::InvalidTopicFilter(e) => write!(f, "invalid topic filter: {}", e),
            Self::MissingPacketId => write!(f, "missing packet identifier"),
            Self::UnexpectedPacket(name) => write!(f, "unexpected {} packet", name),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            Self::KeepAliveTimeout => write!(f, "keep alive timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
