use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use serde::Serialize;

/// Category of a kernel event; the stable integer tag is what the kernel side emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[repr(u32)]
pub enum EventType {
    ProcessStart = 1,
    ProcessExit = 2,
    ConnectionOpen = 3,
    ConnectionClose = 4,
    ConnectionError = 5,
    ListenOpen = 6,
    ListenClose = 7,
    FileOpen = 8,
    TcpRetransmit = 9,
    L7Request = 10,
}

impl EventType {
    pub const ALL: [EventType; 10] = [
        EventType::ProcessStart,
        EventType::ProcessExit,
        EventType::ConnectionOpen,
        EventType::ConnectionClose,
        EventType::ConnectionError,
        EventType::ListenOpen,
        EventType::ListenClose,
        EventType::FileOpen,
        EventType::TcpRetransmit,
        EventType::L7Request,
    ];
}

impl TryFrom<u32> for EventType {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        EventType::ALL
            .into_iter()
            .find(|t| *t as u32 == value)
            .ok_or(value)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EventReason {
    #[default]
    None,
    OomKill,
    Other(u32),
}

impl From<u32> for EventReason {
    fn from(value: u32) -> Self {
        match value {
            0 => EventReason::None,
            1 => EventReason::OomKill,
            v => EventReason::Other(v),
        }
    }
}

/// Application protocol of an L7 request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Http,
    Postgres,
    Redis,
    Memcached,
    Mysql,
    Mongo,
    Kafka,
    Cassandra,
    RabbitMq,
    Nats,
    Http2,
    Dns,
    Other(u8),
}

impl From<u8> for Protocol {
    fn from(value: u8) -> Self {
        match value {
            1 => Protocol::Http,
            2 => Protocol::Postgres,
            3 => Protocol::Redis,
            4 => Protocol::Memcached,
            5 => Protocol::Mysql,
            6 => Protocol::Mongo,
            7 => Protocol::Kafka,
            8 => Protocol::Cassandra,
            9 => Protocol::RabbitMq,
            10 => Protocol::Nats,
            11 => Protocol::Http2,
            12 => Protocol::Dns,
            v => Protocol::Other(v),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Http => "http",
            Protocol::Postgres => "postgres",
            Protocol::Redis => "redis",
            Protocol::Memcached => "memcached",
            Protocol::Mysql => "mysql",
            Protocol::Mongo => "mongo",
            Protocol::Kafka => "kafka",
            Protocol::Cassandra => "cassandra",
            Protocol::RabbitMq => "rabbitmq",
            Protocol::Nats => "nats",
            Protocol::Http2 => "http2",
            Protocol::Dns => "dns",
            Protocol::Other(v) => return write!(f, "unknown-{v}"),
        };
        f.write_str(name)
    }
}

impl Serialize for Protocol {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// An application-layer request reconstructed by the kernel side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L7Request {
    pub protocol: Protocol,
    /// HTTP status code, or 200/500 for protocols without one.
    pub status: u32,
    pub duration: Duration,
    pub method: u8,
    pub statement_id: u32,
    pub payload: Vec<u8>,
}

impl L7Request {
    pub fn is_failed(&self) -> bool {
        self.status >= 500
    }
}

/// A decoded kernel event. Fields that do not apply to `kind` stay at their zero value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventType,
    pub reason: EventReason,
    pub pid: u32,
    pub fd: u64,
    pub timestamp: u64,
    pub src: Option<SocketAddr>,
    pub dst: Option<SocketAddr>,
    pub l7_request: Option<L7Request>,
}

impl Event {
    pub fn new(kind: EventType, pid: u32) -> Self {
        Self {
            kind,
            reason: EventReason::None,
            pid,
            fd: 0,
            timestamp: 0,
            src: None,
            dst: None,
            l7_request: None,
        }
    }

    /// A synthetic process start, used to discover processes that predate the agent.
    pub fn process_start(pid: u32) -> Self {
        Self::new(EventType::ProcessStart, pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_tags_are_stable() {
        for (i, t) in EventType::ALL.iter().enumerate() {
            assert_eq!(*t as u32, i as u32 + 1);
            assert_eq!(EventType::try_from(i as u32 + 1), Ok(*t));
        }
        assert_eq!(EventType::try_from(0), Err(0));
        assert_eq!(EventType::try_from(11), Err(11));
    }

    #[test]
    fn unknown_protocol_is_kept() {
        assert_eq!(Protocol::from(1), Protocol::Http);
        assert_eq!(Protocol::from(12), Protocol::Dns);
        assert_eq!(Protocol::from(99), Protocol::Other(99));
        assert_eq!(Protocol::Other(99).to_string(), "unknown-99");
    }

    #[test]
    fn reason_from_tag() {
        assert_eq!(EventReason::from(0), EventReason::None);
        assert_eq!(EventReason::from(1), EventReason::OomKill);
        assert_eq!(EventReason::from(7), EventReason::Other(7));
    }
}
