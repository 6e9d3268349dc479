//! Decoding of the fixed-layout records the kernel side writes into the perf maps.
//!
//! All records are packed little-endian structs. L7 records are followed by a
//! variable-length payload.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use plain::Plain;

use super::event::{Event, EventReason, EventType, L7Request, Protocol};

/// Upper bound on the L7 payload kept per request.
pub const MAX_PAYLOAD_SIZE: usize = 1024;

/// Payloads carrying this signature are dropped; CUPS printers flood the L7 map
/// with IPP keep-alives.
const SUPPRESSED_PAYLOAD: &[u8] = b"CUPS/2.4.1";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{kind:?} record too short: got {len} bytes, need {need}")]
    TooShort {
        kind: RecordKind,
        len: usize,
        need: usize,
    },
    #[error("unknown event type {0} in {1:?} record")]
    UnknownEventType(u32, RecordKind),
}

/// Record shape of a perf map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Proc,
    Tcp,
    File,
    L7,
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
struct ProcRecord {
    kind: u32,
    pid: u32,
    reason: u32,
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
struct TcpRecord {
    fd: u64,
    timestamp: u64,
    kind: u32,
    pid: u32,
    sport: u16,
    dport: u16,
    saddr: [u8; 16],
    daddr: [u8; 16],
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
struct FileRecord {
    kind: u32,
    pid: u32,
    fd: u64,
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
struct L7Header {
    fd: u64,
    connection_timestamp: u64,
    pid: u32,
    status: u32,
    duration: u64,
    protocol: u8,
    method: u8,
    _padding: u16,
    statement_id: u32,
    payload_size: u64,
}

// SAFETY: all record structs are packed and consist of integers and byte arrays only,
// so every bit pattern is valid.
unsafe impl Plain for ProcRecord {}
unsafe impl Plain for TcpRecord {}
unsafe impl Plain for FileRecord {}
unsafe impl Plain for L7Header {}

fn read_record<T: Default + Plain>(kind: RecordKind, data: &[u8]) -> Result<T, DecodeError> {
    let mut record = T::default();
    plain::copy_from_bytes(&mut record, data).map_err(|_| DecodeError::TooShort {
        kind,
        len: data.len(),
        need: std::mem::size_of::<T>(),
    })?;
    Ok(record)
}

fn event_type(tag: u32, kind: RecordKind) -> Result<EventType, DecodeError> {
    EventType::try_from(tag).map_err(|tag| DecodeError::UnknownEventType(tag, kind))
}

fn socket_addr(addr: [u8; 16], port: u16) -> SocketAddr {
    let ip: IpAddr = Ipv6Addr::from(addr).to_canonical();
    SocketAddr::new(ip, port)
}

/// Decodes one raw record.
///
/// Returns `Ok(None)` for records that are valid but intentionally suppressed.
///
/// # Errors
///
/// Returns [`DecodeError`] if the record is shorter than its header or carries
/// an unknown type tag.
pub fn decode(kind: RecordKind, data: &[u8]) -> Result<Option<Event>, DecodeError> {
    let event = match kind {
        RecordKind::Proc => {
            let r: ProcRecord = read_record(kind, data)?;
            let mut event = Event::new(event_type(u32::from_le(r.kind), kind)?, u32::from_le(r.pid));
            event.reason = EventReason::from(u32::from_le(r.reason));
            event
        }
        RecordKind::Tcp => {
            let r: TcpRecord = read_record(kind, data)?;
            let mut event = Event::new(event_type(u32::from_le(r.kind), kind)?, u32::from_le(r.pid));
            event.fd = u64::from_le(r.fd);
            event.timestamp = u64::from_le(r.timestamp);
            event.src = Some(socket_addr(r.saddr, u16::from_le(r.sport)));
            event.dst = Some(socket_addr(r.daddr, u16::from_le(r.dport)));
            event
        }
        RecordKind::File => {
            let r: FileRecord = read_record(kind, data)?;
            let mut event = Event::new(event_type(u32::from_le(r.kind), kind)?, u32::from_le(r.pid));
            event.fd = u64::from_le(r.fd);
            event
        }
        RecordKind::L7 => return decode_l7(data),
    };
    Ok(Some(event))
}

fn decode_l7(data: &[u8]) -> Result<Option<Event>, DecodeError> {
    let header: L7Header = read_record(RecordKind::L7, data)?;
    let body = &data[std::mem::size_of::<L7Header>()..];

    let declared = usize::try_from(u64::from_le(header.payload_size)).unwrap_or(usize::MAX);
    let len = declared.min(MAX_PAYLOAD_SIZE).min(body.len());
    let payload = body[..len].to_vec();

    if contains(&payload, SUPPRESSED_PAYLOAD) {
        return Ok(None);
    }

    let mut event = Event::new(EventType::L7Request, u32::from_le(header.pid));
    event.fd = u64::from_le(header.fd);
    event.timestamp = u64::from_le(header.connection_timestamp);
    event.l7_request = Some(L7Request {
        protocol: Protocol::from(header.protocol),
        status: u32::from_le(header.status),
        duration: Duration::from_nanos(u64::from_le(header.duration)),
        method: header.method,
        statement_id: u32::from_le(header.statement_id),
        payload,
    });
    Ok(Some(event))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
