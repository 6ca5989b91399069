//! Protocol constants.
//!
//! These values are load-bearing for interoperability between peers and
//! MUST NOT be changed.

// =============================================================================
// WIRE FORMAT
// =============================================================================

/// Protocol version carried in every serialized Instruction.
pub const PROTOCOL_VERSION: u8 = 2;

/// Bytes the packet layer adds to each datagram: 8-byte nonce tail plus
/// two 16-bit timestamps.
pub const PACKET_ADDED_BYTES: usize = 8 + 4;

/// Bytes the authenticated session adds to each plaintext (Poly1305 tag).
pub const SESSION_ADDED_BYTES: usize = 16;

/// Timestamp sentinel meaning "no timestamp".
pub const TIMESTAMP_NONE: u16 = 0xFFFF;

/// Largest datagram the receive path will accept.
pub const RECEIVE_MTU: usize = 2048;

// =============================================================================
// CRYPTO
// =============================================================================

/// ChaCha20-Poly1305 key size.
pub const KEY_SIZE: usize = 32;

/// AEAD nonce size (4 zero bytes + 8-byte direction_seq).
pub const AEAD_NONCE_SIZE: usize = 12;

/// Portion of the nonce that travels on the wire.
pub const NONCE_TAIL_SIZE: usize = 8;

// =============================================================================
// MTU
// =============================================================================

/// Application datagram MTU of last resort (also the pre-bind default).
pub const DEFAULT_SEND_MTU: usize = 500;

/// IPv4 MTU. Mobile networks have high tunneling overhead, so this stays
/// well below Ethernet-derived values.
pub const DEFAULT_IPV4_MTU: usize = 1280;

/// IPv6 MTU. The guaranteed minimum, to avoid fragmentation.
pub const DEFAULT_IPV6_MTU: usize = 1280;

/// Typical (minimum) IPv4 + UDP header length. Fragmentation below this
/// guess is not dangerous, just inefficient.
pub const IPV4_HEADER_LEN: usize = 20 + 8;

/// Conservative IPv6 + UDP header guess: base header, two minimum-sized
/// extension headers, UDP.
pub const IPV6_HEADER_LEN: usize = 40 + 16 + 8;

// =============================================================================
// TIMING
// =============================================================================

/// Minimum retransmission timeout in milliseconds.
pub const MIN_RTO_MS: u64 = 50;

/// Maximum retransmission timeout in milliseconds.
pub const MAX_RTO_MS: u64 = 1000;

/// Alpha for SRTT smoothing (1/8, RFC 6298).
pub const SRTT_ALPHA: f64 = 0.125;

/// Beta for RTTVAR smoothing (1/4, RFC 6298).
pub const RTTVAR_BETA: f64 = 0.25;

/// RTT samples at or above this are discarded (e.g. peer was stopped).
pub const RTT_SAMPLE_CEILING_MS: f64 = 5000.0;

/// A saved peer timestamp older than this is not echoed.
pub const TIMESTAMP_REPLY_HOLD_MS: u64 = 1000;

/// Penalty subtracted from the echoed timestamp when a datagram arrives
/// with congestion-experienced ECN marks.
pub const CONGESTION_TIMESTAMP_PENALTY_MS: u16 = 500;

// =============================================================================
// UDP BEHAVIOR
// =============================================================================

/// A server that has not heard from its client for this long detaches.
pub const SERVER_ASSOCIATION_TIMEOUT_MS: u64 = 40_000;

/// Minimum interval between client port hops.
pub const PORT_HOP_INTERVAL_MS: u64 = 10_000;

/// Maximum number of receive sockets kept open at once.
pub const MAX_PORTS_OPEN: usize = 10;

/// Sockets older than this are pruned once a newer one is in service.
pub const MAX_OLD_SOCKET_AGE_MS: u64 = 60_000;

/// Default low end of the server bind search range.
pub const DEFAULT_PORT_RANGE_LOW: u16 = 60001;

/// Default high end of the server bind search range.
pub const DEFAULT_PORT_RANGE_HIGH: u16 = 60999;

// =============================================================================
// TCP
// =============================================================================

/// Listen backlog for the server-side stream socket.
pub const TCP_LISTEN_BACKLOG: i32 = 16;

// =============================================================================
// COMBINED SUPERVISOR
// =============================================================================

/// UDP is re-probed after this long without a UDP send.
pub const UDP_PROBE_TIMEOUT_MS: u64 = 10_000;
