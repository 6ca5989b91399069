//! # roamlink
//!
//! Roaming datagram + stream transport for mobile terminal sessions.
//!
//! roamlink carries serialized [`Instruction`] payloads between a client and
//! a server over UDP (primary) or TCP (fallback), and keeps the session
//! alive across the network conditions mobile clients actually see:
//!
//! - **Security**: every message is sealed with ChaCha20-Poly1305 under a
//!   shared key agreed out of band; nonces encode direction and a monotone
//!   sequence, so reflected or replayed traffic cannot disturb timing state
//! - **Mobility**: the server adopts a roaming client's new source address
//!   on the first authenticated packet from it
//! - **Middlebox survival**: the client hops to a fresh UDP source port
//!   when round trips stop succeeding, defeating NAT idle timeouts
//! - **Failover**: a combined supervisor probes UDP and TCP liveness per
//!   send and switches the active channel on successful receive
//! - **Congestion awareness**: ECN marks on received datagrams feed a
//!   timestamp penalty that slows the counterparty down
//!
//! All I/O is non-blocking. Transports expose their file descriptors and an
//! RTO-derived timeout so a single-threaded caller can multiplex them in
//! its own event loop; no operation blocks and no background threads are
//! spawned.
//!
//! ## Modules
//!
//! - [`core`]: errors, constants, configuration, and the Instruction unit
//! - [`crypto`]: authenticated session and nonce construction
//! - [`transport`]: UDP, TCP, and combined transports behind the
//!   [`Transport`] trait

#![warn(missing_docs)]

pub mod core;
pub mod crypto;
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::*;
    pub use crate::crypto::*;
    pub use crate::transport::*;
}

pub use self::core::{Instruction, NetworkError, NetworkResult, PortRange, TransportMode};
pub use self::crypto::{Base64Key, Direction, Session};
pub use self::transport::{
    client_transport, server_transport, CombinedTransport, Report, ReportFn, TcpTransport,
    Transport, UdpTransport,
};
