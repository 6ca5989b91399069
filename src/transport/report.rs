//! Observer callback invoked on transport send and receive events.

use std::sync::Arc;

use crate::core::Instruction;
use crate::transport::fragment::Fragment;

/// One observable transport event.
///
/// Delivered synchronously on the caller's thread. Timing fields snapshot
/// the reporting transport's state at the moment of the event.
#[derive(Debug, Clone)]
pub enum Report {
    /// One fragment of an Instruction left on the datagram path.
    UdpSend {
        /// The Instruction being sent.
        inst: Instruction,
        /// The fragment that was emitted.
        fragment: Fragment,
        /// Transport RTO at send time, milliseconds.
        timeout: u64,
        /// Transport SRTT at send time, milliseconds.
        srtt: f64,
    },
    /// A full Instruction was assembled on the datagram path.
    UdpRecv {
        /// The received Instruction.
        inst: Instruction,
    },
    /// A framed Instruction left on the stream path.
    TcpSend {
        /// The Instruction being sent.
        inst: Instruction,
        /// Bytes accepted by the kernel in the initial write.
        sent_len: u32,
        /// Total frame length including the length prefix.
        msg_len: u32,
        /// Transport RTO at send time, milliseconds.
        timeout: u64,
        /// Transport SRTT at send time, milliseconds.
        srtt: f64,
    },
    /// A framed Instruction arrived on the stream path.
    TcpRecv {
        /// The received Instruction.
        inst: Instruction,
    },
    /// The stream path dropped an Instruction it could not emit.
    SendDropped {
        /// The Instruction that was dropped.
        inst: Instruction,
        /// Transport RTO at drop time, milliseconds.
        timeout: u64,
        /// Transport SRTT at drop time, milliseconds.
        srtt: f64,
    },
}

/// Shared observer installed via `set_report_function`.
///
/// The combined transport hands one clone to each child.
pub type ReportFn = Arc<dyn Fn(&Report) + Send + Sync>;
