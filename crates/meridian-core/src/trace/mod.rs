//! Packet tracing
//!
//! Fixed-depth rings of sent and received frames with wrapping serial
//! numbers, plus a binary dump-file writer for post-mortem diagnostics.
//! Tracing is never load-bearing: logging is O(1), lock-bounded, and a
//! failed dump never aborts a command.

mod dump;
mod log;

pub use dump::{dump_next, write_dump, DumpHeader, DUMP_FILE_WRAP};
pub use log::{RecvRecord, SendRecord, TraceLog, RECV_TRACE_DEPTH, SEND_TRACE_DEPTH};
