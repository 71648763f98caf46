//! Single-threaded, non-blocking TCP reactor for accepting local SOCKS
//! clients and forwarding their raw byte streams.

pub mod tcp;
