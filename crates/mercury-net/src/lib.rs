//! mercury-net — the transport half of Mercury: UDP socket ownership, the
//! send path with its footer packing, the receive pipeline, and the timers
//! behind once-off reliability, request timeouts, and condemned-channel
//! teardown. Framing itself lives in mercury-core.

pub mod channel;
pub mod condemned;
pub mod config;
pub mod interface;
pub mod once_off;
pub mod receive;
pub mod request;

pub use channel::{Channel, ChannelTraits, UnackedPacket};
pub use condemned::CondemnedChannels;
pub use config::{ConfigError, MercuryConfig};
pub use interface::{InterfaceStats, NetworkInterface};
pub use once_off::{FragmentedBundle, OnceOffReceiver, OnceOffSender};
pub use request::RequestManager;

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
