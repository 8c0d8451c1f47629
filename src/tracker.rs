//! Last-requested blocking mode per socket.
//!
//! Winsock has no way to query whether a socket is non-blocking, so the
//! mode-setting calls are observed and remembered here. Entries are never
//! removed; a stale entry for a closed handle only matters if the handle
//! value is reused and then redirected before its mode is set again.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::hook::SocketHandle;

#[derive(Debug, Default)]
pub struct BlockingTracker {
    modes: Mutex<HashMap<SocketHandle, bool>>,
}

impl BlockingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the non-blocking flag the application asked for.
    pub fn record(&self, socket: SocketHandle, nonblocking: bool) {
        self.modes.lock().insert(socket, nonblocking);
    }

    /// Last requested non-blocking flag, `None` if the application never set one.
    pub fn last_requested(&self, socket: SocketHandle) -> Option<bool> {
        self.modes.lock().get(&socket).copied()
    }

    /// Whether the socket was last put into non-blocking mode.
    pub fn is_nonblocking(&self, socket: SocketHandle) -> bool {
        self.last_requested(socket).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.modes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
