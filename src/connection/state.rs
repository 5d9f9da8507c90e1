use crate::error::ConnectionError;

/// Connected/suspended flags shared by both leaves.
#[derive(Debug, Default)]
pub(crate) struct ConnectionState {
    connected: bool,
    suspended: bool,
}

impl ConnectionState {
    pub fn mark_connected(&mut self) {
        self.connected = true;
        self.suspended = false;
    }

    pub fn mark_disconnected(&mut self) {
        self.connected = false;
        self.suspended = false;
    }

    pub fn suspend(&mut self) {
        self.suspended = true;
    }

    pub fn restore(&mut self) {
        self.suspended = false;
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Commands may only run while connected and not suspended.
    pub fn ensure_ready(&self) -> Result<(), ConnectionError> {
        if !self.connected || self.suspended {
            return Err(ConnectionError::NotConnected);
        }
        Ok(())
    }
}
