//! Process signals for the command-line client.
//!
//! * Ctrl-C and SIGTERM close the realtime channel and exit
//! * SIGHUP pulls a fresh device-state snapshot
//!
//! On Windows only Ctrl-C is available.

use std::fmt;

use crate::error::Result;

#[cfg(unix)]
use tokio::signal::unix::{signal, Signal, SignalKind};

/// What a received signal asks the client to do.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Request {
    /// Ctrl-C or SIGTERM.
    Shutdown(&'static str),

    /// SIGHUP.
    Refresh,
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown(signal) => write!(f, "shutdown ({signal})"),
            Self::Refresh => write!(f, "refresh (SIGHUP)"),
        }
    }
}

pub struct Handler {
    #[cfg(unix)]
    sigterm: Signal,
    #[cfg(unix)]
    sighup: Signal,
}

impl Handler {
    /// Registers the signal listeners.
    ///
    /// # Errors
    ///
    /// Returns error if a listener cannot be registered.
    pub fn new() -> Result<Self> {
        #[cfg(unix)]
        {
            Ok(Self {
                sigterm: signal(SignalKind::terminate())?,
                sighup: signal(SignalKind::hangup())?,
            })
        }

        #[cfg(not(unix))]
        Ok(Self {})
    }

    /// Waits for the next signal.
    pub async fn recv(&mut self) -> Request {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => Request::Shutdown("Ctrl+C"),
                _ = self.sigterm.recv() => Request::Shutdown("SIGTERM"),
                _ = self.sighup.recv() => Request::Refresh,
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            Request::Shutdown("Ctrl+C")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_name_their_signal() {
        assert_eq!(Request::Shutdown("SIGTERM").to_string(), "shutdown (SIGTERM)");
        assert_eq!(Request::Refresh.to_string(), "refresh (SIGHUP)");
    }
}
