//! Host capabilities handed to every component that needs them.
//!
//! A [`Platform`] bundles console output, text codecs, a clock and the
//! default wait timeout. It is built once and shared through an `Arc`; there
//! is no process-wide instance.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::abi::Trap;
use crate::logging::{debug, error, info, warn};

/// Default timeout for a blocking worker-to-main call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Severity of a console message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Sink for messages emitted by the runtime and by modules through imports.
pub trait Console: Send + Sync {
    fn log(&self, level: ConsoleLevel, message: &str);
}

/// Console forwarding to the crate's tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingConsole;

impl Console for TracingConsole {
    fn log(&self, level: ConsoleLevel, message: &str) {
        match level {
            ConsoleLevel::Debug => {
                debug!(target: "wit_bridge::console", "{}", message);
            }
            ConsoleLevel::Info => {
                info!(target: "wit_bridge::console", "{}", message);
            }
            ConsoleLevel::Warn => {
                warn!(target: "wit_bridge::console", "{}", message);
            }
            ConsoleLevel::Error => {
                error!(target: "wit_bridge::console", "{}", message);
            }
        }
        #[cfg(not(feature = "logging"))]
        let _ = message;
    }
}

/// Host capability object.
#[derive(Clone)]
pub struct Platform {
    console: Arc<dyn Console>,
    default_timeout: Duration,
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform")
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::new(Arc::new(TracingConsole))
    }
}

impl Platform {
    pub fn new(console: Arc<dyn Console>) -> Self {
        Self {
            console,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Replace the timeout used for blocking calls into the main side.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn console(&self) -> &dyn Console {
        self.console.as_ref()
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn now(&self) -> Instant {
        Instant::now()
    }

    pub fn encode_utf8(&self, text: &str) -> Vec<u8> {
        text.as_bytes().to_vec()
    }

    pub fn decode_utf8(&self, bytes: Vec<u8>) -> Result<String, Trap> {
        String::from_utf8(bytes).map_err(|_| Trap::InvalidUtf8)
    }

    pub fn encode_utf16(&self, text: &str) -> Vec<u16> {
        text.encode_utf16().collect()
    }

    pub fn decode_utf16(&self, units: &[u16]) -> Result<String, Trap> {
        String::from_utf16(units).map_err(|_| Trap::InvalidUtf16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording(Mutex<Vec<(ConsoleLevel, String)>>);

    impl Console for Recording {
        fn log(&self, level: ConsoleLevel, message: &str) {
            self.0.lock().push((level, message.to_string()));
        }
    }

    #[test]
    fn test_custom_console() {
        let console = Arc::new(Recording::default());
        let platform = Platform::new(console.clone()).with_timeout(Duration::from_millis(5));
        platform.console().log(ConsoleLevel::Warn, "careful");
        assert_eq!(platform.default_timeout(), Duration::from_millis(5));
        assert_eq!(console.0.lock().as_slice(), &[(ConsoleLevel::Warn, "careful".to_string())]);
    }

    #[test]
    fn test_text_codecs() {
        let platform = Platform::default();
        let units = platform.encode_utf16("héllo");
        assert_eq!(platform.decode_utf16(&units).unwrap(), "héllo");
        assert!(platform.decode_utf8(vec![0xff, 0xfe]).is_err());
        assert!(platform.decode_utf16(&[0xD800]).is_err());
    }
}
