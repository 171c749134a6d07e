//! Real-time safe debug logging for StageVox.
//!
//! `sv_log!` formats into a fixed-size entry and pushes it onto a lock-free ring;
//! nothing allocates or blocks on the audio thread. The control thread drains the
//! ring into the `log` facade. Without the `debug` feature the macro compiles to nothing.

use std::fmt;

#[cfg(feature = "debug")]
pub mod logger {
    use std::cell::UnsafeCell;
    use std::fmt;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::OnceLock;

    const LOG_CAP: usize = 128;
    const LOG_MSG_MAX: usize = 256;

    #[derive(Copy, Clone)]
    struct LogEntry {
        len: u16,
        bytes: [u8; LOG_MSG_MAX],
    }

    impl Default for LogEntry {
        fn default() -> Self {
            Self {
                len: 0,
                bytes: [0; LOG_MSG_MAX],
            }
        }
    }

    struct LogRing {
        head: AtomicUsize,
        tail: AtomicUsize,
        buf: Box<[UnsafeCell<LogEntry>]>,
    }

    // Single producer (audio thread) and single consumer (control thread).
    unsafe impl Sync for LogRing {}

    impl LogRing {
        fn new() -> Self {
            let buf = (0..LOG_CAP)
                .map(|_| UnsafeCell::new(LogEntry::default()))
                .collect::<Vec<_>>()
                .into_boxed_slice();
            Self {
                head: AtomicUsize::new(0),
                tail: AtomicUsize::new(0),
                buf,
            }
        }

        fn push(&self, entry: LogEntry) {
            let cap = self.buf.len();
            let head = self.head.load(Ordering::Relaxed);
            let next = (head + 1) % cap;
            if next == self.tail.load(Ordering::Acquire) {
                // full, drop the message
                return;
            }
            unsafe {
                *self.buf[head].get() = entry;
            }
            self.head.store(next, Ordering::Release);
        }

        fn pop(&self) -> Option<LogEntry> {
            let cap = self.buf.len();
            let tail = self.tail.load(Ordering::Relaxed);
            if tail == self.head.load(Ordering::Acquire) {
                return None;
            }
            let entry = unsafe { *self.buf[tail].get() };
            self.tail.store((tail + 1) % cap, Ordering::Release);
            Some(entry)
        }
    }

    static LOGGER: OnceLock<LogRing> = OnceLock::new();
    static LOG_ENABLED: AtomicBool = AtomicBool::new(false);

    /// Allocate the ring. Call from `initialize`, never from `process`.
    pub fn init_logger() {
        let _ = LOGGER.get_or_init(LogRing::new);
        LOG_ENABLED.store(true, Ordering::Relaxed);
    }

    struct FixedBuf {
        entry: LogEntry,
        len: usize,
    }

    impl fmt::Write for FixedBuf {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            let avail = LOG_MSG_MAX - self.len;
            let bytes = s.as_bytes();
            let n = bytes.len().min(avail);
            self.entry.bytes[self.len..self.len + n].copy_from_slice(&bytes[..n]);
            self.len += n;
            Ok(())
        }
    }

    pub fn log_args(args: fmt::Arguments) {
        if !LOG_ENABLED.load(Ordering::Relaxed) {
            return;
        }
        let Some(ring) = LOGGER.get() else {
            return;
        };
        let mut buf = FixedBuf {
            entry: LogEntry::default(),
            len: 0,
        };
        let _ = fmt::write(&mut buf, args);
        buf.entry.len = buf.len as u16;
        ring.push(buf.entry);
    }

    /// Forward queued messages to the `log` facade. Control thread only.
    pub fn drain_to_log() -> usize {
        let Some(ring) = LOGGER.get() else {
            return 0;
        };
        let mut drained = 0;
        while let Some(entry) = ring.pop() {
            let len = entry.len as usize;
            if len == 0 {
                continue;
            }
            // Truncation may split a UTF-8 sequence; keep the valid prefix.
            let text = match std::str::from_utf8(&entry.bytes[..len]) {
                Ok(s) => s,
                Err(e) => std::str::from_utf8(&entry.bytes[..e.valid_up_to()]).unwrap_or(""),
            };
            log::debug!(target: "stagevox::audio", "{text}");
            drained += 1;
        }
        drained
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn messages_round_trip_through_the_ring() {
            init_logger();
            while LOGGER.get().and_then(LogRing::pop).is_some() {}
            log_args(format_args!("block {} took {}us", 7, 120));
            let ring = LOGGER.get().unwrap();
            let entry = ring.pop().unwrap();
            assert_eq!(
                std::str::from_utf8(&entry.bytes[..entry.len as usize]).unwrap(),
                "block 7 took 120us"
            );
        }
    }
}

#[cfg(feature = "debug")]
#[doc(hidden)]
pub fn sv_log_inner(args: fmt::Arguments) {
    logger::log_args(args);
}

#[cfg(not(feature = "debug"))]
#[doc(hidden)]
pub fn sv_log_inner(_args: fmt::Arguments) {}

/// Drain audio-thread messages into `log`. No-op without the `debug` feature.
pub fn drain() {
    #[cfg(feature = "debug")]
    logger::drain_to_log();
}

#[macro_export]
macro_rules! sv_log {
    ($($arg:tt)*) => {
        $crate::debug::sv_log_inner(format_args!($($arg)*))
    };
}
