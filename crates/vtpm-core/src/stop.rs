//! Termination signal bridge.
//!
//! A [`StopHandle`] can be cloned into any context (a signal task, another
//! thread, an embedding application) and asks the run to stop. During the
//! run the sequencer opens a [`StopBridge`]: a socket pair whose readable
//! end the command loop waits on next to its other inputs. A stop request
//! writes one byte into the other end. The byte carries no meaning.
//!
//! Requests are latched. A request made before the bridge exists is
//! delivered when the bridge opens, so the command loop sees it as soon as
//! it starts waiting. Dropping the bridge closes both ends of the pair;
//! later requests only set the latch.

use std::io::{self, Write};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::UnixStream;

const SENTINEL: &[u8] = b"T";

#[derive(Debug, Default)]
struct StopSlot {
    requested: AtomicBool,
    opened: AtomicBool,
    writer: Mutex<Option<StdUnixStream>>,
}

impl StopSlot {
    fn notify(&self) {
        // A contended slot is being opened or closed; opening re-checks
        // the latch after it lets go.
        let Ok(writer) = self.writer.try_lock() else {
            return;
        };
        if let Some(writer) = writer.as_ref() {
            // The socket is non-blocking; a full buffer already holds a
            // wakeup and a closed peer no longer needs one.
            let _ = (&*writer).write(SENTINEL);
        }
    }

    fn close(&self) {
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(writer);
    }
}

/// Cloneable, thread-safe handle for requesting a stop.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    slot: Arc<StopSlot>,
}

impl StopHandle {
    /// Create a handle with no stop requested.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the run to stop.
    ///
    /// Never blocks or waits on a lock. Only the first call has an effect.
    pub fn request_stop(&self) {
        if self.slot.requested.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("Stop requested");
        self.slot.notify();
    }

    /// True once [`request_stop`](Self::request_stop) was called.
    pub fn is_requested(&self) -> bool {
        self.slot.requested.load(Ordering::SeqCst)
    }
}

/// Readable end of the termination bridge, owned by the sequencer.
#[derive(Debug)]
pub struct StopBridge {
    handle: StopHandle,
    reader: UnixStream,
    fired: AtomicBool,
}

impl StopBridge {
    /// Open the bridge for `handle`. Must be called inside a tokio runtime.
    ///
    /// # Errors
    /// Socket creation failures, or a bridge already opened for this handle.
    pub fn open(handle: &StopHandle) -> io::Result<Self> {
        if handle.slot.opened.swap(true, Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "stop bridge already opened for this handle",
            ));
        }

        let reader = match Self::socket_pair() {
            Ok((reader, writer)) => {
                *handle
                    .slot
                    .writer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(writer);
                reader
            }
            Err(e) => {
                handle.slot.opened.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        // A request that raced with the store may write a second byte; harmless.
        if handle.is_requested() {
            handle.slot.notify();
        }

        Ok(Self {
            handle: handle.clone(),
            reader,
            fired: AtomicBool::new(false),
        })
    }

    fn socket_pair() -> io::Result<(UnixStream, StdUnixStream)> {
        let (reader, writer) = StdUnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        Ok((UnixStream::from_std(reader)?, writer))
    }

    /// Resolves once a stop has been requested.
    ///
    /// Cancel-safe; meant to be the first branch of a biased `select!`.
    pub async fn stopped(&self) {
        let mut buf = [0u8; 16];
        loop {
            if self.fired.load(Ordering::SeqCst) {
                return;
            }
            if self.reader.readable().await.is_err() {
                break;
            }
            match self.reader.try_read(&mut buf) {
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(_) => break,
            }
        }
        self.fired.store(true, Ordering::SeqCst);
    }

    /// True if the stop has been observed or requested.
    pub fn is_stop_requested(&self) -> bool {
        self.fired.load(Ordering::SeqCst) || self.handle.is_requested()
    }
}

impl Drop for StopBridge {
    fn drop(&mut self) {
        self.handle.slot.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_request_wakes_waiter() {
        let handle = StopHandle::new();
        let bridge = StopBridge::open(&handle).unwrap();
        assert!(!bridge.is_stop_requested());

        let remote = handle.clone();
        std::thread::spawn(move || remote.request_stop());

        tokio::time::timeout(Duration::from_secs(5), bridge.stopped())
            .await
            .unwrap();
        assert!(bridge.is_stop_requested());

        // already fired, resolves immediately
        bridge.stopped().await;
    }

    #[tokio::test]
    async fn test_request_before_open_is_delivered() {
        let handle = StopHandle::new();
        handle.request_stop();

        let bridge = StopBridge::open(&handle).unwrap();
        tokio::time::timeout(Duration::from_secs(5), bridge.stopped())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_second_request_has_no_effect() {
        let handle = StopHandle::new();
        let bridge = StopBridge::open(&handle).unwrap();
        handle.request_stop();
        handle.request_stop();

        let mut buf = [0u8; 16];
        bridge.reader.readable().await.unwrap();
        assert_eq!(bridge.reader.try_read(&mut buf).unwrap(), 1);
        assert_eq!(
            bridge.reader.try_read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
    }

    #[tokio::test]
    async fn test_request_after_close() {
        let handle = StopHandle::new();
        drop(StopBridge::open(&handle).unwrap());
        handle.request_stop();
        assert!(handle.is_requested());
    }

    #[tokio::test]
    async fn test_drop_closes_writer() {
        let handle = StopHandle::new();
        let bridge = StopBridge::open(&handle).unwrap();
        assert!(handle.slot.writer.lock().unwrap().is_some());

        // a clone outliving the bridge must not keep the pair alive
        let remote = handle.clone();
        drop(bridge);
        assert!(remote.slot.writer.lock().unwrap().is_none());

        remote.request_stop();
        assert!(remote.is_requested());
        assert_eq!(
            StopBridge::open(&remote).unwrap_err().kind(),
            io::ErrorKind::AlreadyExists
        );
    }

    #[tokio::test]
    async fn test_open_twice_fails() {
        let handle = StopHandle::new();
        let _bridge = StopBridge::open(&handle).unwrap();
        assert_eq!(
            StopBridge::open(&handle).unwrap_err().kind(),
            io::ErrorKind::AlreadyExists
        );
    }

    #[tokio::test]
    async fn test_not_stopped_without_request() {
        let handle = StopHandle::new();
        let bridge = StopBridge::open(&handle).unwrap();
        let waited = tokio::time::timeout(Duration::from_millis(50), bridge.stopped()).await;
        assert!(waited.is_err());
        assert!(!bridge.is_stop_requested());
    }
}
