use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::codec;
use crate::ChannelError;

/// Value region size used when the caller has no preference.
pub const DEFAULT_CAPACITY: usize = 256;

const IDLE: usize = 0;

#[derive(Debug, Default)]
struct ControlWord {
    word: usize,
    closed: bool,
}

#[derive(Debug)]
struct Regions {
    control: Mutex<ControlWord>,
    wake: Condvar,
    value: Mutex<Box<[u8]>>,
}

/// Control word plus value region, shared between the control side and one
/// worker thread.
///
/// Clones refer to the same regions. The control side is the only writer:
/// it calls [`write_value`](Self::write_value) then [`signal`](Self::signal)
/// (or [`send_str`](Self::send_str)). The worker is the only waiter.
#[derive(Debug, Clone)]
pub struct SharedChannel {
    regions: Arc<Regions>,
    capacity: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SharedChannel {
    /// Allocate a channel whose value region holds `capacity` bytes.
    ///
    /// The largest value that fits is `capacity - 1` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            regions: Arc::new(Regions {
                control: Mutex::new(ControlWord::default()),
                wake: Condvar::new(),
                value: Mutex::new(vec![0u8; capacity].into_boxed_slice()),
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Encode `value` into the value region without waking the worker.
    pub fn write_value(&self, value: &str) -> Result<usize, ChannelError> {
        let mut region = lock(&self.regions.value);
        codec::encode(value, &mut region[..])
    }

    /// Decode `length` bytes from the value region.
    pub fn read_value(&self, length: usize) -> Result<String, ChannelError> {
        let region = lock(&self.regions.value);
        codec::decode(&region[..], length)
    }

    /// Deposit `length` in the control word and wake the parked worker.
    ///
    /// Must only be called after the value has been written.
    pub fn signal(&self, length: usize) -> Result<(), ChannelError> {
        if length >= self.capacity {
            return Err(ChannelError::CapacityExceeded {
                len: length,
                capacity: self.capacity,
            });
        }
        let mut control = lock(&self.regions.control);
        if control.closed {
            return Err(ChannelError::Closed);
        }
        if control.word != IDLE {
            warn!(
                "[shared-channel] Replacing an unconsumed signal of {} bytes",
                control.word - 1
            );
        }
        control.word = length + 1;
        self.regions.wake.notify_all();
        Ok(())
    }

    /// Park the calling thread until a length is deposited, then consume it.
    ///
    /// A signal that arrived before this call is returned immediately. The
    /// control word is back to idle when this returns.
    pub fn wait_for_signal(&self) -> Result<usize, ChannelError> {
        let mut control = lock(&self.regions.control);
        loop {
            if let Some(length) = Self::take(&mut control)? {
                return Ok(length);
            }
            control = self
                .regions
                .wake
                .wait(control)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`wait_for_signal`](Self::wait_for_signal) but gives up after
    /// `timeout`, returning `None`.
    pub fn wait_for_signal_timeout(&self, timeout: Duration) -> Result<Option<usize>, ChannelError> {
        let deadline = Instant::now() + timeout;
        let mut control = lock(&self.regions.control);
        loop {
            if let Some(length) = Self::take(&mut control)? {
                return Ok(Some(length));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _) = self
                .regions
                .wake
                .wait_timeout(control, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            control = guard;
        }
    }

    fn take(control: &mut ControlWord) -> Result<Option<usize>, ChannelError> {
        if control.closed {
            return Err(ChannelError::Closed);
        }
        if control.word == IDLE {
            return Ok(None);
        }
        let length = control.word - 1;
        control.word = IDLE;
        Ok(Some(length))
    }

    /// Write then signal.
    pub fn send_str(&self, value: &str) -> Result<usize, ChannelError> {
        let length = self.write_value(value)?;
        self.signal(length)?;
        Ok(length)
    }

    /// Wait then decode.
    pub fn recv_str(&self) -> Result<String, ChannelError> {
        let length = self.wait_for_signal()?;
        self.read_value(length)
    }

    /// Permanently close the channel. Parked and future waiters get
    /// [`ChannelError::Closed`].
    pub fn close(&self) {
        let mut control = lock(&self.regions.control);
        if !control.closed {
            debug!("[shared-channel] Closing");
            control.closed = true;
            self.regions.wake.notify_all();
        }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.regions.control).closed
    }
}
