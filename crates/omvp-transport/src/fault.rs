use std::io::{self, Read, Write};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use crate::error::{Result, TransportError};
use crate::traits::Transport;

/// Drops outbound writes with a fixed probability.
///
/// Wrap the writer half of a link with this to simulate a lossy serial line.
/// A dropped write still reports `Ok(buf.len())`, so the layers above observe
/// only the missing reply, never an error. Reads pass through untouched.
pub struct FaultInjector<T> {
    inner: T,
    drop_rate: f64,
    seed: Option<u64>,
    rng: StdRng,
    dropped: u64,
}

impl<T> FaultInjector<T> {
    /// Wrap `inner`, drawing from OS entropy.
    pub fn new(inner: T, drop_rate: f64) -> Result<Self> {
        Self::with_seed(inner, drop_rate, None)
    }

    /// Wrap `inner`; a `Some` seed makes the drop pattern reproducible.
    pub fn with_seed(inner: T, drop_rate: f64, seed: Option<u64>) -> Result<Self> {
        if !(0.0..=1.0).contains(&drop_rate) {
            return Err(TransportError::InvalidDropRate(drop_rate));
        }
        Ok(Self {
            inner,
            drop_rate,
            seed,
            rng: make_rng(seed),
            dropped: 0,
        })
    }

    /// Configured drop probability.
    pub fn drop_rate(&self) -> f64 {
        self.drop_rate
    }

    /// Number of writes discarded so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    fn should_drop(&mut self) -> bool {
        self.drop_rate > 0.0 && self.rng.random_bool(self.drop_rate)
    }
}

fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

impl<T: Write> Write for FaultInjector<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.should_drop() {
            self.dropped += 1;
            trace!(len = buf.len(), dropped = self.dropped, "fault injector dropped write");
            return Ok(buf.len());
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<T: Read> Read for FaultInjector<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<T: Transport> Transport for FaultInjector<T> {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.inner.set_read_timeout(timeout)
    }

    fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            inner: self.inner.try_clone()?,
            drop_rate: self.drop_rate,
            seed: self.seed,
            rng: make_rng(self.seed),
            dropped: 0,
        })
    }

    fn transport_name(&self) -> &'static str {
        self.inner.transport_name()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for FaultInjector<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultInjector")
            .field("inner", &self.inner)
            .field("drop_rate", &self.drop_rate)
            .field("dropped", &self.dropped)
            .finish()
    }
}
