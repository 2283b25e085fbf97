//! TTL register cache
//!
//! One cache serves one register class over a fixed interval cover. The cache
//! is either Fresh (refreshed within the TTL) or Stale. A stale read takes the
//! exclusive lock, re-checks, and refreshes every interval of the cover, so
//! concurrent readers trigger a single refresh and never see a torn buffer.

use crate::error::{RegisterError, Result};
use crate::interval::{merge, span, Address, AddressInterval};
use crate::transport::{RegisterClass, RegisterIo};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

pub const DEFAULT_TTL: Duration = Duration::from_millis(500);

#[derive(Debug)]
struct CacheState {
    buffer: Vec<u16>,
    last_refresh: Option<Instant>,
}

impl CacheState {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.last_refresh
            .is_some_and(|refreshed| refreshed.elapsed() < ttl)
    }
}

#[derive(Debug)]
pub struct RegisterCache {
    cover: Vec<AddressInterval>,
    class: RegisterClass,
    ttl: Duration,
    state: RwLock<CacheState>,
}

impl RegisterCache {
    pub fn new(cover: Vec<AddressInterval>, class: RegisterClass, ttl: Duration) -> Self {
        let cover = merge(cover);
        let size = span(&cover);
        info!(
            "Cache {}: {} intervals, {} words, ttl {:?}",
            class,
            cover.len(),
            size,
            ttl
        );
        Self {
            cover,
            class,
            ttl,
            state: RwLock::new(CacheState {
                buffer: vec![0; size],
                last_refresh: None,
            }),
        }
    }

    pub fn cover(&self) -> &[AddressInterval] {
        &self.cover
    }

    pub fn class(&self) -> RegisterClass {
        self.class
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// True when `range` lies inside a single interval of the cover
    pub fn covers(&self, range: &AddressInterval) -> bool {
        self.cover
            .iter()
            .any(|interval| interval.contains_interval(range))
    }

    pub async fn is_fresh(&self) -> bool {
        self.state.read().await.is_fresh(self.ttl)
    }

    /// Force the next covered read to refresh
    pub async fn invalidate(&self) {
        self.state.write().await.last_refresh = None;
        debug!("Cache {} invalidated", self.class);
    }

    /// Read `quantity` words at `address`, from the buffer when covered
    pub async fn read<T>(&self, io: &T, address: Address, quantity: u16) -> Result<Vec<u16>>
    where
        T: RegisterIo + ?Sized,
    {
        if quantity == 0 {
            return Ok(Vec::new());
        }
        let range = match AddressInterval::with_quantity(address, quantity) {
            Some(range) if self.covers(&range) => range,
            _ => {
                debug!("Cache {} bypass: {}+{}", self.class, address, quantity);
                return io.read(address, quantity, self.class).await;
            },
        };

        {
            let state = self.state.read().await;
            if state.is_fresh(self.ttl) {
                return Ok(self.slice(&state, range));
            }
        }

        let mut state = self.state.write().await;
        if !state.is_fresh(self.ttl) {
            self.refresh(io, &mut state).await?;
        }
        Ok(self.slice(&state, range))
    }

    async fn refresh<T>(&self, io: &T, state: &mut CacheState) -> Result<()>
    where
        T: RegisterIo + ?Sized,
    {
        let Some(first) = self.cover.first() else {
            return Ok(());
        };
        let origin = first.start;

        let mut buffer = vec![0; state.buffer.len()];
        for interval in &self.cover {
            let quantity = u16::try_from(interval.len()).map_err(|_| {
                RegisterError::config(format!("Interval {interval} too large for one read"))
            })?;
            let words = io.read(interval.start, quantity, self.class).await?;
            let offset = usize::from(interval.start - origin);
            let target = buffer
                .get_mut(offset..offset + words.len())
                .ok_or_else(|| RegisterError::decode(format!("Refresh of {interval} overflows buffer")))?;
            target.copy_from_slice(&words);
        }

        state.buffer = buffer;
        state.last_refresh = Some(Instant::now());
        debug!("Cache {} refreshed: {} intervals", self.class, self.cover.len());
        Ok(())
    }

    fn slice(&self, state: &CacheState, range: AddressInterval) -> Vec<u16> {
        let origin = self.cover.first().map_or(range.start, |first| first.start);
        let offset = usize::from(range.start - origin);
        state.buffer[offset..offset + range.len()].to_vec()
    }
}
