//! Address interval algebra
//!
//! Merges configured register ranges into a minimal disjoint cover. The
//! payload-carrying variant is what write coalescing is built on.

use std::fmt;

/// Register address as used in configuration (1-based)
pub type Address = u16;

/// Inclusive address range `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressInterval {
    pub start: Address,
    pub end: Address,
}

impl AddressInterval {
    /// Create an interval, swapping the bounds if given in reverse
    pub fn new(start: Address, end: Address) -> Self {
        if end < start {
            Self {
                start: end,
                end: start,
            }
        } else {
            Self { start, end }
        }
    }

    pub fn single(address: Address) -> Self {
        Self {
            start: address,
            end: address,
        }
    }

    /// Interval covering `quantity` registers starting at `start`.
    ///
    /// Returns `None` for a zero quantity or when the range overflows the
    /// 16-bit address space.
    pub fn with_quantity(start: Address, quantity: u16) -> Option<Self> {
        let last = quantity.checked_sub(1)?;
        let end = start.checked_add(last)?;
        Some(Self { start, end })
    }

    pub fn len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    /// An interval always covers at least one address
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, address: Address) -> bool {
        address >= self.start && address <= self.end
    }

    pub fn contains_interval(&self, other: &AddressInterval) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// True when `other` overlaps this interval or starts right after it
    fn absorbs(&self, other: &AddressInterval) -> bool {
        u32::from(other.start) <= u32::from(self.end) + 1
    }
}

impl fmt::Display for AddressInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", self.start, self.end)
    }
}

/// Merge intervals into a sorted, pairwise-disjoint, non-adjacent cover.
///
/// The union of covered addresses is preserved and the output does not
/// depend on input order.
pub fn merge<I>(intervals: I) -> Vec<AddressInterval>
where
    I: IntoIterator<Item = AddressInterval>,
{
    let mut sorted: Vec<AddressInterval> = intervals.into_iter().collect();
    sorted.sort_unstable();

    let mut result: Vec<AddressInterval> = Vec::with_capacity(sorted.len());
    for interval in sorted {
        match result.last_mut() {
            Some(current) if current.absorbs(&interval) => {
                current.end = current.end.max(interval.end);
            },
            _ => result.push(interval),
        }
    }
    result
}

/// Merged interval carrying the payloads of every input range it absorbed
#[derive(Debug, Clone, PartialEq)]
pub struct MergedRange<P> {
    pub interval: AddressInterval,
    pub payload: Vec<P>,
}

impl<P> MergedRange<P> {
    pub fn new(interval: AddressInterval, payload: P) -> Self {
        Self {
            interval,
            payload: vec![payload],
        }
    }
}

/// Merge payload-carrying ranges.
///
/// Payload lists are concatenated in address order. Ranges with equal start
/// keep their input order.
pub fn merge_with_payload<P, I>(ranges: I) -> Vec<MergedRange<P>>
where
    I: IntoIterator<Item = MergedRange<P>>,
{
    let mut sorted: Vec<MergedRange<P>> = ranges.into_iter().collect();
    sorted.sort_by_key(|range| (range.interval.start, range.interval.end));

    let mut result: Vec<MergedRange<P>> = Vec::with_capacity(sorted.len());
    for range in sorted {
        match result.last_mut() {
            Some(current) if current.interval.absorbs(&range.interval) => {
                current.interval.end = current.interval.end.max(range.interval.end);
                current.payload.extend(range.payload);
            },
            _ => result.push(range),
        }
    }
    result
}

/// Total number of words spanned from the first start to the greatest end
pub fn span(cover: &[AddressInterval]) -> usize {
    match (cover.first(), cover.iter().map(|i| i.end).max()) {
        (Some(first), Some(end)) => usize::from(end - first.start) + 1,
        _ => 0,
    }
}
