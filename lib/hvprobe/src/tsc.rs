// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reading the Hyper-V reference TSC page. See TLFS section 12.7.
//!
//! # Theory
//!
//! The reference TSC page lets a guest compute partition reference time (100
//! ns units since the partition was created) from its own TSC without taking
//! an exit to read [`HV_X64_MSR_TIME_REF_COUNT`]. The host publishes a scale
//! and an offset, and the guest computes
//!
//! ```text
//! reference_time = ((tsc * scale) >> 64) + offset
//! ```
//!
//! `scale` is a 64.64 fixed-point multiplier: the reference frequency (1e7)
//! shifted left by 64 places and divided by the guest TSC frequency. Because
//! the scaling factor has 64 fractional bits, the product must be formed at
//! full 128-bit width and only then shifted; multiplying in 64 bits discards
//! exactly the bits that carry the result.
//!
//! The page itself only has room for the fractional half of the multiplier,
//! so a host can only publish scales below 1.0 (TSC frequencies above 10 MHz).
//! [`Scale`] widens the wire value so that a reader can also be handed the
//! identity scale, 2^64, which makes `read` the identity on ticks.
//!
//! # Validity
//!
//! A sequence number of 0 or 0xFFFF_FFFF means the host has not published a
//! usable scale and offset; readers must fall back to the reference counter
//! MSR. The host bumps the sequence whenever it rewrites the page, so a reader
//! takes a snapshot between two reads of the sequence and retries if they
//! differ.
//!
//! [`HV_X64_MSR_TIME_REF_COUNT`]: crate::bits::HV_X64_MSR_TIME_REF_COUNT

use thiserror::Error;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::common::{GuestAddr, HUNDRED_NS_PER_SEC, PAGE_MASK, PAGE_SIZE};
use crate::platform::{PageAllocator, PageHandle};

const ENABLED_BIT: u64 = 0;
const ENABLED_MASK: u64 = 1 << ENABLED_BIT;

/// Sequence value reserved to mean "not published".
pub const SEQUENCE_INVALID: u32 = 0xFFFF_FFFF;

/// How many times [`ReferenceTscPage::load`] rereads a page whose sequence
/// changed underneath it before settling for the last snapshot.
pub const SEQUENCE_RETRY_LIMIT: usize = 8;

/// Represents a value written to the [`HV_X64_MSR_REFERENCE_TSC`] register.
///
/// [`HV_X64_MSR_REFERENCE_TSC`]: crate::bits::HV_X64_MSR_REFERENCE_TSC
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct MsrReferenceTscValue(pub u64);

impl std::fmt::Debug for MsrReferenceTscValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsrReferenceTscValue")
            .field("raw", &format!("{:#x}", self.0))
            .field("gpa", &format!("{:#x}", self.gpa().0))
            .field("enabled", &self.enabled())
            .finish()
    }
}

impl MsrReferenceTscValue {
    /// A value that places the page at `gpa`, which must be page-aligned.
    pub fn new(gpa: GuestAddr, enabled: bool) -> Self {
        let enable = if enabled { ENABLED_MASK } else { 0 };
        Self((gpa.0 & PAGE_MASK as u64) | enable)
    }

    /// Yields the guest physical address at which the guest would like to place
    /// the reference TSC page.
    pub fn gpa(&self) -> GuestAddr {
        GuestAddr(self.0 & PAGE_MASK as u64)
    }

    /// Returns `true` if the reference TSC page is enabled.
    pub fn enabled(&self) -> bool {
        (self.0 & ENABLED_MASK) != 0
    }
}

/// The contents of a reference TSC page, defined in TLFS section 12.7.2, in
/// the layout the host writes them.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct ReferenceTscPage {
    /// Incremented whenever `scale` or `offset` change. 0 and
    /// [`SEQUENCE_INVALID`] mean the rest of the page is not to be used.
    pub sequence: u32,

    /// Reserved for alignment.
    pub reserved: u32,

    /// The 0.64 fixed-point factor converting guest TSC ticks into 100 ns
    /// units.
    pub scale: u64,

    /// Added to scaled TSC readings to obtain time since partition creation.
    pub offset: i64,
}

impl ReferenceTscPage {
    /// Host side: page contents for a guest whose TSC runs at `guest_freq`.
    /// The page is left unpublished if the scale cannot be expressed.
    pub fn new(guest_freq: u64) -> Self {
        match guest_freq_to_scale(guest_freq) {
            Some(scale) => Self { sequence: 1, scale, ..Default::default() },
            None => Self::default(),
        }
    }

    /// Writes this page's contents into the start of a page-sized buffer.
    pub fn write_to_page(&self, page: &mut [u8; PAGE_SIZE]) {
        page[..std::mem::size_of::<Self>()].copy_from_slice(self.as_bytes());
    }

    /// Reads a consistent snapshot of the page mapped at `page`.
    ///
    /// The sequence is sampled after the full snapshot; if it no longer
    /// matches the snapshot's, the host rewrote the page mid-read and the read
    /// is repeated, up to [`SEQUENCE_RETRY_LIMIT`] times. Validity of the
    /// final snapshot is checked when it is used, by [`read`].
    pub fn load<A: PageAllocator + ?Sized>(
        allocator: &A,
        page: &PageHandle,
    ) -> Self {
        let mut snapshot = Self::new_zeroed();
        for _ in 0..SEQUENCE_RETRY_LIMIT {
            allocator.read_bytes(page, 0, snapshot.as_mut_bytes());

            let mut sequence = 0u32;
            allocator.read_bytes(page, 0, sequence.as_mut_bytes());
            if sequence == snapshot.sequence {
                break;
            }
        }

        snapshot
    }
}

/// Converts the supplied guest TSC frequency into a 0.64 fixed-point scaling
/// factor. Returns `None` if the correct factor cannot be so expressed.
pub fn guest_freq_to_scale(guest_freq: u64) -> Option<u64> {
    let scale = ((HUNDRED_NS_PER_SEC as u128) << 64)
        .checked_div(guest_freq as u128)?;
    u64::try_from(scale).ok()
}

/// A 64.64 fixed-point multiplier no larger than 1.0.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Scale(u128);

impl Scale {
    pub const ZERO: Self = Self(0);
    pub const ONE: Self = Self(1 << 64);

    /// A scale whose integer part is zero, as published on the page.
    pub const fn from_fraction(fraction: u64) -> Self {
        Self(fraction as u128)
    }

    pub const fn raw(&self) -> u128 {
        self.0
    }
}

/// A decoded reference TSC page: the values [`read`] works from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReferenceClockPage {
    pub sequence: u32,
    pub scale: Scale,
    pub offset: i64,
}

impl ReferenceClockPage {
    /// Returns `true` unless the host has marked the page unusable.
    pub fn is_published(&self) -> bool {
        self.sequence != 0 && self.sequence != SEQUENCE_INVALID
    }
}

impl From<ReferenceTscPage> for ReferenceClockPage {
    fn from(page: ReferenceTscPage) -> Self {
        Self {
            sequence: page.sequence,
            scale: Scale::from_fraction(page.scale),
            offset: page.offset,
        }
    }
}

/// Partition reference time, in 100 ns units.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReferenceTime(i128);

impl ReferenceTime {
    pub fn value(&self) -> i128 {
        self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ClockError {
    #[error("reference TSC page not available (sequence {sequence:#x})")]
    Unavailable { sequence: u32 },
}

/// Converts a raw TSC reading to reference time using `page`.
pub fn read(
    page: &ReferenceClockPage,
    raw_tick: u64,
) -> Result<ReferenceTime, ClockError> {
    if !page.is_published() {
        return Err(ClockError::Unavailable { sequence: page.sequence });
    }

    // Scales never exceed 2^64, so the product fits in 128 bits and the
    // shifted result fits in 64.
    let scaled = (raw_tick as u128 * page.scale.raw()) >> 64;
    Ok(ReferenceTime(scaled as i128 + page.offset as i128))
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    fn page(sequence: u32, scale: Scale, offset: i64) -> ReferenceClockPage {
        ReferenceClockPage { sequence, scale, offset }
    }

    #[test]
    fn wire_layout() {
        assert_eq!(std::mem::size_of::<ReferenceTscPage>(), 24);

        let tsc = ReferenceTscPage {
            sequence: 0x0403_0201,
            reserved: 0,
            scale: 0x1817_1615_1413_1211,
            offset: -2,
        };
        let bytes = tsc.as_bytes();
        assert_eq!(&bytes[0..4], &[1, 2, 3, 4]);
        assert_eq!(bytes[8], 0x11);
        assert_eq!(&bytes[16..24], &(-2i64).to_le_bytes());
    }

    #[test]
    fn invalid_sequences_are_unavailable() {
        for sequence in [0, SEQUENCE_INVALID] {
            assert_eq!(
                read(&page(sequence, Scale::ONE, 0), 42),
                Err(ClockError::Unavailable { sequence })
            );
        }

        assert!(read(&page(1, Scale::from_fraction(12345), -7), 42).is_ok());
    }

    #[test]
    fn reads_use_the_high_half_of_the_product() {
        // With a 2.1 GHz TSC one second of ticks is 1e7 reference units; a
        // 64-bit multiply would wrap long before that.
        let scale = guest_freq_to_scale(2_100_000_000).unwrap();
        let clock = page(1, Scale::from_fraction(scale), 0);
        let time = read(&clock, 2_100_000_000).unwrap().value();
        assert!((9_999_999..=10_000_000).contains(&time), "{time}");
    }

    #[test]
    fn tick_five_million_at_identity() {
        let clock = page(1, Scale::ONE, 0);
        assert_eq!(read(&clock, 5_000_000).unwrap().value(), 5_000_000);
    }

    #[test]
    fn scale_bounds() {
        assert_eq!(guest_freq_to_scale(0), None);
        assert_eq!(guest_freq_to_scale(HUNDRED_NS_PER_SEC), None);
        assert_eq!(guest_freq_to_scale(2 * HUNDRED_NS_PER_SEC), Some(1 << 63));
    }

    #[test]
    fn slow_guests_get_an_unpublished_page() {
        let tsc = ReferenceTscPage::new(1_000_000);
        assert_eq!(tsc.sequence, 0);
        assert!(!ReferenceClockPage::from(tsc).is_published());
    }

    #[test]
    fn msr_value_fields() {
        let v = MsrReferenceTscValue::new(GuestAddr(0x5000), true);
        assert_eq!(v.0, 0x5001);
        assert_eq!(v.gpa(), GuestAddr(0x5000));
        assert!(v.enabled());
        assert!(!MsrReferenceTscValue(0x5000).enabled());
    }

    proptest! {
        #[test]
        fn identity_scale_returns_the_tick(tick in any::<u64>()) {
            let clock = page(1, Scale::ONE, 0);
            prop_assert_eq!(read(&clock, tick).unwrap().value(), tick as i128);
        }

        #[test]
        fn zero_scale_returns_the_offset(
            tick in any::<u64>(),
            offset in any::<i64>(),
            sequence in 1..SEQUENCE_INVALID,
        ) {
            let clock = page(sequence, Scale::ZERO, offset);
            prop_assert_eq!(
                read(&clock, tick).unwrap().value(),
                offset as i128
            );
        }
    }
}
