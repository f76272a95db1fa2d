use std::{cmp::Ordering, marker::PhantomData, mem::MaybeUninit, time::Duration};

/// Id for a clock according to unix clockid_t
pub trait ClockSource {
    /// Gets the id of the clock source
    fn id() -> libc::clockid_t;
}

/// Monotonic clock
#[derive(Debug)]
pub struct Monotonic;

impl ClockSource for Monotonic {
    fn id() -> libc::clockid_t {
        libc::CLOCK_MONOTONIC
    }
}

/// Wall clock
#[derive(Debug)]
pub struct Realtime;

impl ClockSource for Realtime {
    fn id() -> libc::clockid_t {
        libc::CLOCK_REALTIME
    }
}

/// A point in time for a clock with a specific kind
pub struct Time<Kind> {
    tp: libc::timespec,
    _kind: PhantomData<Kind>,
}

impl<Kind: ClockSource> Time<Kind> {
    /// Samples the current time from the clock backing `Kind`.
    pub fn now() -> Time<Kind> {
        clock_get_time(Kind::id())
            .expect("failed to get clock time")
            .into()
    }
}

impl<Kind> Time<Kind> {
    /// Gets the duration between self and a later time
    pub fn duration_since(&self, later: Time<Kind>) -> Duration {
        saturating_sub_timespec(later.tp, self.tp).unwrap_or(Duration::ZERO)
    }

    /// This time expressed in microseconds
    pub fn as_micros(&self) -> u64 {
        self.tp.tv_sec.max(0) as u64 * 1_000_000 + self.tp.tv_nsec.max(0) as u64 / 1_000
    }

    /// Whether this is the zero point of the clock (an unset stamp)
    pub fn is_zero(&self) -> bool {
        self.tp.tv_sec == 0 && self.tp.tv_nsec == 0
    }
}

impl<Kind> Clone for Time<Kind> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Kind> Copy for Time<Kind> {}

impl<Kind> std::fmt::Debug for Time<Kind> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Time").field("tp", &self.tp).finish()
    }
}

impl<Kind> PartialEq for Time<Kind> {
    fn eq(&self, other: &Self) -> bool {
        self.tp.tv_sec == other.tp.tv_sec && self.tp.tv_nsec == other.tp.tv_nsec
    }
}

impl<Kind> Eq for Time<Kind> {}

impl<Kind> PartialOrd for Time<Kind> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<Kind> Ord for Time<Kind> {
    fn cmp(&self, other: &Self) -> Ordering {
        let tv_sec = self.tp.tv_sec.cmp(&other.tp.tv_sec);

        if tv_sec == Ordering::Equal {
            self.tp.tv_nsec.cmp(&other.tp.tv_nsec)
        } else {
            tv_sec
        }
    }
}

impl<Kind> From<Duration> for Time<Kind> {
    fn from(tp: Duration) -> Self {
        let tp = libc::timespec {
            tv_sec: tp.as_secs() as libc::time_t,
            tv_nsec: tp.subsec_nanos() as _,
        };
        Time {
            tp,
            _kind: PhantomData,
        }
    }
}

impl<Kind> From<libc::timespec> for Time<Kind> {
    fn from(tp: libc::timespec) -> Self {
        Time {
            tp,
            _kind: PhantomData,
        }
    }
}

/// A paired wall-clock and monotonic stamp taken at the same instant.
///
/// The wall half is what gets persisted and shown to humans, the monotonic
/// half is what gets compared. Idle-hint bookkeeping stores these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DualTimestamp {
    /// Wall-clock half of the stamp
    pub realtime: Time<Realtime>,
    /// Monotonic half of the stamp
    pub monotonic: Time<Monotonic>,
}

impl DualTimestamp {
    /// Samples both clocks now.
    pub fn now() -> DualTimestamp {
        DualTimestamp {
            realtime: Time::now(),
            monotonic: Time::now(),
        }
    }

    /// A stamp that was never taken.
    pub fn unset() -> DualTimestamp {
        DualTimestamp {
            realtime: Duration::ZERO.into(),
            monotonic: Duration::ZERO.into(),
        }
    }

    /// Whether this stamp was ever taken.
    pub fn is_set(&self) -> bool {
        !self.monotonic.is_zero()
    }

    /// Builds a stamp from raw offsets, mostly useful to replay persisted values.
    pub fn from_parts(realtime: Duration, monotonic: Duration) -> DualTimestamp {
        DualTimestamp {
            realtime: realtime.into(),
            monotonic: monotonic.into(),
        }
    }
}

impl PartialOrd for DualTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DualTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.monotonic.cmp(&other.monotonic)
    }
}

const NANOS_PER_SEC: libc::c_long = 1_000_000_000;

fn saturating_sub_timespec(lhs: libc::timespec, rhs: libc::timespec) -> Option<Duration> {
    if let Some(mut secs) = lhs.tv_sec.checked_sub(rhs.tv_sec) {
        let nanos = if lhs.tv_nsec >= rhs.tv_nsec {
            lhs.tv_nsec - rhs.tv_nsec
        } else if let Some(sub_secs) = secs.checked_sub(1) {
            secs = sub_secs;
            lhs.tv_nsec + NANOS_PER_SEC - rhs.tv_nsec
        } else {
            return None;
        };
        debug_assert!(nanos < NANOS_PER_SEC);
        Some(Duration::new(secs as u64, nanos as u32))
    } else {
        None
    }
}

fn clock_get_time(clk_id: libc::clockid_t) -> Result<libc::timespec, std::io::Error> {
    let mut tp = MaybeUninit::zeroed();
    unsafe {
        let res = libc::clock_gettime(clk_id, tp.as_mut_ptr());

        if res < 0 {
            return Err(std::io::Error::last_os_error());
        }

        Ok(tp.assume_init())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{DualTimestamp, Monotonic, Time};

    #[test]
    fn monotonic_progresses() {
        let earlier: Time<Monotonic> = Time::now();
        let later: Time<Monotonic> = Time::now();
        assert!(earlier <= later);
        assert_eq!(later.duration_since(later), Duration::ZERO);
    }

    #[test]
    fn dual_timestamp_orders_by_monotonic() {
        let a = DualTimestamp::from_parts(Duration::from_secs(100), Duration::from_secs(2));
        let b = DualTimestamp::from_parts(Duration::from_secs(50), Duration::from_secs(3));
        assert!(a < b);
        assert!(a.is_set());
        assert!(!DualTimestamp::unset().is_set());
    }

    #[test]
    fn micros_accessor() {
        let t: Time<Monotonic> = Time::from(Duration::from_micros(1_500_000));
        assert_eq!(t.as_micros(), 1_500_000);
    }
}
