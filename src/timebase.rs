// src/timebase.rs
//
// Projects the device's 32-bit microsecond counter onto host wall-clock time.
// The base is taken once at session start (host time minus device counter)
// and advanced by the full wrap period whenever the counter rolls over.

/// Full period of the device counter: 2^32 microseconds (~71.58 minutes).
const WRAP_SECONDS: u64 = (1u64 << 32) / 1_000_000;
const WRAP_MICROS: u32 = ((1u64 << 32) % 1_000_000) as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timebase {
    base_seconds: u64,
    /// Invariant: always < 1_000_000.
    base_micros: u32,
}

impl Timebase {
    /// base = host - device, with a borrow from the seconds when the device
    /// micros exceed the host micros within the current second.
    pub fn set(host_seconds: u64, host_micros: u32, device_micros: u32) -> Self {
        let dev_seconds = (device_micros / 1_000_000) as u64;
        let dev_micros = device_micros % 1_000_000;
        let mut base_seconds = host_seconds - dev_seconds;
        let base_micros = if host_micros < dev_micros {
            base_seconds -= 1;
            host_micros + 1_000_000 - dev_micros
        } else {
            host_micros - dev_micros
        };
        Timebase {
            base_seconds,
            base_micros,
        }
    }

    /// Advance the base by one full counter period. Call when a new device
    /// timestamp is numerically smaller than the previous one.
    pub fn advance_wrap(&mut self) {
        self.base_seconds += WRAP_SECONDS;
        self.base_micros += WRAP_MICROS;
        if self.base_micros >= 1_000_000 {
            self.base_seconds += 1;
            self.base_micros -= 1_000_000;
        }
    }

    /// Convert a device timestamp to (unix seconds, microseconds).
    pub fn timestamp(&self, device_micros: u32) -> (u64, u32) {
        let mut seconds = self.base_seconds + (device_micros / 1_000_000) as u64;
        let mut micros = self.base_micros + device_micros % 1_000_000;
        if micros >= 1_000_000 {
            seconds += 1;
            micros -= 1_000_000;
        }
        (seconds, micros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_projection() {
        let tb = Timebase::set(1000, 500_000, 200_000);
        assert_eq!(tb.timestamp(200_000), (1000, 500_000));
    }

    #[test]
    fn borrow_from_seconds() {
        let tb = Timebase::set(1000, 100, 300_000);
        assert_eq!(tb.base_seconds, 999);
        assert_eq!(tb.base_micros, 700_100);
    }

    #[test]
    fn carry_into_seconds() {
        let tb = Timebase::set(1000, 900_000, 0);
        assert_eq!(tb.timestamp(200_000), (1001, 100_000));
    }

    #[test]
    fn device_micros_above_one_second() {
        let tb = Timebase::set(1000, 0, 2_500_000);
        assert_eq!(tb.base_seconds, 997);
        assert_eq!(tb.base_micros, 500_000);
        assert_eq!(tb.timestamp(2_500_000), (1000, 0));
    }

    #[test]
    fn wrap_adds_full_counter_period() {
        let mut tb = Timebase::set(1000, 0, 0);
        let before = tb.timestamp(4_294_960_000);

        tb.advance_wrap();
        assert_eq!(tb.base_seconds, 1000 + 4294);
        assert_eq!(tb.base_micros, 967_296);

        // The post-wrap frame must land after the pre-wrap one in host time.
        let after = tb.timestamp(100);
        assert!(after > before);
    }

    #[test]
    fn wrap_micros_stay_normalized() {
        let mut tb = Timebase::set(1000, 999_999, 0);
        tb.advance_wrap();
        assert!(tb.base_micros < 1_000_000);
        assert_eq!(tb.base_seconds, 1000 + 4294 + 1);
        assert_eq!(tb.base_micros, 967_295);
    }
}
