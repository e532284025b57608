//! The `HardwareBus` trait and its two implementations: a real Linux I2C
//! driver and an in-memory mock used for `--mock` runs and tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{HearthampError, HearthampResult};

use super::registers::UNIT_ADDRESSES;

/// Byte-level register I/O to the preamp microcontrollers over the shared
/// bus, rate-limited and mutex-serialized so higher layers never need to
/// think about bus contention.
#[async_trait]
pub trait HardwareBus: Send + Sync {
    /// Runs the wake/probe sequence and caches the responding unit indices.
    /// Fails only if no unit answers at all.
    async fn init(&self) -> HearthampResult<()>;

    /// Reads one register from one unit.
    async fn read(&self, unit: u8, reg: u8) -> HearthampResult<u8>;

    /// Writes one register on one unit.
    async fn write(&self, unit: u8, reg: u8, value: u8) -> HearthampResult<()>;

    /// Unit indices that responded during `init`.
    fn units(&self) -> Vec<u8>;
}

/// Serializes and paces bus operations so the trait implementations don't
/// have to duplicate the throttling logic.
struct RateLimiter {
    min_interval: Duration,
    last: Mutex<Instant>,
}

impl RateLimiter {
    fn new(ops_per_sec: u32) -> Self {
        Self {
            min_interval: Duration::from_secs_f64(1.0 / ops_per_sec.max(1) as f64),
            last: Mutex::new(Instant::now() - Duration::from_secs(1)),
        }
    }

    async fn wait_turn(&self) {
        let wait = {
            let mut last = self.last.lock();
            let now = Instant::now();
            let earliest = *last + self.min_interval;
            let wait = earliest.saturating_duration_since(now);
            *last = now.max(earliest);
            wait
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

/// In-memory simulation of the unit fleet, for `--mock` runs and tests.
/// Every unit address responds; register writes are stored and echoed
/// back by reads so higher layers can assert on what they wrote.
pub struct MockBus {
    limiter: RateLimiter,
    lock: tokio::sync::Mutex<()>,
    registers: Mutex<HashMap<(u8, u8), u8>>,
    unit_count: usize,
}

impl MockBus {
    /// Creates a mock bus that will respond as if `unit_count` units
    /// (1..=6) are present on the chain.
    pub fn new(ops_per_sec: u32, unit_count: usize) -> Self {
        Self {
            limiter: RateLimiter::new(ops_per_sec),
            lock: tokio::sync::Mutex::new(()),
            registers: Mutex::new(HashMap::new()),
            unit_count: unit_count.min(UNIT_ADDRESSES.len()),
        }
    }
}

#[async_trait]
impl HardwareBus for MockBus {
    async fn init(&self) -> HearthampResult<()> {
        if self.unit_count == 0 {
            return Err(HearthampError::Internal("no unit responded during init".into()));
        }
        Ok(())
    }

    async fn read(&self, unit: u8, reg: u8) -> HearthampResult<u8> {
        self.limiter.wait_turn().await;
        let _guard = self.lock.lock().await;
        Ok(*self.registers.lock().get(&(unit, reg)).unwrap_or(&0))
    }

    async fn write(&self, unit: u8, reg: u8, value: u8) -> HearthampResult<()> {
        self.limiter.wait_turn().await;
        let _guard = self.lock.lock().await;
        self.registers.lock().insert((unit, reg), value);
        Ok(())
    }

    fn units(&self) -> Vec<u8> {
        (0..self.unit_count as u8).collect()
    }
}

/// Real Linux I2C/serial bus driver.
///
/// Init wakes the main unit over an auxiliary serial line, waits for the
/// daisy-chain to settle, then probes each of the six possible addresses
/// by reading the version-major register; the first address that fails to
/// respond stops probing for that and later addresses. Non-main units are
/// forced to all-digital sources once probing succeeds.
pub struct RealBus {
    limiter: RateLimiter,
    lock: tokio::sync::Mutex<()>,
    i2c_path: String,
    wake_serial_path: String,
    detected_units: Mutex<Vec<u8>>,
    #[allow(dead_code)]
    cancel: CancellationToken,
}

impl RealBus {
    pub fn new(i2c_path: impl Into<String>, wake_serial_path: impl Into<String>, ops_per_sec: u32) -> Self {
        Self {
            limiter: RateLimiter::new(ops_per_sec),
            lock: tokio::sync::Mutex::new(()),
            i2c_path: i2c_path.into(),
            wake_serial_path: wake_serial_path.into(),
            detected_units: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    #[cfg(unix)]
    fn transact(&self, addr: u8, reg: u8, write_value: Option<u8>) -> HearthampResult<u8> {
        use std::fs::OpenOptions;
        use std::os::unix::io::AsRawFd;

        const I2C_SLAVE: u64 = 0x0703;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.i2c_path)
            .map_err(|e| HearthampError::Internal(format!("open {}: {}", self.i2c_path, e)))?;

        // SAFETY: a valid, open fd and a well-formed ioctl request number.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), I2C_SLAVE, addr as libc::c_ulong) };
        if rc < 0 {
            return Err(HearthampError::Internal(format!("I2C_SLAVE ioctl failed for addr {:#x}", addr)));
        }

        use std::io::{Read, Write};
        let mut f = file;
        if let Some(value) = write_value {
            f.write_all(&[reg, value])
                .map_err(|e| HearthampError::Internal(format!("i2c write: {}", e)))?;
            return Ok(0);
        }

        f.write_all(&[reg])
            .map_err(|e| HearthampError::Internal(format!("i2c write-reg: {}", e)))?;
        let mut buf = [0u8; 1];
        f.read_exact(&mut buf)
            .map_err(|e| HearthampError::Internal(format!("i2c read: {}", e)))?;
        Ok(buf[0])
    }

    #[cfg(not(unix))]
    fn transact(&self, _addr: u8, _reg: u8, _write_value: Option<u8>) -> HearthampResult<u8> {
        Err(HearthampError::Internal("hardware bus is only supported on unix".into()))
    }

    fn wake_main_unit(&self) -> HearthampResult<()> {
        #[cfg(unix)]
        {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new()
                .write(true)
                .open(&self.wake_serial_path)
                .map_err(|e| HearthampError::Internal(format!("open {}: {}", self.wake_serial_path, e)))?;
            f.write_all(&[0xAA, 0x55, 0x01])
                .map_err(|e| HearthampError::Internal(format!("wake write: {}", e)))?;
            Ok(())
        }
        #[cfg(not(unix))]
        {
            Err(HearthampError::Internal("hardware bus is only supported on unix".into()))
        }
    }
}

#[async_trait]
impl HardwareBus for RealBus {
    async fn init(&self) -> HearthampResult<()> {
        self.wake_main_unit()?;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut found = Vec::new();
        for (idx, addr) in UNIT_ADDRESSES.iter().enumerate() {
            self.limiter.wait_turn().await;
            let _guard = self.lock.lock().await;
            match self.transact(*addr, super::registers::REG_VERSION_MAJOR, None) {
                Ok(_) => found.push(idx as u8),
                Err(_) => break,
            }
        }

        if found.is_empty() {
            return Err(HearthampError::Internal("no unit responded during init".into()));
        }

        for &unit in found.iter().filter(|u| **u > 0) {
            let addr = UNIT_ADDRESSES[unit as usize];
            self.limiter.wait_turn().await;
            let _guard = self.lock.lock().await;
            let _ = self.transact(addr, super::registers::REG_SRC_AD, Some(0xFF));
        }

        *self.detected_units.lock() = found;
        Ok(())
    }

    async fn read(&self, unit: u8, reg: u8) -> HearthampResult<u8> {
        self.limiter.wait_turn().await;
        let _guard = self.lock.lock().await;
        let addr = *UNIT_ADDRESSES.get(unit as usize).ok_or_else(|| HearthampError::Internal(format!("unit {} out of range", unit)))?;
        self.transact(addr, reg, None)
    }

    async fn write(&self, unit: u8, reg: u8, value: u8) -> HearthampResult<()> {
        self.limiter.wait_turn().await;
        let _guard = self.lock.lock().await;
        let addr = *UNIT_ADDRESSES.get(unit as usize).ok_or_else(|| HearthampError::Internal(format!("unit {} out of range", unit)))?;
        self.transact(addr, reg, Some(value))?;
        Ok(())
    }

    fn units(&self) -> Vec<u8> {
        self.detected_units.lock().clone()
    }
}

/// Convenience composite writes shared by the controller; split out so unit
/// tests can exercise the bit-packing logic without a bus at all.
pub fn pack_zone_sources(sources: &[u32; 6]) -> (u8, u8) {
    let mut zone321 = 0u8;
    let mut zone654 = 0u8;
    for (i, &src) in sources.iter().enumerate() {
        let bits = (src & 0b11) as u8;
        if i < 3 {
            zone321 |= bits << (i * 2);
        } else {
            zone654 |= bits << ((i - 3) * 2);
        }
    }
    (zone321, zone654)
}

pub fn pack_bitmask(flags: &[bool; 6]) -> u8 {
    flags.iter().enumerate().fold(0u8, |acc, (i, &f)| if f { acc | (1 << i) } else { acc })
}

/// Shared constructor used by the composition root to pick the bus impl.
pub fn make_bus(mock: bool, ops_per_sec: u32) -> Arc<dyn HardwareBus> {
    if mock {
        Arc::new(MockBus::new(ops_per_sec, 6))
    } else {
        Arc::new(RealBus::new("/dev/i2c-1", "/dev/ttyS0", ops_per_sec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_bus_echoes_writes() {
        let bus = MockBus::new(500, 6);
        bus.init().await.unwrap();
        bus.write(0, 0x05, 42).await.unwrap();
        assert_eq!(bus.read(0, 0x05).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn mock_bus_with_no_units_fails_init() {
        let bus = MockBus::new(500, 0);
        assert!(bus.init().await.is_err());
    }

    #[test]
    fn pack_zone_sources_packs_two_bits_each() {
        let (z321, z654) = pack_zone_sources(&[1, 2, 3, 0, 1, 2]);
        assert_eq!(z321, 0b11_10_01);
        assert_eq!(z654, 0b00_10_01);
    }

    #[test]
    fn pack_bitmask_sets_matching_bits() {
        assert_eq!(pack_bitmask(&[true, false, true, false, false, false]), 0b0000_0101);
    }
}
