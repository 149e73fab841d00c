//! Timer tick accounting and CPU timing calibration.
//!
//! The periodic APIC timer drives `on_tick()` on every core; the tick
//! counters live in the per-CPU scheduler slots. Calibration figures out
//! how many TSC cycles make 10 ms, trying CPUID leaf 0x15, then leaf 0x16,
//! then a measured RTC second, and finally a conservative constant.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::sched;

/// Scheduler tick frequency.
pub const TICK_HZ: u32 = 100;

/// Milliseconds per tick.
pub const TICK_MS: u64 = 1000 / TICK_HZ as u64;

/// Last-resort calibration value: a 2.4 GHz part.
pub const FALLBACK_CYCLES_PER_10MS: u64 = 24_000_000;

/// Calibrated TSC cycles per 10 ms (0 = not calibrated yet).
static CYCLES_PER_10MS: AtomicU64 = AtomicU64::new(0);

/// Ticks observed by the boot CPU, for a cheap global uptime.
static UPTIME_TICKS: AtomicU64 = AtomicU64::new(0);

/// Record one timer tick on the calling core. Returns that core's tick
/// count.
pub fn on_tick() -> u64 {
    let slot = sched::current_slot();
    let ticks = slot.tick();
    if crate::arch::cpu::current_cpu_id() == 0 {
        UPTIME_TICKS.fetch_add(1, Ordering::Relaxed);
    }
    ticks
}

/// Uptime in milliseconds, as seen by the boot CPU's tick counter.
pub fn uptime_ms() -> u64 {
    UPTIME_TICKS.load(Ordering::Relaxed) * TICK_MS
}

/// TSC frequency in Hz from CPUID leaf 0x15, when the leaf is populated:
/// `tsc = crystal_hz * numerator / denominator`.
pub fn tsc_hz_from_leaf_15(denominator: u32, numerator: u32, crystal_hz: u32) -> Option<u64> {
    if denominator == 0 || numerator == 0 || crystal_hz == 0 {
        return None;
    }
    Some(crystal_hz as u64 * numerator as u64 / denominator as u64)
}

/// Cycles per 10 ms for a core running at `mhz`.
pub fn cycles_per_10ms_from_mhz(mhz: u64) -> u64 {
    mhz * 10_000
}

/// Plausibility window for a measured calibration: 100 MHz to 10 GHz.
pub fn calibration_is_sane(cycles_per_10ms: u64) -> bool {
    (1_000_000..=100_000_000).contains(&cycles_per_10ms)
}

/// The calibrated cycles-per-10ms value, calibrating on first use.
pub fn cycles_per_10ms() -> u64 {
    let cached = CYCLES_PER_10MS.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let measured = calibrate();
    CYCLES_PER_10MS.store(measured, Ordering::Relaxed);
    measured
}

/// Run the calibration ladder.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn calibrate() -> u64 {
    use log::{info, warn};

    // CPUID leaf 0x15: authoritative when the firmware fills it in.
    // SAFETY: CPUID is unprivileged and side-effect free.
    let leaf15 = unsafe { core::arch::x86_64::__cpuid(0x15) };
    if let Some(hz) = tsc_hz_from_leaf_15(leaf15.eax, leaf15.ebx, leaf15.ecx) {
        let cycles = hz / 100;
        info!("TSC calibrated via CPUID 0x15: {} cycles/10ms", cycles);
        return cycles;
    }

    // CPUID leaf 0x16 reports the base frequency in MHz.
    // SAFETY: As above.
    let leaf16 = unsafe { core::arch::x86_64::__cpuid(0x16) };
    if leaf16.eax != 0 {
        let cycles = cycles_per_10ms_from_mhz(leaf16.eax as u64);
        info!("TSC calibrated via CPUID 0x16: {} cycles/10ms", cycles);
        return cycles;
    }

    warn!("CPUID frequency detection failed, measuring against the RTC");
    let cycles = calibrate_with_rtc();
    if calibration_is_sane(cycles) {
        info!("TSC calibrated via RTC: {} cycles/10ms", cycles);
        return cycles;
    }

    warn!(
        "RTC calibration implausible ({} cycles/10ms), using the fallback",
        cycles
    );
    FALLBACK_CYCLES_PER_10MS
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn calibrate() -> u64 {
    FALLBACK_CYCLES_PER_10MS
}

/// Busy-wait for roughly `ms` milliseconds on the calibrated TSC.
///
/// For bring-up paths that have no timer interrupt to sleep on (the tick
/// itself is what is being started).
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn busy_sleep_ms(ms: u64) {
    let per_ms = cycles_per_10ms() / 10;
    let deadline = crate::arch::cpu::read_tsc() + ms * per_ms;
    while crate::arch::cpu::read_tsc() < deadline {
        core::hint::spin_loop();
    }
}

/// Measure one RTC second in TSC cycles.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn calibrate_with_rtc() -> u64 {
    use x86_64::instructions::port::Port;

    const CMOS_ADDRESS: u16 = 0x70;
    const CMOS_DATA: u16 = 0x71;
    const RTC_SECONDS: u8 = 0x00;
    const RTC_REGISTER_A: u8 = 0x0A;

    let mut addr: Port<u8> = Port::new(CMOS_ADDRESS);
    let mut data: Port<u8> = Port::new(CMOS_DATA);

    // SAFETY: CMOS index/data ports are read-only accessed here with
    // standard register indices.
    let mut read_rtc = |reg: u8| -> u8 {
        unsafe {
            addr.write(reg);
            data.read()
        }
    };

    // Wait out an in-progress RTC update, then wait for the seconds
    // register to change twice, bracketing exactly one second.
    while read_rtc(RTC_REGISTER_A) & 0x80 != 0 {}

    let start = read_rtc(RTC_SECONDS);
    let mut current = start;
    while current == start {
        current = read_rtc(RTC_SECONDS);
    }

    let tsc_start = crate::arch::cpu::read_tsc();
    let second = current;
    while current == second {
        current = read_rtc(RTC_SECONDS);
    }
    let tsc_end = crate::arch::cpu::read_tsc();

    (tsc_end - tsc_start) / 100
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn leaf_15_requires_all_fields() {
        assert_eq!(tsc_hz_from_leaf_15(0, 2, 24_000_000), None);
        assert_eq!(tsc_hz_from_leaf_15(2, 0, 24_000_000), None);
        assert_eq!(tsc_hz_from_leaf_15(2, 100, 0), None);
        // 24 MHz crystal, ratio 100/2 = 1.2 GHz.
        assert_eq!(
            tsc_hz_from_leaf_15(2, 100, 24_000_000),
            Some(1_200_000_000)
        );
    }

    #[test]
    fn mhz_conversion_and_sanity_window() {
        assert_eq!(cycles_per_10ms_from_mhz(3000), 30_000_000);
        assert!(calibration_is_sane(FALLBACK_CYCLES_PER_10MS));
        assert!(calibration_is_sane(cycles_per_10ms_from_mhz(3000)));
        assert!(!calibration_is_sane(0));
        assert!(!calibration_is_sane(u64::MAX));
    }

    #[test]
    fn fallback_calibration_on_host() {
        assert_eq!(cycles_per_10ms(), FALLBACK_CYCLES_PER_10MS);
    }

    #[test]
    fn tick_arithmetic() {
        assert_eq!(TICK_MS, 10);
        let before = uptime_ms();
        on_tick();
        assert!(uptime_ms() >= before + TICK_MS);
    }
}
