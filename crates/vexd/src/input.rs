//! Keyboard surveillance and input-latency injection.
//!
//! Keyboards are found by probing capability sets (presence of a common
//! alphabetic key) or a "keyboard" device name. A reader task per device
//! consumes evdev events; key presses bump two aggregate counters: total
//! keystrokes and Enter presses. No keycodes, characters, or buffers are
//! ever persisted or logged; only the aggregates exist. That is a contract,
//! not an optimization.
//!
//! When a latency is armed, the configured sleep is applied before each
//! press is counted, perceptibly delaying input by that amount. Setting
//! zero restores pass-through.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Environment variable overriding device discovery with one device path.
pub const DEVICE_PATH_ENV: &str = "VEX_DEVICE_PATH";

/// Linux input event type for key events.
const EV_KEY: u16 = 1;
/// Key code for Enter.
const KEY_ENTER: u16 = 28;
/// Key code for the letter A, used as the keyboard capability probe.
const KEY_A: u16 = 30;
/// Event value for a key press (not hold or release).
const VALUE_PRESS: i32 = 1;

/// Interval between aggregate metric reports.
const REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Aggregate-only typing metrics.
pub struct InputMetrics {
    keystrokes: AtomicU64,
    lines: AtomicU64,
    started: Instant,
}

impl InputMetrics {
    fn new() -> Self {
        Self {
            keystrokes: AtomicU64::new(0),
            lines: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// Counts one key press; Enter also counts a line.
    pub fn count_press(&self, code: u16) {
        self.keystrokes.fetch_add(1, Ordering::Relaxed);
        if code == KEY_ENTER {
            self.lines.fetch_add(1, Ordering::Relaxed);
        }
        // Zero-storage policy: the keycode goes no further than this branch.
    }

    /// `(total keystrokes, line terminators)` so far.
    #[must_use]
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.keystrokes.load(Ordering::Relaxed),
            self.lines.load(Ordering::Relaxed),
        )
    }

    /// Keystrokes per minute since startup; 0 before any time has passed.
    #[must_use]
    pub fn current_kpm(&self) -> f64 {
        let minutes = self.started.elapsed().as_secs_f64() / 60.0;
        if minutes <= 0.0 {
            return 0.0;
        }
        self.keystrokes.load(Ordering::Relaxed) as f64 / minutes
    }
}

/// The input surveillance coordinator.
pub struct InputMonitor {
    metrics: Arc<InputMetrics>,
    latency_ms: Arc<AtomicU64>,
    reporter: Mutex<Option<JoinHandle<()>>>,
}

impl InputMonitor {
    /// A monitor with zero counters and pass-through latency.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            metrics: Arc::new(InputMetrics::new()),
            latency_ms: Arc::new(AtomicU64::new(0)),
            reporter: Mutex::new(None),
        })
    }

    /// Shared metrics handle (for the penance validator).
    #[must_use]
    pub fn metrics(&self) -> Arc<InputMetrics> {
        self.metrics.clone()
    }

    /// Current injected latency in milliseconds.
    #[must_use]
    pub fn latency_ms(&self) -> u64 {
        self.latency_ms.load(Ordering::Relaxed)
    }

    /// Arms (or, with 0, disarms) the input latency.
    pub fn set_latency(&self, ms: u64) {
        self.latency_ms.store(ms, Ordering::Relaxed);
        info!(latency_ms = ms, "input latency set");
    }

    /// Keystrokes per minute since startup.
    #[must_use]
    pub fn current_kpm(&self) -> f64 {
        self.metrics.current_kpm()
    }

    /// Discovers keyboards and spawns reader tasks plus the periodic
    /// aggregate reporter. Returns the number of devices attached.
    pub fn start(self: &Arc<Self>) -> usize {
        let mut attached = 0;

        if let Ok(path) = std::env::var(DEVICE_PATH_ENV) {
            if !path.is_empty() {
                info!(device = %path, "using explicit input device");
                if self.attach(Path::new(&path)) {
                    attached += 1;
                }
            }
        }

        if attached == 0 {
            for device in discover_keyboards(Path::new("/dev/input"), Path::new("/sys/class/input"))
            {
                if self.attach(&device) {
                    attached += 1;
                }
            }
        }

        if attached == 0 {
            warn!("no keyboards detected to monitor");
        }

        let metrics = self.metrics.clone();
        let reporter = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REPORT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let (keys, lines) = metrics.snapshot();
                info!(
                    keystrokes = keys,
                    kpm = metrics.current_kpm(),
                    lines,
                    "surveillance aggregates"
                );
            }
        });
        *self
            .reporter
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(reporter);

        attached
    }

    /// Stops the aggregate reporter. Device readers end when their device
    /// closes or the process exits.
    pub fn stop(&self) {
        if let Some(handle) = self
            .reporter
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }

    fn attach(self: &Arc<Self>, device: &Path) -> bool {
        let file = match std::fs::File::open(device) {
            Ok(f) => f,
            Err(e) => {
                warn!(device = %device.display(), error = %e, "cannot open input device");
                return false;
            }
        };
        info!(device = %device.display(), "attached keyboard listener");

        let metrics = self.metrics.clone();
        let latency = self.latency_ms.clone();
        let path = device.to_path_buf();
        tokio::task::spawn_blocking(move || {
            read_events(file, &path, &metrics, &latency);
        });
        true
    }
}

/// Blocking reader loop over one evdev device.
fn read_events(
    mut file: std::fs::File,
    path: &Path,
    metrics: &InputMetrics,
    latency_ms: &AtomicU64,
) {
    let event_size = std::mem::size_of::<nix::libc::input_event>();
    let time_size = std::mem::size_of::<nix::libc::timeval>();
    let mut buf = vec![0u8; event_size];

    loop {
        if let Err(e) = file.read_exact(&mut buf) {
            debug!(device = %path.display(), error = %e, "input reader stopped");
            return;
        }
        let ev_type = u16::from_ne_bytes([buf[time_size], buf[time_size + 1]]);
        let code = u16::from_ne_bytes([buf[time_size + 2], buf[time_size + 3]]);
        let value = i32::from_ne_bytes(
            buf[time_size + 4..time_size + 8]
                .try_into()
                .expect("4 bytes"),
        );

        if ev_type != EV_KEY || value != VALUE_PRESS {
            continue;
        }

        let delay = latency_ms.load(Ordering::Relaxed);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        metrics.count_press(code);
    }
}

/// Enumerates `eventN` devices that look like keyboards.
fn discover_keyboards(dev_input: &Path, sys_input: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dev_input) else {
        return Vec::new();
    };

    let mut keyboards = Vec::new();
    for entry in entries.filter_map(Result::ok) {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with("event") {
            continue;
        }
        let sys_dir = sys_input.join(&name).join("device");
        if is_keyboard(&sys_dir) {
            keyboards.push(entry.path());
        }
    }
    keyboards.sort();
    keyboards
}

/// A device is a keyboard if its key capability bitmap contains an
/// alphabetic key, or its name mentions "keyboard".
fn is_keyboard(sys_device_dir: &Path) -> bool {
    if let Ok(bitmap) = std::fs::read_to_string(sys_device_dir.join("capabilities/key")) {
        if key_bitmap_has(&bitmap, KEY_A) {
            return true;
        }
    }
    if let Ok(name) = std::fs::read_to_string(sys_device_dir.join("name")) {
        if name.to_lowercase().contains("keyboard") {
            return true;
        }
    }
    false
}

/// Tests a bit in a sysfs key-capability bitmap.
///
/// The bitmap is space-separated hex words, most significant first, each
/// covering 64 key codes on 64-bit kernels.
fn key_bitmap_has(bitmap: &str, code: u16) -> bool {
    let words: Vec<u64> = bitmap
        .split_whitespace()
        .rev()
        .map(|w| u64::from_str_radix(w, 16).unwrap_or(0))
        .collect();
    let index = usize::from(code) / 64;
    let bit = u32::from(code) % 64;
    words
        .get(index)
        .is_some_and(|word| word & (1u64 << bit) != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_bitmap_detects_alphabetic_keys() {
        // A full keyboard bitmap: every bit in the low word set.
        assert!(key_bitmap_has("fffffffffffffffe", KEY_A));
        // Only bit 30 (KEY_A) set.
        assert!(key_bitmap_has("40000000", KEY_A));
        // Bit 30 clear.
        assert!(!key_bitmap_has("1", KEY_A));
        // Multi-word bitmap with only high bits set.
        assert!(!key_bitmap_has("ffffffff 0", KEY_A));
        assert!(key_bitmap_has("ffffffff 40000000", KEY_A));
    }

    #[test]
    fn garbled_bitmap_is_not_a_keyboard() {
        assert!(!key_bitmap_has("zz zz", KEY_A));
        assert!(!key_bitmap_has("", KEY_A));
    }

    #[test]
    fn keyboard_detection_by_name_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("device");
        std::fs::create_dir_all(&device).unwrap();
        std::fs::write(device.join("name"), "AT Translated Set 2 Keyboard\n").unwrap();
        assert!(is_keyboard(&device));

        std::fs::write(device.join("name"), "Logitech Gaming Mouse\n").unwrap();
        assert!(!is_keyboard(&device));
    }

    #[test]
    fn keyboard_detection_by_capability_bitmap() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("device");
        std::fs::create_dir_all(device.join("capabilities")).unwrap();
        std::fs::write(device.join("name"), "Weird Vendor Device\n").unwrap();
        std::fs::write(device.join("capabilities/key"), "40000000\n").unwrap();
        assert!(is_keyboard(&device));
    }

    #[test]
    fn metrics_count_presses_and_lines() {
        let metrics = InputMetrics::new();
        metrics.count_press(KEY_A);
        metrics.count_press(KEY_A);
        metrics.count_press(KEY_ENTER);
        assert_eq!(metrics.snapshot(), (3, 1));
    }

    #[test]
    fn kpm_reflects_elapsed_time() {
        let metrics = InputMetrics::new();
        for _ in 0..10 {
            metrics.count_press(KEY_A);
        }
        std::thread::sleep(Duration::from_millis(30));
        let kpm = metrics.current_kpm();
        assert!(kpm > 0.0);
    }

    #[tokio::test]
    async fn latency_round_trips_through_monitor() {
        let monitor = InputMonitor::new();
        assert_eq!(monitor.latency_ms(), 0);
        monitor.set_latency(250);
        assert_eq!(monitor.latency_ms(), 250);
        monitor.set_latency(0);
        assert_eq!(monitor.latency_ms(), 0);
    }

    #[test]
    fn discovery_filters_non_event_entries() {
        let dir = tempfile::tempdir().unwrap();
        let dev = dir.path().join("dev");
        let sys = dir.path().join("sys");
        std::fs::create_dir_all(dev.join("by-id")).unwrap();
        std::fs::write(dev.join("mice"), b"").unwrap();
        std::fs::write(dev.join("event0"), b"").unwrap();
        let event0_device = sys.join("event0/device");
        std::fs::create_dir_all(&event0_device).unwrap();
        std::fs::write(event0_device.join("name"), "USB Keyboard\n").unwrap();

        let found = discover_keyboards(&dev, &sys);
        assert_eq!(found, vec![dev.join("event0")]);
    }
}
