//! End-to-end scenarios over the public API: append/scan, named-iterator
//! recovery, uncommitted tailing, truncation, partial-append resume, and
//! crash recovery.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use futures::executor::block_on;

use durable_log::local_file::{LocalFileCommitManager, LocalFileDevice};
use durable_log::{AppendOutcome, BlockDevice, BufferingMode, DurableLog, LogSettings};

fn small_settings() -> LogSettings {
    LogSettings {
        page_size_bits: 12, // 4 KiB pages
        memory_size_bits: 14, // 4 pages resident
        segment_size_bits: 16,
        mutable_fraction: 0.75,
    }
}

fn open_log(dir: &std::path::Path, settings: LogSettings) -> Arc<DurableLog> {
    let device: Arc<dyn BlockDevice> =
        Arc::new(LocalFileDevice::new(dir.join("data"), 1 << 16).unwrap());
    let commit_manager = Arc::new(LocalFileCommitManager::new(dir.join("commits")).unwrap());
    DurableLog::open(settings, device, commit_manager).unwrap()
}

#[test]
fn s1_append_then_scan_returns_records_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let log = open_log(dir.path(), small_settings());

    let records: Vec<Vec<u8>> = (0..20).map(|i| format!("record-{i}").into_bytes()).collect();
    for r in &records {
        log.append(r).unwrap();
    }

    // None of these records are committed yet, so the scan has to opt in
    // to seeing past `CommittedUntilAddress`.
    let mut iter = log.scan(log.begin_address(), None, true).unwrap();
    let mut seen = Vec::new();
    while let Some(payload) = iter.next().unwrap() {
        seen.push(payload);
    }
    assert_eq!(seen, records);
}

#[test]
fn s2_named_iterator_resumes_from_checkpoint_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let settings = small_settings();

    {
        let log = open_log(dir.path(), settings.clone());
        for i in 0..10 {
            log.append(format!("r{i}").as_bytes()).unwrap();
        }

        let mut iter = log.scan_named("tailer", BufferingMode::SinglePage, true);
        for _ in 0..4 {
            iter.next().unwrap().expect("record present");
        }
        iter.checkpoint();
        log.flush_and_commit().unwrap();
    }

    // Simulate a restart: reopen against the same device/commit directories.
    let log = open_log(dir.path(), settings);
    let mut iter = log.scan_named("tailer", BufferingMode::SinglePage, false);
    let resumed = iter.next().unwrap().expect("record present");
    assert_eq!(resumed, b"r4");
}

#[test]
fn s3_scan_without_end_sees_uncommitted_tail() {
    let dir = tempfile::tempdir().unwrap();
    let log = open_log(dir.path(), small_settings());

    log.append(b"only record").unwrap();
    // Deliberately no flush_and_commit: the record is resident but not yet
    // durable. An open-ended scan with `scan_uncommitted = true` must still
    // observe it; the default (false) would stop at `CommittedUntilAddress`.
    let mut iter = log.scan(log.begin_address(), None, true).unwrap();
    let payload = iter.next().unwrap().expect("uncommitted record visible");
    assert_eq!(payload, b"only record");
}

#[test]
fn s4_truncation_clamps_scans_to_the_new_begin_address() {
    let dir = tempfile::tempdir().unwrap();
    let log = open_log(dir.path(), small_settings());

    let mut addresses = Vec::new();
    for i in 0..5 {
        addresses.push(log.append(format!("r{i}").as_bytes()).unwrap());
    }
    log.flush_and_commit().unwrap();

    let cutoff = addresses[2];
    log.truncate_until(cutoff).unwrap();

    let mut iter = log.scan(log.begin_address(), None, false).unwrap();
    assert_eq!(iter.current_address(), cutoff);
    let first = iter.next().unwrap().expect("record at or after cutoff");
    assert_eq!(first, b"r2");
}

#[test]
fn s5_pending_allocation_resumes_once_the_blocking_page_flush_clears() {
    let dir = tempfile::tempdir().unwrap();
    let gate = Arc::new(FlushGate::new());
    let inner = LocalFileDevice::new(dir.path().join("data"), 1 << 16).unwrap();
    let device: Arc<dyn BlockDevice> = Arc::new(GatedDevice {
        inner,
        gate: gate.clone(),
    });
    let commit_manager = Arc::new(LocalFileCommitManager::new(dir.path().join("commits")).unwrap());

    // A 2-page ring: filling both pages and rolling over forces the third
    // page-worth of writes to contend for a slot that's still flushing.
    let settings = LogSettings {
        page_size_bits: 8, // 256-byte pages
        memory_size_bits: 9, // 2 pages resident
        segment_size_bits: 16,
        mutable_fraction: 0.5,
    };
    let log = DurableLog::open(settings, device, commit_manager).unwrap();

    let payload = vec![7u8; 100];
    // Fill page 0, roll it to read-only (flush blocked by the gate), then
    // fill page 1 so the next record must cross back into page 0's slot.
    log.append(&payload).unwrap();
    log.append(&payload).unwrap();

    let mut pending = None;
    let mut saw_pending = false;
    let outcome = loop {
        match log.try_append(&payload, &mut pending).unwrap() {
            AppendOutcome::Done(addr) => break addr,
            AppendOutcome::Pending => {
                saw_pending = true;
                gate.release();
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            AppendOutcome::Restart => {
                pending = None;
            }
        }
    };

    assert!(saw_pending, "expected the allocator to report backpressure at least once");
    assert!(outcome > 0);
}

#[test]
fn s6_crash_recovery_restores_committed_state_and_readable_records() {
    let dir = tempfile::tempdir().unwrap();
    let settings = small_settings();

    let committed_until = {
        let log = open_log(dir.path(), settings.clone());
        for i in 0..8 {
            log.append(format!("durable-{i}").as_bytes()).unwrap();
        }
        log.flush_and_commit().unwrap()
    };

    // No graceful shutdown call exists or is needed: dropping `log` here
    // stands in for a crash, since all durability is already on disk.
    let recovered = open_log(dir.path(), settings);
    assert_eq!(recovered.flushed_until_address(), committed_until);
    assert_eq!(recovered.begin_address(), durable_log::FIRST_VALID_ADDRESS);

    let mut iter = recovered.scan(recovered.begin_address(), Some(committed_until), false).unwrap();
    let mut count = 0;
    while iter.next().unwrap().is_some() {
        count += 1;
    }
    assert_eq!(count, 8);
}

#[test]
fn s7_async_append_and_commit_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let log = open_log(dir.path(), small_settings());

    // `append_to_memory_async` returns as soon as the record is resident,
    // without waiting for it to commit.
    let addr = block_on(log.append_to_memory_async(b"async record")).unwrap();
    assert!(log.committed_until_address() <= addr);

    // Nothing auto-triggers a commit for a payload this small under
    // `mutable_fraction`, so `append_async`/`wait_for_commit_async` would
    // hang forever without something else flushing. Stand in for a second
    // writer/background task that commits on its own schedule.
    let committer = {
        let log = log.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            log.flush_and_commit().unwrap();
        })
    };

    let committed_addr = block_on(log.append_async(b"second async record")).unwrap();
    committer.join().unwrap();

    assert!(log.committed_until_address() > committed_addr);
}

struct FlushGate {
    released: AtomicBool,
    cv: Condvar,
    lock: Mutex<()>,
}

impl FlushGate {
    fn new() -> Self {
        FlushGate {
            released: AtomicBool::new(false),
            cv: Condvar::new(),
            lock: Mutex::new(()),
        }
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut guard = self.lock.lock().unwrap();
        while !self.released.load(Ordering::SeqCst) {
            guard = self.cv.wait(guard).unwrap();
        }
    }
}

struct GatedDevice {
    inner: LocalFileDevice,
    gate: Arc<FlushGate>,
}

impl BlockDevice for GatedDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read_at(offset, buf)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.gate.wait();
        self.inner.write_at(offset, buf)
    }

    fn sync(&self) -> io::Result<()> {
        self.inner.sync()
    }

    fn segment_size(&self) -> u64 {
        self.inner.segment_size()
    }
}
