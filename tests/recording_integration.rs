//! End-to-end recording scenarios against mock sources.
//!
//! Every scenario compares what was recorded with the exact bytes the mock
//! source delivered, so any dropped or duplicated byte fails the test.

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tsrec_engine::recording::{
    MemoryPersister, MemoryPersisterHandle, RecordEngine, RecordSession, RecordState,
    RecordStatus, RecorderConfig,
};
use tsrec_engine::source::{MockSource, MockSourceConfig, Pid, ReadOutcome, SourceReader};
use tsrec_engine::EngineError;

const VPID: Pid = 0x100;

fn engine(buffer_size: usize, read_chunk: usize) -> RecordEngine {
    RecordEngine::new(RecorderConfig {
        buffer_size,
        read_chunk: Some(read_chunk),
        read_timeout_ms: 5,
        poll_interval_ms: 1,
        drain_poll_interval_ms: 1,
        ..Default::default()
    })
    .unwrap()
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(20);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}

fn start(
    engine: &RecordEngine,
    source: &Arc<MockSource>,
    persister: MemoryPersister,
) -> RecordSession {
    engine
        .start_with_persister(source.clone(), Box::new(persister), VPID, &[0x101, 0x102])
        .unwrap()
}

fn assert_lossless(source: &MockSource, handle: &MemoryPersisterHandle) {
    let recorded = handle.contents();
    let delivered = source.delivered();
    assert_eq!(recorded.len(), delivered.len());
    assert!(recorded == delivered, "recorded stream differs from source");
}

#[test]
fn test_instant_persister_keeps_up() {
    let engine = engine(2 << 20, 128 * 1024);
    let source = Arc::new(MockSource::endless(128 * 1024));
    let (persister, handle) = MemoryPersister::instant();
    let mut session = start(&engine, &source, persister);

    let mut statuses = Vec::new();
    assert!(wait_until(|| {
        statuses.push(session.status());
        session.stats().bytes_read >= 8 << 20
    }));

    let report = session.stop().unwrap();
    assert!(statuses.iter().all(|s| *s == RecordStatus::Ok));
    assert_eq!(report.final_state, RecordState::Stopped);
    assert_eq!(report.overflow_episodes, 0);
    assert_eq!(report.bytes_written, report.bytes_read);
    assert_lossless(&source, &handle);
}

#[test]
fn test_fixed_latency_persister_is_absorbed() {
    let engine = engine(2 << 20, 128 * 1024);
    let source = Arc::new(MockSource::finite(128 * 1024, 6 << 20));
    let (persister, handle) = MemoryPersister::new(3);
    let mut session = start(&engine, &source, persister);

    // Each submit takes the whole backlog, so a write finishing 4 cycles
    // later covers the 4 chunks read meanwhile: the buffer peaks near
    // 640 KiB and never fills.
    let mut statuses = Vec::new();
    assert!(wait_until(|| {
        statuses.push(session.status());
        source.is_exhausted()
    }));
    let report = session.stop().unwrap();

    assert!(statuses.iter().all(|s| *s == RecordStatus::Ok));
    assert_eq!(report.overflow_episodes, 0);
    assert_eq!(report.final_state, RecordState::Stopped);
    assert_eq!(report.bytes_written, 6 << 20);
    assert_lossless(&source, &handle);
}

#[test]
fn test_slow_disk_overflows_then_clears() {
    let engine = engine(2 << 20, 128 * 1024);
    let source = Arc::new(MockSource::finite(128 * 1024, 8 << 20));
    // disk absorbs half of what the source delivers per cycle
    let (persister, handle) = MemoryPersister::with_throughput(64 * 1024);
    let mut session = start(&engine, &source, persister);

    let mut saw_overflow = false;
    assert!(wait_until(|| {
        if session.status() == RecordStatus::Overflow {
            saw_overflow = true;
        }
        session.stats().bytes_written == 8 << 20
    }));

    assert!(saw_overflow);
    assert_eq!(session.state(), RecordState::Running);
    assert_eq!(session.status(), RecordStatus::Slow);

    let report = session.stop().unwrap();
    assert_eq!(report.final_state, RecordState::Stopped);
    assert!(report.overflow_episodes >= 1);
    assert_lossless(&source, &handle);
}

#[test]
fn test_back_to_back_sessions_on_one_source() {
    let engine = engine(64 * 1024, 4 * 1024);
    let source = Arc::new(MockSource::endless(4 * 1024));

    let (persister, _first) = MemoryPersister::instant();
    let mut session = engine
        .start_with_persister(source.clone(), Box::new(persister), VPID, &[0x101])
        .unwrap();
    session.stop().unwrap();
    assert!(source.current_pids().is_empty());
    assert!(!source.is_open());

    let (persister, _second) = MemoryPersister::instant();
    let mut session = engine
        .start_with_persister(source.clone(), Box::new(persister), VPID, &[0x102])
        .unwrap();
    assert_eq!(session.active_pids(), vec![VPID, 0x102]);
    session.stop().unwrap();
}

#[test]
fn test_overflow_recovers_without_loss() {
    let engine = engine(256 * 1024, 16 * 1024);
    let source = Arc::new(MockSource::finite(16 * 1024, 1 << 20));
    let (persister, handle) = MemoryPersister::instant();
    handle.set_stalled(true);
    let mut session = start(&engine, &source, persister);

    assert!(wait_until(|| session.status() == RecordStatus::Overflow));
    assert_eq!(session.state(), RecordState::FailedOverflow);

    handle.set_stalled(false);
    assert!(wait_until(|| session.stats().bytes_written == 1 << 20));

    // overflow is over but stays visible until acknowledged
    assert_eq!(session.state(), RecordState::Running);
    assert_eq!(session.status(), RecordStatus::Slow);
    session.reset_status();
    assert_eq!(session.status(), RecordStatus::Ok);

    let report = session.stop().unwrap();
    assert_eq!(report.final_state, RecordState::Stopped);
    assert!(report.overflow_episodes >= 1);
    assert_lossless(&source, &handle);
}

#[test]
fn test_slow_source_never_overflows() {
    let engine = engine(64 * 1024, 4 * 1024);
    let source = Arc::new(MockSource::new(MockSourceConfig {
        chunk_size: 4 * 1024,
        read_delay: Duration::from_millis(2),
        ..Default::default()
    }));
    let (persister, handle) = MemoryPersister::new(1);
    let mut session = start(&engine, &source, persister);

    let deadline = Instant::now() + Duration::from_millis(200);
    while Instant::now() < deadline {
        assert_ne!(session.status(), RecordStatus::Overflow);
        std::thread::sleep(Duration::from_millis(1));
    }

    let report = session.stop().unwrap();
    assert_eq!(report.overflow_episodes, 0);
    assert_eq!(session.status(), RecordStatus::Ok);
    assert_lossless(&source, &handle);
}

#[test]
fn test_stop_during_overflow_flushes_everything() {
    let engine = engine(64 * 1024, 8 * 1024);
    let source = Arc::new(MockSource::endless(8 * 1024));
    let (persister, handle) = MemoryPersister::instant();
    handle.set_stalled(true);
    let mut session = start(&engine, &source, persister);

    assert!(wait_until(|| session.status() == RecordStatus::Overflow));

    let gate = handle.clone();
    let releaser = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        gate.set_stalled(false);
    });

    let report = session.stop().unwrap();
    releaser.join().unwrap();

    assert_eq!(report.final_state, RecordState::Stopped);
    assert_eq!(report.bytes_written, report.bytes_read);
    assert!(report.bytes_written >= 64 * 1024);
    assert!(handle.is_closed());
    assert_lossless(&source, &handle);
}

#[test]
fn test_read_failure_leaves_valid_prefix() {
    let engine = engine(64 * 1024, 4 * 1024);
    let source = Arc::new(MockSource::new(MockSourceConfig {
        chunk_size: 1024,
        fail_after_reads: Some(10),
        ..Default::default()
    }));
    let (persister, handle) = MemoryPersister::instant();
    let mut session = start(&engine, &source, persister);

    assert!(wait_until(|| session.state() == RecordState::FailedRead));
    assert_eq!(session.status(), RecordStatus::Overflow);

    // a failed session does not recover on its own
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(session.state(), RecordState::FailedRead);

    let report = session.stop().unwrap();
    assert_eq!(report.final_state, RecordState::FailedRead);
    assert_eq!(report.bytes_written, 10 * 1024);
    assert_eq!(session.state(), RecordState::Stopped);
    assert_lossless(&source, &handle);
}

#[test]
fn test_write_failure_is_reported() {
    let engine = engine(64 * 1024, 4 * 1024);
    let source = Arc::new(MockSource::endless(4 * 1024));
    let (persister, handle) = MemoryPersister::instant();
    handle.fail_next_write();
    let mut session = start(&engine, &source, persister);

    assert!(wait_until(|| session.state() == RecordState::FailedFile));
    assert_eq!(session.status(), RecordStatus::Overflow);
    session.reset_status();
    assert_eq!(session.status(), RecordStatus::Overflow);

    let report = session.stop().unwrap();
    assert_eq!(report.final_state, RecordState::FailedFile);
    assert_eq!(report.bytes_written, 0);
    assert!(handle.is_closed());
}

#[test]
fn test_pid_changes_while_recording() {
    let engine = engine(64 * 1024, 4 * 1024);
    let source = Arc::new(MockSource::endless(188 * 7));
    let (persister, _handle) = MemoryPersister::instant();
    let mut session = start(&engine, &source, persister);

    assert_eq!(session.active_pids(), vec![VPID, 0x101, 0x102]);

    session.add_pid(0x103).unwrap();
    let once = session.active_pids();
    session.add_pid(0x103).unwrap();
    assert_eq!(session.active_pids(), once);

    session.change_pids(&[0x102, 0x104]).unwrap();
    let calls = (source.add_calls(), source.remove_calls());
    session.change_pids(&[0x104, 0x102]).unwrap();
    assert_eq!((source.add_calls(), source.remove_calls()), calls);
    assert_eq!(session.active_pids(), vec![VPID, 0x102, 0x104]);

    session.stop().unwrap();
    assert!(matches!(session.add_pid(0x105), Err(EngineError::SourceDetached)));
    assert!(session.stop().is_ok());
}

#[test]
fn test_file_persister_end_to_end() {
    let engine = engine(256 * 1024, 16 * 1024);
    let source = Arc::new(MockSource::finite(16 * 1024, 3 << 20));

    let mut existing = tempfile::NamedTempFile::new().unwrap();
    existing.write_all(b"previous recording|").unwrap();
    existing.flush().unwrap();
    let file = std::fs::OpenOptions::new()
        .append(true)
        .open(existing.path())
        .unwrap();

    let mut session = engine.start(source.clone(), file, VPID, &[]).unwrap();
    assert!(wait_until(|| source.is_exhausted()));
    let report = session.stop().unwrap();

    assert_eq!(report.final_state, RecordState::Stopped);
    assert_eq!(report.bytes_written, 3 << 20);

    let on_disk = std::fs::read(existing.path()).unwrap();
    let (header, body) = on_disk.split_at(b"previous recording|".len());
    assert_eq!(header, b"previous recording|");
    assert!(body == source.delivered().as_slice());
}

struct UnopenableSource;

impl SourceReader for UnopenableSource {
    fn open(&self, _buffer_hint: usize) -> tsrec_engine::Result<()> {
        Err(EngineError::SourceFailed("no such device".to_string()))
    }
    fn set_primary_pid(&self, _pid: Pid) -> tsrec_engine::Result<()> {
        Ok(())
    }
    fn add_pid(&self, _pid: Pid) -> tsrec_engine::Result<()> {
        Ok(())
    }
    fn remove_pid(&self, _pid: Pid) {}
    fn start(&self) -> tsrec_engine::Result<()> {
        Ok(())
    }
    fn stop(&self) {}
    fn read(&self, _dst: &mut [u8], timeout: Duration) -> tsrec_engine::Result<ReadOutcome> {
        std::thread::sleep(timeout);
        Ok(ReadOutcome::Empty)
    }
    fn current_pids(&self) -> Vec<Pid> {
        Vec::new()
    }
    fn close(&self) {}
}

#[test]
fn test_failed_start_leaves_nothing_behind() {
    let engine = engine(64 * 1024, 4 * 1024);
    let (persister, handle) = MemoryPersister::instant();
    let result = engine.start_with_persister(
        Arc::new(UnopenableSource),
        Box::new(persister),
        VPID,
        &[],
    );
    assert!(matches!(result, Err(EngineError::SourceFailed(_))));
    assert!(handle.is_empty());

    let engine = RecordEngine::new(RecorderConfig {
        buffer_size: usize::MAX,
        ..Default::default()
    })
    .unwrap();
    let source = Arc::new(MockSource::endless(188));
    let (persister, _handle) = MemoryPersister::instant();
    let result = engine.start_with_persister(source.clone(), Box::new(persister), VPID, &[0x101]);

    match result {
        Err(e) => assert_eq!(e.state_on_failure(), RecordState::FailedMemory),
        Ok(_) => panic!("allocation of usize::MAX bytes succeeded"),
    }
    assert!(source.current_pids().is_empty());
    assert!(!source.is_running());
}
