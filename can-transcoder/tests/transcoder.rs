// End-to-end behaviour of the Transcoder facade over in-memory and custom sinks
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use can_transcoder::{
    BackpressurePolicy, Batch, CanFrame, Destination, MemorySink, RecordStatus, Sink,
    TimestampedFrame, Transcoder, TranscoderConfig, TranscoderError,
};

const DBC: &str = r#"
VERSION "1.0"

BU_: ECU1 ECU2

BO_ 100 Speed: 8 Vector__XXX
 SG_ VehicleSpeed : 0|16@1+ (0.01,0) [0|655.35] "km/h" Vector__XXX

BO_ 200 Engine: 8 ECU1
 SG_ Rpm : 7|16@0+ (0.25,0) [0|16383.75] "rpm" ECU2
 SG_ CoolantTemp : 23|8@0- (1,40) [-88|167] "degC" ECU2
"#;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn frame(seq: u64, can_id: u32, data: &[u8]) -> TimestampedFrame {
    TimestampedFrame::from_nanos(seq * 1_000, CanFrame::new(can_id, data).unwrap())
}

#[test]
fn exact_count_and_order_across_batch_thresholds() -> anyhow::Result<()> {
    init_logging();
    let sink = MemorySink::new();
    let config = TranscoderConfig::new()
        .with_batch_size(64)
        .with_max_batch_age(Duration::from_secs(600));
    let transcoder = Transcoder::with_sinks(vec![Box::new(sink.clone())], config)?;
    transcoder.parse_dbc(DBC)?;

    let n: u64 = 1_000;
    for seq in 0..n {
        let speed = (seq as u16).to_le_bytes();
        transcoder.receive_raw_message(frame(seq, 100, &[speed[0], speed[1], 0, 0, 0, 0, 0, 0]))?;
    }
    transcoder.flush_all_batches()?;

    let records = sink.records();
    assert_eq!(records.len(), n as usize);
    for (seq, record) in records.iter().enumerate() {
        assert_eq!(record.frame.data()[..2], (seq as u16).to_le_bytes());
        assert_eq!(record.status, RecordStatus::Decoded);
    }

    let stats = transcoder.stats();
    assert_eq!(stats.frames_submitted, n);
    assert_eq!(stats.records_written, n);
    assert_eq!(stats.batches_written, 16);

    transcoder.shutdown()?;
    Ok(())
}

#[test]
fn zero_frames_then_flush() -> anyhow::Result<()> {
    let sink = MemorySink::new();
    let transcoder = Transcoder::with_sinks(vec![Box::new(sink.clone())], TranscoderConfig::default())?;
    transcoder.flush_all_batches()?;
    transcoder.flush_all_batches()?;
    assert!(sink.is_empty());
    transcoder.shutdown()?;
    Ok(())
}

#[test]
fn motorola_and_unknown_frames() -> anyhow::Result<()> {
    let sink = MemorySink::new();
    let transcoder = Transcoder::with_sinks(vec![Box::new(sink.clone())], TranscoderConfig::default())?;
    transcoder.parse_dbc(DBC)?;

    // Rpm = 0x1F40 * 0.25 = 2000, CoolantTemp = -10 + 40 = 30
    transcoder.receive_raw_message(frame(1, 200, &[0x1F, 0x40, 0xF6, 0, 0, 0, 0, 0]))?;
    transcoder.receive_raw_message(frame(2, 0x555, &[0xDE, 0xAD]))?;
    transcoder.flush_all_batches()?;

    let records = sink.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].message_name.as_deref(), Some("Engine"));
    assert_eq!(records[0].value("Rpm"), Some(2000.0));
    assert_eq!(records[0].value("CoolantTemp"), Some(30.0));

    assert!(records[1].is_unknown());
    assert_eq!(records[1].frame.data(), &[0xDE, 0xAD]);
    assert_eq!(transcoder.stats().unknown_frames, 1);
    Ok(())
}

#[test]
fn reparse_replaces_definition() -> anyhow::Result<()> {
    let sink = MemorySink::new();
    let transcoder = Transcoder::with_sinks(vec![Box::new(sink.clone())], TranscoderConfig::default())?;

    transcoder.receive_raw_message(frame(1, 100, &[0xE8, 0x03]))?;
    transcoder.flush_all_batches()?;

    let stats = transcoder.parse_dbc(DBC)?;
    assert_eq!(stats.num_messages, 2);
    assert_eq!(transcoder.network().version(), Some("1.0"));

    transcoder.receive_raw_message(frame(2, 100, &[0xE8, 0x03]))?;
    transcoder.flush_all_batches()?;

    let records = sink.records();
    assert!(records[0].is_unknown());
    assert_eq!(records[1].value("VehicleSpeed"), Some(10.0));
    Ok(())
}

#[test]
fn create_fails_without_partial_state() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let result = Transcoder::create(
        Destination::Both {
            csv_dir: file.path().join("csv"),
            sql_path: file.path().with_extension("db"),
        },
        TranscoderConfig::default(),
    );
    assert!(matches!(result, Err(TranscoderError::SinkUnavailable(_))));
}

/// Sink that sleeps on every write; optionally fails until told otherwise
#[derive(Clone)]
struct ScriptedSink {
    delay: Duration,
    failing: Arc<Mutex<bool>>,
    inner: MemorySink,
}

impl ScriptedSink {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            failing: Arc::new(Mutex::new(false)),
            inner: MemorySink::new(),
        }
    }
}

impl Sink for ScriptedSink {
    fn name(&self) -> &str {
        "scripted"
    }

    fn write_batch(&mut self, batch: &Batch) -> can_transcoder::Result<()> {
        std::thread::sleep(self.delay);
        if *self.failing.lock().unwrap() {
            return Err(TranscoderError::SinkWrite("device unavailable".into()));
        }
        self.inner.write_batch(batch)
    }

    fn flush(&mut self) -> can_transcoder::Result<()> {
        Ok(())
    }
}

#[test]
fn block_policy_delivers_everything() -> anyhow::Result<()> {
    let sink = ScriptedSink::new(Duration::from_millis(2));
    let config = TranscoderConfig::new()
        .with_batch_size(10)
        .with_queue_capacity(4)
        .with_backpressure(BackpressurePolicy::Block);
    let transcoder = Transcoder::with_sinks(vec![Box::new(sink.clone())], config)?;

    for seq in 0..500 {
        transcoder.receive_raw_message(frame(seq, 1, &[]))?;
    }
    transcoder.flush_all_batches()?;

    assert_eq!(sink.inner.len(), 500);
    let stats = transcoder.stats();
    assert_eq!(stats.frames_dropped, 0);
    assert!(stats.backpressure_events > 0);
    Ok(())
}

#[test]
fn drop_oldest_policy_counts_losses() -> anyhow::Result<()> {
    let sink = ScriptedSink::new(Duration::from_millis(20));
    let config = TranscoderConfig::new()
        .with_batch_size(1)
        .with_queue_capacity(2)
        .with_backpressure(BackpressurePolicy::DropOldest);
    let transcoder = Transcoder::with_sinks(vec![Box::new(sink.clone())], config)?;

    for seq in 0..200 {
        transcoder.receive_raw_message(frame(seq, 1, &[]))?;
    }
    transcoder.flush_all_batches()?;

    let stats = transcoder.stats();
    assert!(stats.frames_dropped > 0);
    assert_eq!(sink.inner.len() as u64 + stats.frames_dropped, 200);
    // The newest frame always survives eviction
    let last = sink.inner.records().last().map(|r| r.timestamp);
    assert_eq!(last, Some(frame(199, 1, &[]).timestamp));
    Ok(())
}

#[test]
fn failed_flush_is_retried_in_order() -> anyhow::Result<()> {
    let sink = ScriptedSink::new(Duration::ZERO);
    let config = TranscoderConfig::new().with_batch_size(5);
    let transcoder = Transcoder::with_sinks(vec![Box::new(sink.clone())], config)?;

    *sink.failing.lock().unwrap() = true;
    for seq in 0..12 {
        transcoder.receive_raw_message(frame(seq, 1, &[]))?;
    }
    match transcoder.flush_all_batches() {
        Err(TranscoderError::FlushFailed {
            sink: name,
            retained_records,
            ..
        }) => {
            assert_eq!(name, "scripted");
            assert_eq!(retained_records, 12);
        }
        other => panic!("expected FlushFailed, got {:?}", other),
    }
    assert!(transcoder.stats().flush_failures > 0);

    *sink.failing.lock().unwrap() = false;
    transcoder.flush_all_batches()?;

    let timestamps: Vec<_> = sink.inner.records().iter().map(|r| r.timestamp).collect();
    let expected: Vec<_> = (0..12).map(|seq| frame(seq, 1, &[]).timestamp).collect();
    assert_eq!(timestamps, expected);
    Ok(())
}

#[test]
fn age_threshold_flushes_without_explicit_call() -> anyhow::Result<()> {
    let sink = MemorySink::new();
    let config = TranscoderConfig::new()
        .with_batch_size(1_000)
        .with_max_batch_age(Duration::from_millis(20));
    let transcoder = Transcoder::with_sinks(vec![Box::new(sink.clone())], config)?;

    transcoder.receive_raw_message(frame(0, 1, &[]))?;

    let mut waited = Duration::ZERO;
    while sink.is_empty() && waited < Duration::from_secs(5) {
        std::thread::sleep(Duration::from_millis(10));
        waited += Duration::from_millis(10);
    }
    assert_eq!(sink.len(), 1);
    Ok(())
}

#[test]
fn multiple_sinks_each_receive_every_frame() -> anyhow::Result<()> {
    let first = MemorySink::named("first");
    let second = MemorySink::named("second");
    let transcoder = Transcoder::with_sinks(
        vec![Box::new(first.clone()), Box::new(second.clone())],
        TranscoderConfig::new().with_batch_size(7),
    )?;

    for seq in 0..50 {
        transcoder.receive_raw_message(frame(seq, 2, &[seq as u8]))?;
    }
    transcoder.shutdown()?;

    assert_eq!(first.len(), 50);
    assert_eq!(second.len(), 50);
    Ok(())
}

#[test]
fn block_policy_pauses_intake_while_sink_is_down() -> anyhow::Result<()> {
    init_logging();
    let sink = ScriptedSink::new(Duration::ZERO);
    let config = TranscoderConfig::new()
        .with_batch_size(1)
        .with_max_retained_batches(2)
        .with_queue_capacity(8)
        .with_backpressure(BackpressurePolicy::Block);
    let transcoder = Transcoder::with_sinks(vec![Box::new(sink.clone())], config)?;

    *sink.failing.lock().unwrap() = true;
    for seq in 0..5 {
        transcoder.receive_raw_message(frame(seq, 1, &[]))?;
    }
    // The worker holds two batches and leaves the rest queued
    match transcoder.flush_all_batches() {
        Err(TranscoderError::FlushFailed {
            retained_records, ..
        }) => assert_eq!(retained_records, 2),
        other => panic!("expected FlushFailed, got {:?}", other),
    }

    *sink.failing.lock().unwrap() = false;
    // Longer than the worker's largest retry delay
    std::thread::sleep(Duration::from_millis(300));
    transcoder.flush_all_batches()?;

    let timestamps: Vec<_> = sink.inner.records().iter().map(|r| r.timestamp).collect();
    let expected: Vec<_> = (0..5).map(|seq| frame(seq, 1, &[]).timestamp).collect();
    assert_eq!(timestamps, expected);

    let stats = transcoder.stats();
    assert_eq!(stats.records_written, 5);
    assert_eq!(stats.records_dropped, 0);
    assert_eq!(stats.frames_dropped, 0);
    Ok(())
}

#[test]
fn drop_oldest_policy_discards_retained_batches_while_sink_is_down() -> anyhow::Result<()> {
    let sink = ScriptedSink::new(Duration::ZERO);
    let config = TranscoderConfig::new()
        .with_batch_size(1)
        .with_max_retained_batches(2)
        .with_queue_capacity(8)
        .with_backpressure(BackpressurePolicy::DropOldest);
    let transcoder = Transcoder::with_sinks(vec![Box::new(sink.clone())], config)?;

    *sink.failing.lock().unwrap() = true;
    for seq in 0..5 {
        transcoder.receive_raw_message(frame(seq, 1, &[]))?;
    }
    assert!(transcoder.flush_all_batches().is_err());

    *sink.failing.lock().unwrap() = false;
    transcoder.flush_all_batches()?;

    let timestamps: Vec<_> = sink.inner.records().iter().map(|r| r.timestamp).collect();
    let expected: Vec<_> = (3..5).map(|seq| frame(seq, 1, &[]).timestamp).collect();
    assert_eq!(timestamps, expected);
    assert_eq!(transcoder.stats().records_dropped, 3);
    Ok(())
}

#[test]
fn shutdown_returns_while_sink_is_down() {
    let sink = ScriptedSink::new(Duration::ZERO);
    let config = TranscoderConfig::new()
        .with_batch_size(1)
        .with_max_retained_batches(1)
        .with_queue_capacity(4)
        .with_backpressure(BackpressurePolicy::Block);
    let transcoder = Transcoder::with_sinks(vec![Box::new(sink.clone())], config).unwrap();

    *sink.failing.lock().unwrap() = true;
    for seq in 0..4 {
        transcoder.receive_raw_message(frame(seq, 1, &[])).unwrap();
    }
    assert!(matches!(
        transcoder.shutdown(),
        Err(TranscoderError::FlushFailed { .. })
    ));
    assert!(sink.inner.is_empty());
}

#[test]
fn transcoder_is_shareable_across_threads() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Transcoder>();
}

#[test]
fn flush_covers_everything_submitted_before_it() -> anyhow::Result<()> {
    init_logging();
    let sink = ScriptedSink::new(Duration::from_micros(200));
    let config = TranscoderConfig::new()
        .with_batch_size(16)
        .with_queue_capacity(64)
        .with_max_batch_age(Duration::from_secs(600));
    let transcoder = Transcoder::with_sinks(vec![Box::new(sink.clone())], config)?;

    let n: u64 = 2_000;
    let submitted = AtomicU64::new(0);
    std::thread::scope(|scope| -> anyhow::Result<()> {
        let producer = scope.spawn(|| -> can_transcoder::Result<()> {
            for seq in 0..n {
                transcoder.receive_raw_message(frame(seq, 1, &[]))?;
                submitted.store(seq + 1, Ordering::SeqCst);
            }
            Ok(())
        });

        while !producer.is_finished() {
            let before = submitted.load(Ordering::SeqCst);
            transcoder.flush_all_batches()?;
            let written = sink.inner.len() as u64;
            assert!(
                written >= before,
                "flush returned with {} of {} earlier frames written",
                written,
                before
            );
        }
        producer.join().expect("producer panicked")?;
        Ok(())
    })?;

    transcoder.flush_all_batches()?;
    let timestamps: Vec<_> = sink.inner.records().iter().map(|r| r.timestamp).collect();
    let expected: Vec<_> = (0..n).map(|seq| frame(seq, 1, &[]).timestamp).collect();
    assert_eq!(timestamps, expected);
    Ok(())
}

#[test]
fn reparse_while_decoding_never_mixes_definitions() -> anyhow::Result<()> {
    const WITHOUT_SPEED: &str = r#"
BO_ 200 Engine: 8 ECU1
 SG_ Rpm : 7|16@0+ (0.25,0) [0|16383.75] "rpm" ECU2
"#;

    let sink = MemorySink::new();
    let config = TranscoderConfig::new().with_batch_size(32);
    let transcoder = Transcoder::with_sinks(vec![Box::new(sink.clone())], config)?;
    transcoder.parse_dbc(DBC)?;

    let n: u64 = 2_000;
    std::thread::scope(|scope| -> anyhow::Result<()> {
        let reloader = scope.spawn(|| -> can_transcoder::Result<usize> {
            let mut reloads = 0;
            for i in 0..200 {
                let text = if i % 2 == 0 { WITHOUT_SPEED } else { DBC };
                transcoder.parse_dbc(text)?;
                reloads += 1;
            }
            Ok(reloads)
        });

        for seq in 0..n {
            transcoder.receive_raw_message(frame(seq, 100, &[0xE8, 0x03, 0, 0, 0, 0, 0, 0]))?;
        }
        assert_eq!(reloader.join().expect("reloader panicked")?, 200);
        Ok(())
    })?;
    transcoder.flush_all_batches()?;

    let records = sink.records();
    assert_eq!(records.len(), n as usize);
    for record in &records {
        match record.status {
            RecordStatus::Decoded => {
                assert_eq!(record.message_name.as_deref(), Some("Speed"));
                assert_eq!(record.value("VehicleSpeed"), Some(10.0));
            }
            RecordStatus::Unknown => assert!(record.signals.is_empty()),
            RecordStatus::Partial => panic!("partial record {:?}", record),
        }
    }
    // The last definition published carries the message again
    assert!(transcoder.network().message(100).is_some());
    Ok(())
}
