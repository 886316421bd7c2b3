//! End-to-end pipeline scenarios through the public API.

use async_trait::async_trait;
use pipeflow::prelude::*;
use pipeflow::testing::{
    assert_all_balanced, assert_bounded, assert_same_multiset, assert_stage_counts,
    FailingTransform, GatedSink, RecordingTransform, SlowTransform,
};
use pretty_assertions::assert_eq;
use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn doubles_then_filters_small_values() {
    let report = Pipeline::from_iter(vec![1, 2, 3, 4, 5])
        .map("double", StageOptions::concurrent(2), |x: i32| x * 2)
        .filter("at-most-six", StageOptions::default(), |x: &i32| *x <= 6)
        .collect()
        .run()
        .await
        .unwrap();

    let collected: BTreeSet<i32> = report.output.iter().copied().collect();
    assert_eq!(collected, BTreeSet::from([2, 4, 6]));
    assert_eq!(report.items_sunk, 3);
    assert_stage_counts(&report, "double", 5, 0, 0);
    assert_stage_counts(&report, "at-most-six", 3, 2, 0);
    assert_all_balanced(&report);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn serial_pipeline_matches_sequential_application() {
    let input: Vec<u64> = (0..500).collect();
    let expected: Vec<u64> = input
        .iter()
        .map(|x| x * 3)
        .filter(|x| x % 2 == 0)
        .map(|x| x + 1)
        .collect();

    let report = Pipeline::from_iter(input)
        .map("triple", StageOptions::new(1, 4), |x: u64| x * 3)
        .filter("even", StageOptions::new(1, 4), |x: &u64| x % 2 == 0)
        .map("inc", StageOptions::new(1, 4), |x: u64| x + 1)
        .collect()
        .run()
        .await
        .unwrap();

    // One worker per stage and one producer per queue keep the order too.
    assert_eq!(report.output, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fan_out_preserves_the_multiset() {
    let input: Vec<u32> = (0..2_000).collect();
    let report = Pipeline::from_iter(input.clone())
        .map_async("jitter", StageOptions::new(8, 16), |x: u32| async move {
            if x % 7 == 0 {
                tokio::task::yield_now().await;
            }
            Ok(x)
        })
        .map("square", StageOptions::new(4, 16), |x: u32| u64::from(x) * u64::from(x))
        .collect()
        .run()
        .await
        .unwrap();

    assert_same_multiset(
        report.output,
        input.into_iter().map(|x| u64::from(x) * u64::from(x)).collect(),
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queues_never_exceed_capacity_under_backpressure() {
    let (sink, gate) = GatedSink::closed();
    let pipeline = Pipeline::builder("backpressure")
        .source_capacity(3)
        .from_iter(0..200)
        .map("first", StageOptions::new(3, 2), |x: i32| x + 1)
        .map("second", StageOptions::new(2, 5), |x: i32| x - 1)
        .sink_with("gated", sink)
        .build()
        .unwrap();
    let handle = pipeline.handle();
    let run = tokio::spawn(pipeline.run());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let stalled = handle.stage_stats();
    assert_eq!(gate.consumed(), 0);
    assert_eq!(stalled[0].output.current_len, 2);
    assert_eq!(stalled[1].output.current_len, 5);
    assert!(stalled.iter().all(|s| s.output.saw_backpressure()));

    gate.open();
    let report = run.await.unwrap().unwrap();

    assert_same_multiset(report.output, (0..200).collect());
    assert_bounded(&report.source_queue);
    assert_eq!(report.source_queue.capacity, 3);
    for stage in &report.stages {
        assert_bounded(&stage.output);
        assert_eq!(stage.output.high_water_mark, stage.output.capacity);
    }
}

/// A sink that checks, when it finishes, that every stage has shut down.
struct ShutdownProbe {
    handle: Arc<OnceLock<PipelineHandle>>,
    items: usize,
}

#[async_trait]
impl Sink<usize> for ShutdownProbe {
    type Output = Vec<(String, usize, bool)>;

    async fn consume(&mut self, _item: usize) -> anyhow::Result<()> {
        self.items += 1;
        Ok(())
    }

    async fn finish(&mut self) -> anyhow::Result<Self::Output> {
        let handle = self
            .handle
            .get()
            .ok_or_else(|| anyhow::anyhow!("handle not installed"))?;
        Ok(handle
            .stage_stats()
            .into_iter()
            .map(|s| (s.name, s.live_workers, s.output.closed))
            .collect())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn outputs_close_only_after_every_worker_exits() {
    let slot = Arc::new(OnceLock::new());
    let pipeline = Pipeline::from_iter(0..300_usize)
        .pipe("slow", StageOptions::new(6, 3), SlowTransform::with_delay_ms(1))
        .map("id", StageOptions::new(3, 3), |x: usize| x)
        .sink_with(
            "probe",
            ShutdownProbe {
                handle: slot.clone(),
                items: 0,
            },
        )
        .build()
        .unwrap();
    slot.set(pipeline.handle()).unwrap();

    let report = pipeline.run().await.unwrap();

    assert_eq!(report.items_sunk, 300);
    assert_eq!(
        report.output,
        vec![("slow".to_string(), 0, true), ("id".to_string(), 0, true)]
    );
}

#[tokio::test]
async fn concurrency_bounds_in_flight_calls() {
    let slow = Arc::new(SlowTransform::with_delay_ms(2));
    let transform: Arc<dyn Transform<u8, u8>> = slow.clone();

    Pipeline::from_iter(0..40_u8)
        .pipe_arc("slow", StageOptions::new(4, 8), transform)
        .collect()
        .run()
        .await
        .unwrap();

    assert_eq!(slow.calls(), 40);
    assert!(slow.peak_in_flight() <= 4);
    assert!(slow.peak_in_flight() > 1);
}

#[tokio::test]
async fn abort_policy_surfaces_the_failing_item() {
    let result = Pipeline::builder("abort")
        .error_policy(ErrorPolicy::Abort)
        .from_iter(vec![1, 2, 3, 4])
        .pipe(
            "reject-three",
            StageOptions::default(),
            FailingTransform::new(|x: &i32| *x == 3, "rejected"),
        )
        .collect()
        .run()
        .await;

    let Err(PipelineError::TransformFailure(failure)) = result else {
        panic!("expected a transform failure, got {result:?}");
    };
    assert_eq!(failure.stage, "reject-three");
    assert_eq!(failure.sequence, 2);
    assert_eq!(failure.message, "rejected: 3");
}

#[tokio::test]
async fn skip_policy_keeps_good_items() {
    let report = Pipeline::from_iter(vec![1, 2, 3, 4])
        .pipe(
            "reject-three",
            StageOptions::default(),
            FailingTransform::new(|x: &i32| *x == 3, "rejected"),
        )
        .collect()
        .run()
        .await
        .unwrap();

    assert_eq!(report.output, vec![1, 2, 4]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].stage, "reject-three");
    assert_stage_counts(&report, "reject-three", 3, 0, 1);
}

#[tokio::test]
async fn panicking_transform_is_isolated() {
    let report = Pipeline::from_iter(0..5)
        .pipe(
            "fragile",
            StageOptions::concurrent(2),
            FailingTransform::panicking(|x: &i32| *x == 0, "boom"),
        )
        .collect()
        .run()
        .await
        .unwrap();

    assert_same_multiset(report.output, vec![1, 2, 3, 4]);
    assert!(report.failures[0].error.contains("transform panicked: boom: 0"));
}

#[tokio::test]
async fn abort_in_sink_discards_the_rest() {
    let result = Pipeline::builder("sink-abort")
        .error_policy(ErrorPolicy::Abort)
        .from_iter(0..100)
        .map("id", StageOptions::default(), |x: i32| x)
        .sink(|x: i32| {
            anyhow::ensure!(x < 10, "sink refused {x}");
            Ok(())
        })
        .run()
        .await;

    let err = result.unwrap_err();
    let failure = err.as_transform_failure().unwrap();
    assert_eq!(failure.stage, "sink");
    assert_eq!(failure.sequence, 10);
}

#[tokio::test]
async fn uniform_builder_wires_positional_settings() {
    let recorder = Arc::new(RecordingTransform::<i64>::new());
    let transforms: Vec<Arc<dyn Transform<i64, i64>>> = vec![
        Arc::new(FnTransform::new(|x: i64| Ok(Some(x * 10)))),
        recorder.clone(),
        Arc::new(FilterTransform::new(|x: &i64| *x != 20)),
    ];

    let pipeline = Pipeline::build(
        vec![1, 2, 3],
        &[2, 2, 0],
        &[1, 2, 1],
        transforms,
        CollectSink::new(),
    )
    .unwrap();
    assert_eq!(pipeline.stage_count(), 3);

    let report = pipeline.run().await.unwrap();
    assert_same_multiset(report.output, vec![10, 30]);
    assert_same_multiset(recorder.items(), vec![10, 20, 30]);
    assert_eq!(report.stages[1].name, "stage-1");
    assert_eq!(report.stages[2].output.capacity, 0);
}

#[test]
fn uniform_builder_rejects_bad_settings() {
    let identity = || -> Arc<dyn Transform<u8, u8>> { Arc::new(FnTransform::new(|x: u8| Ok(Some(x)))) };

    let zero = Pipeline::build(vec![1_u8], &[1], &[0], vec![identity()], CollectSink::new());
    assert!(matches!(zero, Err(PipelineError::Configuration(_))));

    let mismatch = Pipeline::build(
        vec![1_u8],
        &[1, 1],
        &[1, 1],
        vec![identity()],
        CollectSink::new(),
    );
    assert!(matches!(mismatch, Err(PipelineError::Configuration(_))));

    let lengths = Pipeline::build(vec![1_u8], &[1], &[1, 1], vec![identity()], CollectSink::new());
    assert!(matches!(lengths, Err(PipelineError::Configuration(_))));
}

#[tokio::test]
async fn json_config_drives_the_uniform_builder() {
    let config = PipelineConfig::from_json(
        r#"{
            "name": "configured",
            "source_capacity": 8,
            "error_policy": "skip",
            "stages": [
                {"name": "trim", "concurrency": 2, "capacity": 4},
                {"name": "upper"}
            ]
        }"#,
    )
    .unwrap();

    let transforms: Vec<Arc<dyn Transform<String, String>>> = vec![
        Arc::new(FnTransform::new(|s: String| Ok(Some(s.trim().to_string())))),
        Arc::new(FnTransform::new(|s: String| Ok(Some(s.to_uppercase())))),
    ];
    let report = Pipeline::from_config(
        &config,
        vec!["  mit ".to_string(), "apache ".to_string()],
        transforms,
        CollectSink::new(),
    )
    .unwrap()
    .run()
    .await
    .unwrap();

    assert_eq!(report.pipeline, "configured");
    assert_eq!(report.source_queue.capacity, 8);
    assert_eq!(report.stages[1].output.capacity, 100);
    assert_same_multiset(report.output, vec!["APACHE".to_string(), "MIT".to_string()]);
}

#[test]
fn json_config_rejects_negative_capacity() {
    let err = PipelineConfig::from_json(r#"{"stages": [{"name": "a", "capacity": -1}]}"#)
        .unwrap_err();
    assert!(err.message.contains("Invalid pipeline configuration"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_source_and_async_sink() {
    let lines = "MIT\nApache-2.0\n\nGPL-3.0\n".lines().map(str::to_string).collect::<Vec<_>>();
    let written = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let writer = written.clone();

    let report = Pipeline::builder("lines")
        .source_capacity(1)
        .from_blocking_iter(lines)
        .filter_map("non-empty", StageOptions::default(), |line: String| {
            (!line.is_empty()).then_some(line)
        })
        .sink_async(move |line: String| {
            let writer = writer.clone();
            async move {
                tokio::task::yield_now().await;
                writer.lock().push(line);
                Ok(())
            }
        })
        .run()
        .await
        .unwrap();

    assert_eq!(report.items_sourced, 4);
    assert_eq!(*written.lock(), vec!["MIT", "Apache-2.0", "GPL-3.0"]);
    assert_stage_counts(&report, "non-empty", 3, 1, 0);
}

#[tokio::test]
async fn stream_source() {
    let report = Pipeline::from_stream(futures::stream::iter(vec!['p', 'i', 'p', 'e']))
        .map("upper", StageOptions::default(), |c: char| c.to_ascii_uppercase())
        .collect()
        .run()
        .await
        .unwrap();

    assert_eq!(report.output.into_iter().collect::<String>(), "PIPE");
}
