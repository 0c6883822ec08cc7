use pilot_trace::{TraceDraft, TraceFilter, TraceKind, TraceRecorder};
use proptest::prelude::*;
use std::sync::Arc;

#[test]
fn test_concurrent_writers_get_unique_increasing_sequences() {
    let recorder = Arc::new(TraceRecorder::new());
    let mut handles = Vec::new();

    for t in 0..8 {
        let recorder = Arc::clone(&recorder);
        handles.push(std::thread::spawn(move || {
            for i in 0..50 {
                recorder
                    .record(
                        TraceDraft::new("CodingAgent", TraceKind::Action)
                            .target(format!("target-{t}"))
                            .input(format!("step {i}")),
                    )
                    .unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let events = recorder.events();
    assert_eq!(events.len(), 400);
    for pair in events.windows(2) {
        assert!(pair[0].seq < pair[1].seq);
    }
    assert!(recorder.verify_integrity().is_ok());

    // Per-target order follows the order each writer produced
    let steps: Vec<String> = recorder
        .query(TraceFilter::default().target("target-3"))
        .iter()
        .map(|e| e.input)
        .collect();
    let expected: Vec<String> = (0..50).map(|i| format!("step {i}")).collect();
    assert_eq!(steps, expected);
}

#[test]
fn test_query_by_kind() {
    let recorder = TraceRecorder::new();
    recorder
        .record(TraceDraft::new("ReflectionAgent", TraceKind::ReflectionAttempt).target("a"))
        .unwrap();
    recorder
        .record(TraceDraft::new("PipelineController", TraceKind::Terminal).target("a"))
        .unwrap();

    let q = recorder.query(TraceFilter::default().kind(TraceKind::Terminal));
    assert_eq!(q.iter().count(), 1);
    assert_eq!((&q).into_iter().next().unwrap().agent, "PipelineController");
}

proptest! {
    #[test]
    fn prop_sequences_strictly_increase(targets in proptest::collection::vec(0u8..5, 1..60)) {
        let recorder = TraceRecorder::new();
        for t in &targets {
            recorder
                .record(TraceDraft::new("x", TraceKind::Action).target(t.to_string()))
                .unwrap();
        }

        let seqs: Vec<u64> = recorder.query(TraceFilter::default()).iter().map(|e| e.seq).collect();
        prop_assert_eq!(seqs.len(), targets.len());
        prop_assert_eq!(seqs.first().copied(), Some(1));
        for pair in seqs.windows(2) {
            prop_assert_eq!(pair[1], pair[0] + 1);
        }
    }
}
