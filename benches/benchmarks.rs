//! Benchmark suite for output classification.
//!
//! Every loop iteration runs the agent's full output through the classifier
//! and the exit policy, so both are measured on realistic payload sizes.
//!
//! # Running Benchmarks
//!
//! ```bash
//! cargo bench
//! cargo bench -- --save-baseline main
//! cargo bench -- --baseline main
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ralph_loop::circuit_breaker::error_signature;
use ralph_loop::signals::{
    analyze_output, evaluate_exit, ExitSignalWindow, PlanProgress, ResponseAnalysis,
};

const STATUS_BLOCK: &str = "---RALPH_STATUS---\nSTATUS: IN_PROGRESS\nWORK_TYPE: IMPLEMENTATION\nFILES_MODIFIED: 3\nEXIT_SIGNAL: false\nRECOMMENDATION: Continue with the parser\n---END_RALPH_STATUS---";

fn text_output(lines: usize) -> String {
    let mut out = String::new();
    for i in 0..lines {
        out.push_str(&format!("Edited src/module_{i}.rs to handle case {i}\n"));
    }
    out.push_str(STATUS_BLOCK);
    out
}

fn stream_output(events: usize) -> String {
    let mut out = String::from(r#"{"type":"system","subtype":"init","session_id":"bench"}"#);
    out.push('\n');
    for i in 0..events {
        out.push_str(&format!(
            r#"{{"type":"assistant","message":{{"content":[{{"type":"text","text":"Step {i} done"}}]}}}}"#
        ));
        out.push('\n');
    }
    let result = serde_json::json!({
        "type": "result",
        "is_error": false,
        "result": STATUS_BLOCK,
        "session_id": "bench",
    });
    out.push_str(&result.to_string());
    out
}

fn bench_analyze_output(c: &mut Criterion) {
    let mut group = c.benchmark_group("analyze_output");

    for size in [10, 100, 1000] {
        let text = text_output(size);
        group.throughput(Throughput::Bytes(text.len() as u64));
        group.bench_with_input(BenchmarkId::new("text", size), &text, |b, text| {
            b.iter(|| black_box(analyze_output(black_box(text))));
        });

        let stream = stream_output(size);
        group.throughput(Throughput::Bytes(stream.len() as u64));
        group.bench_with_input(BenchmarkId::new("stream_json", size), &stream, |b, stream| {
            b.iter(|| black_box(analyze_output(black_box(stream))));
        });
    }

    group.finish();
}

fn bench_error_signature(c: &mut Criterion) {
    let mut output = text_output(500);
    output.push_str("\nerror[E0308]: mismatched types at src/lib.rs:120:5\n");

    c.bench_function("error_signature", |b| {
        b.iter(|| black_box(error_signature(black_box(&output))));
    });
}

fn bench_evaluate_exit(c: &mut Criterion) {
    let window = ExitSignalWindow {
        test_only_loops: vec![1, 2],
        done_signals: vec![3],
        completion_indicators: vec![4, 5, 6, 7],
    };
    let latest = ResponseAnalysis::default();
    let plan = PlanProgress {
        total: 20,
        completed: 19,
    };

    c.bench_function("evaluate_exit", |b| {
        b.iter(|| black_box(evaluate_exit(black_box(&window), &latest, &plan)));
    });
}

criterion_group!(
    benches,
    bench_analyze_output,
    bench_error_signature,
    bench_evaluate_exit
);
criterion_main!(benches);
