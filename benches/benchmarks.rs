//! Benchmark suite for codeloop hot paths.
//!
//! This module provides performance benchmarks for:
//! - Report analysis (marker parsing and scoring)
//! - Code extraction from model responses
//! - Output capture buffering
//! - Prompt assembly
//!
//! # Running Benchmarks
//!
//! ```bash
//! # Run all benchmarks
//! cargo bench
//!
//! # Save baseline for comparison
//! cargo bench -- --save-baseline main
//!
//! # Compare against baseline
//! cargo bench -- --baseline main
//! ```

use codeloop::analyzer::ReportAnalyzer;
use codeloop::generator::{extract_code, GenerationRequest};
use codeloop::prompt::PromptBuilder;
use codeloop::sandbox::CappedBuffer;
use codeloop::testing::execution;
use codeloop::{Language, TaskKind};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

// ============================================================================
// Analyzer Benchmarks
// ============================================================================

/// Build stdout with `checks` marker lines interleaved with program noise.
fn marker_output(checks: usize) -> (String, Vec<String>) {
    let mut stdout = String::new();
    let mut criteria = Vec::with_capacity(checks);
    for i in 0..checks {
        let name = format!("case {} returns the expected value", i);
        stdout.push_str(&format!("computing case {}...\n", i));
        if i % 3 == 0 {
            stdout.push_str(&format!("FAIL: {}: got {}\n", name, i * 2));
        } else {
            stdout.push_str(&format!("PASS: {}\n", name));
        }
        criteria.push(name);
    }
    (stdout, criteria)
}

/// Benchmark scoring as the number of checks grows.
fn bench_analyze(c: &mut Criterion) {
    let mut group = c.benchmark_group("analyze");
    let analyzer = ReportAnalyzer::new();

    for checks in [1, 10, 50, 200] {
        let (stdout, criteria) = marker_output(checks);
        let result = execution(&stdout, Some(0));

        group.throughput(Throughput::Elements(checks as u64));
        group.bench_with_input(BenchmarkId::new("checks", checks), &criteria, |b, criteria| {
            b.iter(|| black_box(analyzer.analyze(black_box(&result), &[], criteria)))
        });
    }

    group.finish();
}

// ============================================================================
// Extraction Benchmarks
// ============================================================================

/// Benchmark pulling code out of chatty responses.
fn bench_extract_code(c: &mut Criterion) {
    let mut group = c.benchmark_group("extract_code");

    let body = "def f(x):\n    return x + 1\n".repeat(50);
    let fenced = format!(
        "Sure! Here is the program.\n\n```text\nusage notes\n```\n\n```python\n{}```\n\nIt works by...",
        body
    );
    let bare = body.clone();

    group.throughput(Throughput::Bytes(fenced.len() as u64));
    group.bench_function("fenced", |b| {
        b.iter(|| black_box(extract_code(black_box(&fenced), Language::Python)))
    });
    group.bench_function("bare", |b| {
        b.iter(|| black_box(extract_code(black_box(&bare), Language::Python)))
    });

    group.finish();
}

// ============================================================================
// Capture Benchmarks
// ============================================================================

/// Benchmark filling a capped buffer past its cap in small chunks.
fn bench_capped_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("capped_buffer");
    let chunk = vec![b'x'; 4096];

    for cap in [16 * 1024, 64 * 1024, 1024 * 1024] {
        group.throughput(Throughput::Bytes((cap * 2) as u64));
        group.bench_with_input(BenchmarkId::new("fill_2x", cap), &cap, |b, &cap| {
            b.iter(|| {
                let mut buffer = CappedBuffer::new(cap);
                for _ in 0..(cap * 2 / chunk.len()) {
                    buffer.extend(black_box(&chunk));
                }
                black_box(buffer.truncated())
            })
        });
    }

    group.finish();
}

// ============================================================================
// Prompt Benchmarks
// ============================================================================

/// Benchmark prompt assembly with feedback attached.
fn bench_prompt_building(c: &mut Criterion) {
    let builder = PromptBuilder::new();
    let request = GenerationRequest {
        task_description: "Parse a CSV file and print per-column averages".to_string(),
        language: Language::Python,
        task_kind: TaskKind::General,
        requirements: (0..10).map(|i| format!("handles edge case {}", i)).collect(),
        test_criteria: (0..10).map(|i| format!("column {} average is correct", i)).collect(),
        feedback: Some("Iteration 1 scored 40/100; the target is 80.\n".repeat(20)),
        iteration: 2,
    };

    c.bench_function("prompt_build", |b| {
        b.iter(|| black_box(builder.build(black_box(&request))))
    });
}

criterion_group!(analyzer_benches, bench_analyze);

criterion_group!(
    pipeline_benches,
    bench_extract_code,
    bench_capped_buffer,
    bench_prompt_building
);

criterion_main!(analyzer_benches, pipeline_benches);
