//! End-to-end interpreter benchmarks: compile + run a handful of
//! representative programs through the public `Vm` API.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use loxvm::{NoPrint, Vm};

fn run(source: &str) {
    let mut sink = NoPrint;
    black_box(Vm::new(&mut sink).interpret(source)).expect("benchmark program must run cleanly");
}

fn bench_arithmetic(c: &mut Criterion) {
    c.bench_function("arithmetic_loop", |b| {
        b.iter(|| {
            run("var sum = 0; for (var i = 0; i < 1000; i = i + 1) { sum = sum + i * 2 - 1; }");
        });
    });
}

fn bench_fibonacci(c: &mut Criterion) {
    c.bench_function("fibonacci_recursive", |b| {
        b.iter(|| {
            run("fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } fib(18);");
        });
    });
}

fn bench_string_concat(c: &mut Criterion) {
    c.bench_function("string_concatenation", |b| {
        b.iter(|| {
            run(r#"var s = ""; for (var i = 0; i < 200; i = i + 1) { s = s + "x"; }"#);
        });
    });
}

fn bench_closures(c: &mut Criterion) {
    c.bench_function("closure_allocation", |b| {
        b.iter(|| {
            run(
                "fun make(n) { fun inner() { return n; } return inner; } \
                 var total = 0; \
                 for (var i = 0; i < 500; i = i + 1) { total = total + make(i)(); }",
            );
        });
    });
}

fn bench_classes(c: &mut Criterion) {
    c.bench_function("class_method_dispatch", |b| {
        b.iter(|| {
            run(
                "class Counter { init() { this.n = 0; } bump() { this.n = this.n + 1; return this.n; } } \
                 var c = Counter(); \
                 for (var i = 0; i < 500; i = i + 1) { c.bump(); }",
            );
        });
    });
}

criterion_group!(benches, bench_arithmetic, bench_fibonacci, bench_string_concat, bench_closures, bench_classes);
criterion_main!(benches);
