use std::{sync::Arc, time::Duration};

use criterion::{
    black_box, criterion_group, criterion_main, measurement, BatchSize, BenchmarkGroup,
    BenchmarkId, Criterion,
};

use fixpoint::{
    evaluator::SequentialRuntime,
    handle::{Blob, Expression, Object, Thunk, Value},
    runner::NativeRunner,
    scheduler::LocalScheduler,
    Relater, RuntimeStorage,
};

const CAPACITY: usize = 1 << 14;

fn fib_thunk(storage: &RuntimeStorage, n: u64) -> Object {
    let tree = storage
        .create_expression_tree(&[
            Expression::Object(Object::Value(Value::Blob(NativeRunner::procedure("fib")))),
            Expression::Object(Object::Value(Value::Blob(Blob::from_u64(n)))),
        ])
        .unwrap();
    Object::Thunk(Thunk::Application(tree))
}

fn runner() -> Arc<NativeRunner> {
    Arc::new(NativeRunner::with_builtins())
}

fn fib_sequential<M: measurement::Measurement>(n: u64, c: &mut BenchmarkGroup<'_, M>) {
    c.bench_with_input(BenchmarkId::new("sequential", n), &n, |b, &n| {
        b.iter_batched(
            || SequentialRuntime::new(Arc::new(RuntimeStorage::new(CAPACITY)), runner()),
            |rt| {
                let fib = fib_thunk(rt.storage(), n);
                black_box(rt.evaluate(fib).unwrap())
            },
            BatchSize::LargeInput,
        )
    });
}

fn fib_scheduler<M: measurement::Measurement>(n: u64, c: &mut BenchmarkGroup<'_, M>) {
    c.bench_with_input(BenchmarkId::new("scheduler", n), &n, |b, &n| {
        b.iter_batched(
            || LocalScheduler::new(Arc::new(RuntimeStorage::new(CAPACITY)), runner()),
            |mut scheduler| {
                let fib = fib_thunk(scheduler.storage(), n);
                black_box(scheduler.schedule(fib).unwrap())
            },
            BatchSize::LargeInput,
        )
    });
}

fn fib_relater<M: measurement::Measurement>(
    n: u64,
    threads: usize,
    c: &mut BenchmarkGroup<'_, M>,
) {
    let id = BenchmarkId::new(format!("relater-{threads}"), n);
    c.bench_with_input(id, &n, |b, &n| {
        b.iter_batched(
            || Relater::new(Arc::new(RuntimeStorage::new(CAPACITY)), runner(), threads, None).unwrap(),
            |relater| {
                let fib = fib_thunk(relater.storage(), n);
                black_box(relater.evaluate(fib).unwrap())
            },
            BatchSize::LargeInput,
        )
    });
}

fn fibonacci_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("fib");
    for n in [10, 40] {
        fib_sequential(n, &mut group);
        fib_scheduler(n, &mut group);
        for threads in [1, num_threads()] {
            fib_relater(n, threads, &mut group);
        }
    }
    group.finish();
}

fn num_threads() -> usize {
    std::thread::available_parallelism().map_or(4, |n| n.get())
}

criterion_group! {
    name = benches;
    config = Criterion::default()
    .measurement_time(Duration::from_secs(10))
    .sample_size(10);
    targets =
     fibonacci_benchmark,
}

criterion_main!(benches);
