use std::sync::Arc;

use fixpoint::evaluator::SequentialRuntime;
use fixpoint::handle::{Blob, Encode, Expression, Fix, Object, Relation, Thunk, Value};
use fixpoint::runner::NativeRunner;
use fixpoint::scheduler::LocalScheduler;
use fixpoint::{FixError, Relater, RuntimeStorage};

fn num(n: u64) -> Object {
    Object::Value(Value::Blob(Blob::from_u64(n)))
}

fn call(storage: &RuntimeStorage, procedure: &str, args: &[Object]) -> Object {
    let mut elements = vec![Expression::Object(Object::Value(Value::Blob(
        NativeRunner::procedure(procedure),
    )))];
    elements.extend(args.iter().map(|&a| Expression::Object(a)));
    let tree = storage.create_expression_tree(&elements).unwrap();
    Object::Thunk(Thunk::Application(tree))
}

fn runner() -> Arc<NativeRunner> {
    Arc::new(NativeRunner::with_builtins())
}

#[test]
fn add_agrees_everywhere() {
    let storage = Arc::new(RuntimeStorage::new(1 << 10));
    let sum = call(&storage, "add", &[num(3), num(4)]);

    let sequential = SequentialRuntime::new(storage.clone(), runner());
    assert_eq!(sequential.evaluate(sum).unwrap(), Value::Blob(Blob::from_u64(7)));

    let mut scheduler = LocalScheduler::new(Arc::new(RuntimeStorage::new(1 << 10)), runner());
    let sum_elsewhere = call(scheduler.storage(), "add", &[num(3), num(4)]);
    assert_eq!(sum, sum_elsewhere);
    let tag = scheduler.schedule(sum_elsewhere).unwrap();
    assert_eq!(tag.rhs(), Value::Blob(Blob::from_u64(7)));

    let relater = Relater::new(Arc::new(RuntimeStorage::new(1 << 10)), runner(), 4, None).unwrap();
    let sum_there = call(relater.storage(), "add", &[num(3), num(4)]);
    assert_eq!(relater.evaluate(sum_there).unwrap(), Value::Blob(Blob::from_u64(7)));
}

#[test]
fn fib_is_deterministic_across_runtimes() {
    let mut results = vec![];

    let sequential = SequentialRuntime::new(Arc::new(RuntimeStorage::new(1 << 12)), runner());
    let fib = call(sequential.storage(), "fib", &[num(10)]);
    results.push(sequential.evaluate(fib).unwrap());
    assert_eq!(sequential.stats().map_reduces(), 9);

    let mut scheduler = LocalScheduler::new(Arc::new(RuntimeStorage::new(1 << 12)), runner());
    let fib = call(scheduler.storage(), "fib", &[num(10)]);
    results.push(scheduler.schedule(fib).unwrap().rhs());

    for threads in [1, 2, 8] {
        let relater =
            Relater::new(Arc::new(RuntimeStorage::new(1 << 12)), runner(), threads, None).unwrap();
        let fib = call(relater.storage(), "fib", &[num(10)]);
        results.push(relater.evaluate(fib).unwrap());
    }

    assert!(results.iter().all(|r| *r == Value::Blob(Blob::from_u64(55))));
}

#[test]
fn select_second_element() {
    let storage = Arc::new(RuntimeStorage::new(1 << 10));
    let elements = [b'a', b'b', b'c'].map(|c| Value::Blob(Blob::literal(&[c; 3]).unwrap()));
    let tree = storage.create_value_tree(&elements).unwrap();
    let selection = storage
        .create_object_tree(&[Object::Value(Value::ValueTree(tree)), num(1)])
        .unwrap();
    let thunk = Object::Thunk(Thunk::Selection(selection));

    let relater = Relater::new(storage, runner(), 2, None).unwrap();
    assert_eq!(relater.evaluate(thunk).unwrap(), elements[1]);
}

#[test]
fn recreating_a_blob_is_a_no_op() {
    let storage = RuntimeStorage::new(64);
    let bytes = vec![42; 1000];
    let first = storage.create_blob(&bytes).unwrap();
    let counts = storage.counts();
    let second = storage.create_blob(&bytes).unwrap();
    assert_eq!(first, second);
    assert_eq!(storage.counts(), counts);
}

#[test]
fn local_and_canonical_handles_name_the_same_content() {
    let storage = RuntimeStorage::new(64);
    let bytes = vec![7; 300];
    let local = Fix::from(Value::Blob(storage.create_local_blob(&bytes).unwrap()));
    let canonical = Fix::from(Value::Blob(storage.create_blob(&bytes).unwrap()));
    assert_ne!(local, canonical);
    assert!(local.content_eq(&canonical));
    assert_eq!(storage.canonicalize(local).unwrap(), canonical);
}

#[test]
fn memo_is_shared_with_relater() {
    let storage = Arc::new(RuntimeStorage::new(1 << 12));
    let sequential = SequentialRuntime::new(storage.clone(), runner());
    let fib = call(&storage, "fib", &[num(12)]);
    let expected = sequential.evaluate(fib).unwrap();

    let relater = Relater::new(storage, runner(), 2, None).unwrap();
    let result = relater.execute(Relation::Eval(fib)).unwrap();
    assert_eq!(result, Object::Value(expected));
    // everything was memoized already
    assert_eq!(relater.executor().runs(), 0);
}

fn strict(storage: &RuntimeStorage, procedure: &str, args: &[Expression]) -> Expression {
    let mut elements = vec![Expression::Object(Object::Value(Value::Blob(
        NativeRunner::procedure(procedure),
    )))];
    elements.extend_from_slice(args);
    let tree = storage.create_expression_tree(&elements).unwrap();
    Expression::Encode(Encode::Strict(Thunk::Application(tree)))
}

/// `x(k) = x(k - 1) + x(k - 1) * (k + 1)`, with `x(k - 1)` appearing twice
/// so every level shares its sub-relation with the next
fn factorial_chain(storage: &RuntimeStorage, depth: u64) -> Object {
    let mut x = Expression::Object(num(1));
    for k in 1..=depth {
        let product = strict(storage, "mul", &[x, Expression::Object(num(k))]);
        x = strict(storage, "add", &[x, product]);
    }
    let Expression::Encode(Encode::Strict(thunk)) = x else {
        unreachable!("depth is positive");
    };
    Object::Thunk(thunk)
}

#[test]
fn shared_subrelations_agree_across_thread_counts() {
    let expected = Value::Blob(Blob::from_u64((1..=13).product()));

    let sequential = SequentialRuntime::new(Arc::new(RuntimeStorage::new(1 << 12)), runner());
    let goal = factorial_chain(sequential.storage(), 12);
    assert_eq!(sequential.evaluate(goal).unwrap(), expected);

    for threads in [2, 8, 32] {
        for _ in 0..4 {
            let relater =
                Relater::new(Arc::new(RuntimeStorage::new(1 << 12)), runner(), threads, None)
                    .unwrap();
            let chain = factorial_chain(relater.storage(), 12);
            assert_eq!(chain, goal);
            assert_eq!(relater.evaluate(chain).unwrap(), expected);
        }
    }
}

#[test]
fn selection_past_the_end_fails_everywhere() {
    let storage = Arc::new(RuntimeStorage::new(1 << 10));
    let bytes: Vec<u8> = (0..40).collect();
    let blob = Object::Value(Value::Blob(storage.create_blob(&bytes).unwrap()));
    let select = |index: u64| {
        Object::Thunk(Thunk::Selection(
            storage.create_object_tree(&[blob, num(index)]).unwrap(),
        ))
    };
    let (last, len, huge) = (select(39), select(40), select(u64::MAX));

    let sequential = SequentialRuntime::new(storage.clone(), runner());
    assert!(matches!(
        sequential.evaluate(huge),
        Err(FixError::OutOfRange { .. })
    ));

    let relater = Relater::new(storage, runner(), 4, None).unwrap();
    assert_eq!(
        relater.evaluate(last).unwrap(),
        Value::Blob(Blob::literal(&[39]).unwrap())
    );
    for past_end in [len, huge] {
        assert!(matches!(
            relater.evaluate(past_end),
            Err(FixError::OutOfRange { .. })
        ));
    }
}
