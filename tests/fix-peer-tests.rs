use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;
use crossbeam_channel::bounded;
use fixpoint::handle::{Blob, BlobRef, Expression, Fix, Object, Relation, Thunk, Value};
use fixpoint::relater::{remote, IRuntime, Info};
use fixpoint::repository::Repository;
use fixpoint::runner::NativeRunner;
use fixpoint::storage::Data;
use fixpoint::{FixError, Relater, RuntimeStorage};
use tempfile::Builder;

fn relater(repository: Option<Repository>) -> Relater {
    Relater::new(
        Arc::new(RuntimeStorage::new(1 << 12)),
        Arc::new(NativeRunner::with_builtins()),
        2,
        repository,
    )
    .unwrap()
}

fn num(n: u64) -> Expression {
    Expression::Object(Object::Value(Value::Blob(Blob::from_u64(n))))
}

fn call(storage: &RuntimeStorage, procedure: &str, args: &[Expression]) -> Object {
    let mut elements = vec![Expression::Object(Object::Value(Value::Blob(
        NativeRunner::procedure(procedure),
    )))];
    elements.extend_from_slice(args);
    let tree = storage.create_expression_tree(&elements).unwrap();
    Object::Thunk(Thunk::Application(tree))
}

#[test]
fn data_is_fetched_from_a_peer() {
    let a = relater(None);
    let b = relater(None);
    remote::link(&a, &b);

    let blob = a.storage().create_blob(&[3; 500]).unwrap();
    let handle = Fix::from(Value::Blob(blob));
    assert!(!b.contains(handle));

    let tree = b
        .storage()
        .create_object_tree(&[Object::Value(Value::BlobRef(BlobRef(blob)))])
        .unwrap();
    let Value::ValueTree(result) = b.evaluate(Object::ObjectTree(tree)).unwrap() else {
        panic!("an object tree evaluates to a value tree");
    };
    assert_eq!(b.storage().get_tree(result.tree()).unwrap()[0], handle);
    assert!(b.contains(handle));
}

#[test]
fn relations_are_computed_by_the_peer() {
    let a = relater(None);
    let b = relater(None);
    let (b_in_a, _) = remote::link(&a, &b);

    // `b` has never seen the program; it asks `a` for it while working
    let fib = call(a.storage(), "fib", &[num(10)]);
    let result = a.execute_on(b_in_a, Relation::Eval(fib)).unwrap();
    assert_eq!(result, Object::Value(Value::Blob(Blob::from_u64(55))));
    assert!(b.contains(Fix::Relation(Relation::Eval(fib))));
}

#[test]
fn data_nobody_has_fails() {
    let a = relater(None);
    let b = relater(None);
    remote::link(&a, &b);

    let elsewhere = RuntimeStorage::new(16).create_blob(&[9; 100]).unwrap();
    let tree = a
        .storage()
        .create_object_tree(&[Object::Value(Value::Blob(elsewhere))])
        .unwrap();
    assert!(matches!(
        a.evaluate(Object::ObjectTree(tree)),
        Err(FixError::HandleNotFound(_))
    ));
}

#[test]
fn repository_comes_before_peers() {
    let tmp_dir = Builder::new().prefix("fix").tempdir().unwrap();
    let root = Utf8Path::from_path(tmp_dir.path()).unwrap();
    let repository = Repository::init(root).unwrap();
    let scratch = RuntimeStorage::new(16);
    let blob = scratch.create_blob(&[8; 64]).unwrap();
    let handle = repository.persist(&scratch, Value::Blob(blob).into()).unwrap();

    let rt = relater(Some(repository));
    assert!(rt.contains(handle));
    assert_eq!(rt.get(handle).unwrap(), scratch.get(&handle));
    assert!(matches!(rt.get(handle).unwrap(), Some(Data::Blob(_))));
}

#[test]
fn stale_remote_ids_are_rejected() {
    let a = relater(None);
    let b = relater(None);
    let (b_in_a, _) = remote::link(&a, &b);
    assert_eq!(a.remotes(), 1);
    assert!(a.disconnect(b_in_a));
    assert_eq!(a.remotes(), 0);
    let fib = call(a.storage(), "fib", &[num(3)]);
    assert!(a.execute_on(b_in_a, Relation::Eval(fib)).is_err());
}

/// Hands out data from its own storage, but takes its time doing so
struct SlowRemote {
    source: RuntimeStorage,
}

impl IRuntime for SlowRemote {
    fn get(&self, handle: Fix) -> fixpoint::Result<Option<Data>> {
        std::thread::sleep(Duration::from_millis(300));
        Ok(self.source.get(&handle))
    }

    fn put(&self, _handle: Fix, _data: Data) -> fixpoint::Result<()> {
        Ok(())
    }

    fn contains(&self, handle: Fix) -> bool {
        self.source.contains(&handle)
    }

    fn get_info(&self) -> Option<Info> {
        None
    }
}

#[test]
fn a_fetch_in_flight_wakes_everyone_waiting_on_it() {
    let source = RuntimeStorage::new(16);
    let blob = source.create_blob(&[5; 500]).unwrap();
    let reference = Object::Value(Value::BlobRef(BlobRef(blob)));

    let a = Arc::new(relater(None));
    a.connect(Arc::new(SlowRemote { source }));
    let first = a.storage().create_object_tree(&[reference]).unwrap();
    let second = a
        .storage()
        .create_object_tree(&[reference, Object::Value(Value::Blob(Blob::from_u64(1)))])
        .unwrap();

    // the first relation is still waiting on the remote when the second one
    // finds the same fetch outstanding
    a.executor()
        .submit(Relation::Eval(Object::ObjectTree(first)));
    std::thread::sleep(Duration::from_millis(50));
    let (tx, rx) = bounded(1);
    let waiting = a.clone();
    std::thread::spawn(move || {
        let _ = tx.send(waiting.evaluate(Object::ObjectTree(second)));
    });
    let Value::ValueTree(result) = rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap()
    else {
        panic!("an object tree evaluates to a value tree");
    };
    assert_eq!(a.storage().get_tree(result.tree()).unwrap()[0], Fix::from(Value::Blob(blob)));
    assert!(a.contains(Value::Blob(blob).into()));
}

#[test]
fn relations_are_computed_by_a_directly_connected_relater() {
    let a = relater(None);
    let b = relater(None);
    let sum = call(a.storage(), "add", &[num(3), num(4)]);
    assert_eq!(sum, call(b.storage(), "add", &[num(3), num(4)]));
    let b_in_a = a.connect(Arc::new(b));

    let (tx, rx) = bounded(1);
    std::thread::spawn(move || {
        let _ = tx.send(a.execute_on(b_in_a, Relation::Eval(sum)));
    });
    let result = rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap();
    assert_eq!(result, Object::Value(Value::Blob(Blob::from_u64(7))));
}

#[test]
fn a_directly_connected_relater_misses_right_away() {
    let a = relater(None);
    a.connect(Arc::new(relater(None)));
    let elsewhere = RuntimeStorage::new(16).create_blob(&[9; 100]).unwrap();
    let tree = a
        .storage()
        .create_object_tree(&[Object::Value(Value::Blob(elsewhere))])
        .unwrap();

    let (tx, rx) = bounded(1);
    std::thread::spawn(move || {
        let _ = tx.send(a.evaluate(Object::ObjectTree(tree)));
    });
    assert!(matches!(
        rx.recv_timeout(Duration::from_secs(10)).unwrap(),
        Err(FixError::HandleNotFound(_))
    ));
}
