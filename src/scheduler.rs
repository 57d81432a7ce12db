//! A single-threaded scheduler that never blocks on a missing result.
//!
//! `LocalScheduler::schedule` evaluates a goal in passes. A pass walks the
//! same recursive structure as the `Evaluator`, but with an explicit stack of
//! frames instead of native recursion. When it reaches an application whose
//! result isn't memoized it records the combination and reports the frame as
//! pending. Between passes every recorded application is run through the
//! `Runner`, and the next pass starts again from the top.
//!
//! Each pass leaves behind a continuation: one `SavedFrame` per frame it
//! entered, in pre-order, holding the coupon the frame produced (if any) and
//! the number of frames below it. The next pass reads the continuation with a
//! cursor; a frame whose saved coupon is present is resumed from the coupon
//! and its whole subtree is skipped. Finished work is therefore walked once,
//! and the number of passes is bounded by the depth of the application
//! dependencies.

use std::sync::Arc;

use indexmap::IndexSet;
use tracing::{debug, instrument};

use crate::coupon::{tagger, Coupon, CouponCollector, EvalTag, ReduceTag, ShallowTag};
use crate::error::{FixError, Result};
use crate::evaluator::{apply_memoized, parse_selection};
use crate::handle::{
    BlobRef, Encode, Expression, ExpressionTree, Fix, Object, ObjectTree, Thunk, TreeName, Value,
    ValueTree, ValueTreeRef,
};
use crate::runner::Runner;
use crate::storage::RuntimeStorage;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Goal {
    Eval(Object),
    Shallow(Object),
    Reduce(Expression),
    Force(Thunk),
    Apply(ObjectTree),
}

impl Goal {
    fn handle(&self) -> Fix {
        match *self {
            Goal::Eval(o) | Goal::Shallow(o) => o.into(),
            Goal::Reduce(e) => e.into(),
            Goal::Force(t) => t.into(),
            Goal::Apply(c) => c.into(),
        }
    }

    /// Whether `coupon` settles this goal
    fn accepts(&self, coupon: &Coupon) -> bool {
        match (*self, *coupon) {
            (Goal::Eval(o), Coupon::Eval(t)) => t.lhs() == o,
            (Goal::Shallow(o), Coupon::Shallow(t)) => t.lhs() == o,
            (Goal::Reduce(e), Coupon::Reduce(t)) => t.lhs() == e,
            (Goal::Force(th), Coupon::Think(t)) => t.lhs() == th,
            (Goal::Apply(c), Coupon::Apply(t)) => t.lhs() == c,
            _ => false,
        }
    }

    fn unsound(&self) -> FixError {
        FixError::KindMismatch {
            expected: "coupons that compose",
            found: self.handle(),
        }
    }
}

/// One entry of a continuation
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SavedFrame {
    pub coupon: Option<Coupon>,
    /// Number of frames saved below this one
    pub span: usize,
}

struct Frame {
    goal: Goal,
    /// Position in the continuation being built
    index: usize,
    /// End of this frame's subtree in the previous continuation
    old_end: Option<usize>,
    children: Vec<Option<Coupon>>,
    elements: Option<Arc<[Fix]>>,
}

enum Action {
    Call(Goal),
    Done(Option<Coupon>),
}

fn done(coupon: impl Into<Coupon>) -> Result<Action> {
    Ok(Action::Done(Some(coupon.into())))
}

enum Entered {
    Resumed(Option<Coupon>),
    Fresh(Frame),
}

/// The state of a single pass
struct Pass<'a> {
    storage: &'a RuntimeStorage,
    old: Vec<SavedFrame>,
    cursor: usize,
    next: Vec<SavedFrame>,
    pending: IndexSet<ObjectTree>,
}

impl<'a> Pass<'a> {
    fn new(storage: &'a RuntimeStorage, old: Vec<SavedFrame>) -> Self {
        Self {
            storage,
            old,
            cursor: 0,
            next: vec![],
            pending: IndexSet::new(),
        }
    }

    #[inline]
    fn collector(&self) -> CouponCollector<'a> {
        CouponCollector::new(self.storage)
    }

    /// Enters `goal` as a child of a frame whose previous subtree ends at
    /// `bound`
    fn enter(&mut self, goal: Goal, bound: usize) -> Entered {
        let index = self.next.len();
        self.next.push(SavedFrame {
            coupon: None,
            span: 0,
        });
        let saved = (self.cursor < bound)
            .then(|| self.old.get(self.cursor).copied())
            .flatten();
        let Some(saved) = saved else {
            return Entered::Fresh(Frame {
                goal,
                index,
                old_end: None,
                children: vec![],
                elements: None,
            });
        };
        let end = self.cursor + 1 + saved.span;
        match saved.coupon {
            Some(coupon) if goal.accepts(&coupon) => {
                self.cursor = end;
                self.next[index].coupon = Some(coupon);
                Entered::Resumed(Some(coupon))
            }
            Some(_) => {
                // the saved subtree belongs to some other goal
                self.cursor = end;
                Entered::Fresh(Frame {
                    goal,
                    index,
                    old_end: None,
                    children: vec![],
                    elements: None,
                })
            }
            None => {
                self.cursor += 1;
                Entered::Fresh(Frame {
                    goal,
                    index,
                    old_end: Some(end),
                    children: vec![],
                    elements: None,
                })
            }
        }
    }

    fn exit(&mut self, frame: &Frame, coupon: Option<Coupon>) {
        let span = if coupon.is_some() {
            self.next.truncate(frame.index + 1);
            0
        } else {
            self.next.len() - frame.index - 1
        };
        self.next[frame.index] = SavedFrame { coupon, span };
        if let Some(end) = frame.old_end {
            self.cursor = end;
        }
    }

    fn run(&mut self, root: Goal) -> Result<Option<Coupon>> {
        let bound = self.old.len();
        let mut stack = match self.enter(root, bound) {
            Entered::Resumed(coupon) => return Ok(coupon),
            Entered::Fresh(frame) => vec![frame],
        };
        let mut returned = None;
        while let Some(frame) = stack.last_mut() {
            if let Some(coupon) = returned.take() {
                frame.children.push(coupon);
            }
            match self.step(frame)? {
                Action::Call(goal) => {
                    let bound = frame.old_end.unwrap_or(0);
                    match self.enter(goal, bound) {
                        Entered::Resumed(coupon) => returned = Some(coupon),
                        Entered::Fresh(child) => stack.push(child),
                    }
                }
                Action::Done(coupon) => {
                    if let Some(frame) = stack.pop() {
                        self.exit(&frame, coupon);
                    }
                    if stack.is_empty() {
                        return Ok(coupon);
                    }
                    returned = Some(coupon);
                }
            }
        }
        Ok(None)
    }

    fn step(&mut self, frame: &mut Frame) -> Result<Action> {
        match frame.goal {
            Goal::Eval(o) => self.eval(frame, o),
            Goal::Shallow(o) => self.shallow(frame, o),
            Goal::Reduce(e) => self.reduce(frame, e),
            Goal::Force(t) => self.force(frame, t),
            Goal::Apply(c) => Ok(match self.collector().apply(c) {
                Some(tag) => Action::Done(Some(tag.into())),
                None => {
                    self.pending.insert(c);
                    Action::Done(None)
                }
            }),
        }
    }

    fn eval(&mut self, frame: &mut Frame, object: Object) -> Result<Action> {
        let collector = self.collector();
        match object {
            Object::Value(Value::Blob(b)) => done(collector.blob(b)?),
            Object::Value(Value::BlobRef(BlobRef(b))) => {
                let tag = tagger::eval_reference(collector.blob(b)?);
                done(tag.ok_or_else(|| frame.goal.unsound())?)
            }
            Object::Value(Value::ValueTree(ValueTree(t)))
            | Object::Value(Value::ValueTreeRef(ValueTreeRef(t))) => {
                self.eval_tree(frame, object, t, false)
            }
            Object::ObjectTree(ObjectTree(t)) => self.eval_tree(frame, object, t, true),
            Object::Thunk(thunk) => match &frame.children[..] {
                [] => match collector.eval(object)? {
                    Some(tag) => done(tag),
                    None => Ok(Action::Call(Goal::Force(thunk))),
                },
                [think] => match think.and_then(Coupon::think) {
                    Some(think) => Ok(Action::Call(Goal::Eval(think.rhs()))),
                    None => Ok(Action::Done(None)),
                },
                [think, eval, ..] => {
                    let (Some(think), Some(eval)) = (
                        think.and_then(Coupon::think),
                        eval.and_then(Coupon::eval),
                    ) else {
                        return Ok(Action::Done(None));
                    };
                    let tag = tagger::eval_think(think, eval).ok_or_else(|| frame.goal.unsound())?;
                    done(collector.materialize(tag)?)
                }
            },
        }
    }

    /// Strict evaluation of an object tree (`memo`) or lifting of a value
    /// tree. Tags only need their subject evaluated.
    fn eval_tree(
        &mut self,
        frame: &mut Frame,
        object: Object,
        tree: TreeName,
        memo: bool,
    ) -> Result<Action> {
        let collector = self.collector();
        let elements = match &frame.elements {
            Some(elements) => elements.clone(),
            None => {
                if memo {
                    if let Some(tag) = collector.eval(object)? {
                        return done(tag);
                    }
                }
                let elements = self.storage.get_tree(&tree)?;
                frame.elements = Some(elements.clone());
                elements
            }
        };
        let exchange = memo && tree.is_tag() && elements.len() == 3;
        let wanted = if exchange { 1 } else { elements.len() };
        let i = frame.children.len();
        if i < wanted {
            return Ok(Action::Call(Goal::Eval(elements[i].unwrap::<Object>()?)));
        }
        let Some(tags) = frame
            .children
            .iter()
            .map(|c| c.and_then(Coupon::eval))
            .collect::<Option<Vec<EvalTag>>>()
        else {
            return Ok(Action::Done(None));
        };
        let tag = if exchange {
            let mut values = elements.to_vec();
            values[0] = tags[0].rhs().into();
            let rhs = ValueTree(self.storage.create_tree(&values, true)?);
            tagger::exchange_tag((object, &elements[..]), (rhs, &values[..]), tags[0])
        } else {
            let values: Vec<Fix> = tags.iter().map(|t| t.rhs().into()).collect();
            let rhs = match object {
                Object::Value(Value::ValueTree(t)) if values[..] == elements[..] => t,
                _ => ValueTree(self.storage.create_tree(&values, tree.is_tag())?),
            };
            tagger::combine_eval((object, &elements[..]), (rhs, &values[..]), &tags)
        };
        let tag = tag.ok_or_else(|| frame.goal.unsound())?;
        if memo {
            done(collector.materialize(tag)?)
        } else {
            done(tag)
        }
    }

    fn shallow(&mut self, frame: &mut Frame, object: Object) -> Result<Action> {
        let Object::Thunk(thunk) = object else {
            let tag = ShallowTag::immediate(object).ok_or_else(|| frame.goal.unsound())?;
            return done(tag);
        };
        match &frame.children[..] {
            [] => Ok(Action::Call(Goal::Force(thunk))),
            [think] => match think.and_then(Coupon::think) {
                Some(think) => Ok(Action::Call(Goal::Shallow(think.rhs()))),
                None => Ok(Action::Done(None)),
            },
            [think, shallow, ..] => {
                let (Some(think), Some(shallow)) = (
                    think.and_then(Coupon::think),
                    shallow.and_then(Coupon::shallow),
                ) else {
                    return Ok(Action::Done(None));
                };
                done(tagger::shallow_think(think, shallow).ok_or_else(|| frame.goal.unsound())?)
            }
        }
    }

    fn reduce(&mut self, frame: &mut Frame, expression: Expression) -> Result<Action> {
        match expression {
            Expression::Object(o) => done(ReduceTag::object(o)),
            Expression::Encode(Encode::Strict(thunk)) => match &frame.children[..] {
                [] => Ok(Action::Call(Goal::Eval(Object::Thunk(thunk)))),
                [eval, ..] => match eval.and_then(Coupon::eval) {
                    Some(eval) => {
                        done(tagger::reduce_strict(eval).ok_or_else(|| frame.goal.unsound())?)
                    }
                    None => Ok(Action::Done(None)),
                },
            },
            Expression::Encode(Encode::Shallow(thunk)) => match &frame.children[..] {
                [] => Ok(Action::Call(Goal::Force(thunk))),
                [think] => match think.and_then(Coupon::think) {
                    Some(think) => Ok(Action::Call(Goal::Shallow(think.rhs()))),
                    None => Ok(Action::Done(None)),
                },
                [think, shallow, ..] => {
                    let (Some(think), Some(shallow)) = (
                        think.and_then(Coupon::think),
                        shallow.and_then(Coupon::shallow),
                    ) else {
                        return Ok(Action::Done(None));
                    };
                    let tag = tagger::reduce_shallow(think, shallow);
                    done(tag.ok_or_else(|| frame.goal.unsound())?)
                }
            },
            Expression::ExpressionTree(tree) => self.reduce_tree(frame, tree),
        }
    }

    fn reduce_tree(&mut self, frame: &mut Frame, tree: ExpressionTree) -> Result<Action> {
        let elements = match &frame.elements {
            Some(elements) => elements.clone(),
            None => {
                if let Some(tag) = self.collector().retype(tree)? {
                    return done(tag);
                }
                let elements = self.storage.get_tree(tree.tree())?;
                frame.elements = Some(elements.clone());
                elements
            }
        };
        let i = frame.children.len();
        if i < elements.len() {
            return Ok(Action::Call(Goal::Reduce(elements[i].unwrap::<Expression>()?)));
        }
        let Some(tags) = frame
            .children
            .iter()
            .map(|c| c.and_then(Coupon::reduce))
            .collect::<Option<Vec<ReduceTag>>>()
        else {
            return Ok(Action::Done(None));
        };
        let objects: Vec<Fix> = tags.iter().map(|t| t.rhs().into()).collect();
        let rhs = ObjectTree(self.storage.create_tree(&objects, tree.tree().is_tag())?);
        let tag = tagger::combine_reduce((tree, &elements[..]), (rhs, &objects[..]), &tags);
        done(tag.ok_or_else(|| frame.goal.unsound())?)
    }

    fn force(&mut self, frame: &mut Frame, thunk: Thunk) -> Result<Action> {
        match thunk {
            Thunk::Identification(v) => done(self.collector().identify(v)?),
            Thunk::Application(tree) => match &frame.children[..] {
                [] => Ok(Action::Call(Goal::Reduce(Expression::ExpressionTree(tree)))),
                [reduce] => match reduce.and_then(Coupon::reduce).map(|t| t.rhs()) {
                    Some(Object::ObjectTree(combination)) => {
                        Ok(Action::Call(Goal::Apply(combination)))
                    }
                    Some(other) => Err(FixError::KindMismatch {
                        expected: "ObjectTree",
                        found: other.into(),
                    }),
                    None => Ok(Action::Done(None)),
                },
                [reduce, apply, ..] => {
                    let (Some(reduce), Some(apply)) = (
                        reduce.and_then(Coupon::reduce),
                        apply.and_then(Coupon::apply),
                    ) else {
                        return Ok(Action::Done(None));
                    };
                    let tag = tagger::think_apply(reduce, apply);
                    done(tag.ok_or_else(|| frame.goal.unsound())?)
                }
            },
            Thunk::Selection(selection) => match &frame.children[..] {
                [] => {
                    let elements = self.storage.get_tree(selection.tree())?;
                    let (target, _) = parse_selection(selection, &elements)?;
                    Ok(Action::Call(Goal::Shallow(target)))
                }
                [shallow, ..] => match shallow.and_then(Coupon::shallow) {
                    Some(shallow) => Ok(Action::Done(
                        self.collector()
                            .select(selection, shallow)?
                            .map(Coupon::from),
                    )),
                    None => Ok(Action::Done(None)),
                },
            },
        }
    }
}

/// Evaluates goals on the calling thread in resumable passes
#[derive(Debug)]
pub struct LocalScheduler {
    storage: Arc<RuntimeStorage>,
    runner: Arc<dyn Runner>,
    continuation: Vec<SavedFrame>,
    passes: usize,
}

impl LocalScheduler {
    pub fn new(storage: Arc<RuntimeStorage>, runner: Arc<dyn Runner>) -> Self {
        Self {
            storage,
            runner,
            continuation: vec![],
            passes: 0,
        }
    }

    #[inline]
    pub fn storage(&self) -> &Arc<RuntimeStorage> {
        &self.storage
    }

    /// Number of passes the last `schedule` took
    #[inline]
    pub fn passes(&self) -> usize {
        self.passes
    }

    /// The continuation left by the last pass
    #[inline]
    pub fn continuation(&self) -> &[SavedFrame] {
        &self.continuation
    }

    /// Runs passes until `goal` has a strict value
    #[instrument(level = "debug", skip(self), fields(goal = %Fix::from(goal)))]
    pub fn schedule(&mut self, goal: Object) -> Result<EvalTag> {
        self.continuation.clear();
        self.passes = 0;
        loop {
            self.passes += 1;
            let mut pass = Pass::new(&self.storage, std::mem::take(&mut self.continuation));
            let result = pass.run(Goal::Eval(goal))?;
            let Pass { next, pending, .. } = pass;
            self.continuation = next;
            if let Some(tag) = result.and_then(Coupon::eval) {
                debug!(passes = self.passes, "scheduled {}", Fix::from(tag.rhs()));
                return Ok(tag);
            }
            debug!(
                pass = self.passes,
                pending = pending.len(),
                frames = self.continuation.len(),
                "pass suspended"
            );
            if pending.is_empty() {
                // nothing left to run, yet the goal can't finish
                return Err(FixError::HandleNotFound(goal.into()));
            }
            for combination in pending {
                apply_memoized(&self.storage, self.runner.as_ref(), combination)?;
            }
        }
    }
}
