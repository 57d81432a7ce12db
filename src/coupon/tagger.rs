//! Pure combinators deriving new coupons from old ones.
//!
//! None of these touch storage. Each one checks that its premises fit
//! together and returns `None` when they don't, in which case the caller has
//! to make more progress first.

use super::{ApplyTag, EquivalenceTag, EvalTag, ReduceTag, ShallowTag, ThinkTag};
use crate::evaluator::lower;
use crate::handle::{
    Encode, Expression, ExpressionTree, Fix, Object, ObjectTree, Thunk, TreeName, Value,
    ValueTree, ValueTreeRef,
};

pub fn refl(handle: Fix) -> EquivalenceTag {
    EquivalenceTag::new(handle, handle)
}

pub fn symm(eq: EquivalenceTag) -> EquivalenceTag {
    EquivalenceTag::new(eq.rhs(), eq.lhs())
}

pub fn trans(a: EquivalenceTag, b: EquivalenceTag) -> Option<EquivalenceTag> {
    (a.rhs() == b.lhs()).then(|| EquivalenceTag::new(a.lhs(), b.rhs()))
}

/// Moves an eval coupon from `eq.lhs` to the equivalent `eq.rhs`
pub fn rewrite_eval(eq: EquivalenceTag, tag: EvalTag) -> Option<EvalTag> {
    if eq.lhs() != Fix::from(tag.lhs()) {
        return None;
    }
    let lhs = eq.rhs().try_into_kind::<Object>()?;
    Some(EvalTag::new(lhs, tag.rhs()))
}

pub fn rewrite_reduce(eq: EquivalenceTag, tag: ReduceTag) -> Option<ReduceTag> {
    if eq.lhs() != Fix::from(tag.lhs()) {
        return None;
    }
    let lhs = eq.rhs().try_into_kind::<Expression>()?;
    Some(ReduceTag::new(lhs, tag.rhs()))
}

pub fn rewrite_think(eq: EquivalenceTag, tag: ThinkTag) -> Option<ThinkTag> {
    if eq.lhs() != Fix::from(tag.lhs()) {
        return None;
    }
    let lhs = eq.rhs().try_into_kind::<Thunk>()?;
    Some(ThinkTag::new(lhs, tag.rhs()))
}

/// A reference evaluates to whatever its eager form evaluates to
pub fn eval_reference(tag: EvalTag) -> Option<EvalTag> {
    match tag.lhs() {
        Object::Value(v @ (Value::Blob(_) | Value::ValueTree(_))) => {
            Some(EvalTag::new(Object::Value(lower(v)), tag.rhs()))
        }
        _ => None,
    }
}

/// `t => o` and `o => v` give `t => v`
pub fn eval_think(think: ThinkTag, eval: EvalTag) -> Option<EvalTag> {
    (think.rhs() == eval.lhs()).then(|| EvalTag::new(Object::Thunk(think.lhs()), eval.rhs()))
}

pub fn shallow_think(think: ThinkTag, shallow: ShallowTag) -> Option<ShallowTag> {
    (think.rhs() == shallow.lhs())
        .then(|| ShallowTag::new(Object::Thunk(think.lhs()), shallow.rhs()))
}

/// An application forces to the result of applying its reduced combination
pub fn think_apply(reduce: ReduceTag, apply: ApplyTag) -> Option<ThinkTag> {
    let Expression::ExpressionTree(tree) = reduce.lhs() else {
        return None;
    };
    (reduce.rhs() == Object::ObjectTree(apply.lhs()))
        .then(|| ThinkTag::new(Thunk::Application(tree), apply.rhs()))
}

pub fn reduce_strict(eval: EvalTag) -> Option<ReduceTag> {
    let Object::Thunk(thunk) = eval.lhs() else {
        return None;
    };
    Some(ReduceTag::new(
        Expression::Encode(Encode::Strict(thunk)),
        Object::Value(eval.rhs()),
    ))
}

pub fn reduce_shallow(think: ThinkTag, shallow: ShallowTag) -> Option<ReduceTag> {
    (think.rhs() == shallow.lhs()).then(|| {
        ReduceTag::new(
            Expression::Encode(Encode::Shallow(think.lhs())),
            shallow.rhs(),
        )
    })
}

fn tree_of(object: Object) -> Option<TreeName> {
    match object {
        Object::ObjectTree(ObjectTree(t))
        | Object::Value(Value::ValueTree(ValueTree(t)))
        | Object::Value(Value::ValueTreeRef(ValueTreeRef(t))) => Some(t),
        _ => None,
    }
}

/// Checks that `tags` take `lhs` to `rhs` element by element
fn pointwise<L, R>(lhs: &[Fix], rhs: &[Fix], tags: &[(L, R)]) -> bool
where
    L: Into<Fix> + Copy,
    R: Into<Fix> + Copy,
{
    lhs.len() == tags.len()
        && rhs.len() == tags.len()
        && tags
            .iter()
            .zip(lhs.iter().zip(rhs))
            .all(|(&(l, r), (el, er))| {
                Into::<Fix>::into(l) == *el && Into::<Fix>::into(r) == *er
            })
}

/// Combines one reduce coupon per element into a coupon for the whole tree
pub fn combine_reduce(
    lhs: (ExpressionTree, &[Fix]),
    rhs: (ObjectTree, &[Fix]),
    tags: &[ReduceTag],
) -> Option<ReduceTag> {
    let pairs: Vec<_> = tags.iter().map(|t| (t.lhs(), t.rhs())).collect();
    let same_flag = lhs.0.tree().is_tag() == rhs.0.tree().is_tag();
    (same_flag && pointwise(lhs.1, rhs.1, &pairs)).then(|| {
        ReduceTag::new(
            Expression::ExpressionTree(lhs.0),
            Object::ObjectTree(rhs.0),
        )
    })
}

/// Combines one eval coupon per element of an object tree (or of a value
/// tree being lifted) into a coupon for the whole tree
pub fn combine_eval(
    lhs: (Object, &[Fix]),
    rhs: (ValueTree, &[Fix]),
    tags: &[EvalTag],
) -> Option<EvalTag> {
    let tree = tree_of(lhs.0)?;
    let pairs: Vec<_> = tags.iter().map(|t| (t.lhs(), t.rhs())).collect();
    (tree.is_tag() == rhs.0.tree().is_tag() && pointwise(lhs.1, rhs.1, &pairs))
        .then(|| EvalTag::new(lhs.0, Value::ValueTree(rhs.0)))
}

/// Evaluating a tag `[subject, author, type]` only evaluates its subject; the
/// author and type are carried over to the evaluated tag unchanged.
pub fn exchange_tag(
    lhs: (Object, &[Fix]),
    rhs: (ValueTree, &[Fix]),
    subject: EvalTag,
) -> Option<EvalTag> {
    let tree = tree_of(lhs.0)?;
    let ([s, author, ty], [v, author2, ty2]) = (lhs.1, rhs.1) else {
        return None;
    };
    let carried = author == author2
        && ty == ty2
        && author.try_into_kind::<Value>().is_some()
        && ty.try_into_kind::<Value>().is_some();
    (tree.is_tag()
        && rhs.0.tree().is_tag()
        && carried
        && *s == Fix::from(subject.lhs())
        && *v == Fix::from(subject.rhs()))
    .then(|| EvalTag::new(lhs.0, Value::ValueTree(rhs.0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{Blob, BlobRef, Digest, Name, DIGEST_LEN};

    fn num(n: u64) -> Value {
        Value::Blob(Blob::from_u64(n))
    }

    fn tree(byte: u8, size: u64, tag: bool) -> TreeName {
        TreeName::new(Name::canonical(Digest([byte; DIGEST_LEN]), size), tag)
    }

    #[test]
    fn test_equivalence_laws() {
        let a = Fix::from(num(1));
        let local = Fix::from(Blob::Named(Name::local(0, 40)));
        let canonical = Fix::from(Blob::Named(Name::canonical(Digest([1; DIGEST_LEN]), 40)));
        let eq = EquivalenceTag::new(local, canonical);
        assert_eq!(refl(a).lhs(), refl(a).rhs());
        assert_eq!(symm(symm(eq)), eq);
        assert_eq!(trans(eq, symm(eq)), Some(refl(local)));
        assert_eq!(trans(eq, eq), None);
    }

    #[test]
    fn test_rewrite_eval() {
        let local = Value::Blob(Blob::Named(Name::local(0, 40)));
        let canonical = Value::Blob(Blob::Named(Name::canonical(Digest([1; DIGEST_LEN]), 40)));
        let tag = EvalTag::new(Object::Value(local), canonical);
        let eq = EquivalenceTag::new(local.into(), canonical.into());
        let moved = rewrite_eval(eq, tag).unwrap();
        assert_eq!(moved.lhs(), Object::Value(canonical));
        assert_eq!(rewrite_eval(symm(eq), tag), None);
    }

    #[test]
    fn test_chain_through_think() {
        let t = Thunk::Identification(num(3));
        let think = ThinkTag::new(t, Object::Value(num(3)));
        let eval = EvalTag::new(Object::Value(num(3)), num(3));
        let chained = eval_think(think, eval).unwrap();
        assert_eq!(chained.lhs(), Object::Thunk(t));
        let reduced = reduce_strict(chained).unwrap();
        assert_eq!(reduced.lhs(), Expression::Encode(Encode::Strict(t)));
        assert_eq!(reduce_strict(eval), None);
        let other = EvalTag::new(Object::Value(num(4)), num(4));
        assert_eq!(eval_think(think, other), None);
    }

    #[test]
    fn test_think_apply_requires_matching_combination() {
        let expr = ExpressionTree(tree(1, 2, false));
        let combination = ObjectTree(tree(2, 2, false));
        let reduce = ReduceTag::new(
            Expression::ExpressionTree(expr),
            Object::ObjectTree(combination),
        );
        let apply = ApplyTag::new(combination, Object::Value(num(9)));
        let think = think_apply(reduce, apply).unwrap();
        assert_eq!(think.lhs(), Thunk::Application(expr));
        assert_eq!(think.rhs(), Object::Value(num(9)));

        let elsewhere = ApplyTag::new(ObjectTree(tree(3, 2, false)), Object::Value(num(9)));
        assert_eq!(think_apply(reduce, elsewhere), None);
    }

    #[test]
    fn test_combine_eval_checks_every_element() {
        let lhs = ObjectTree(tree(1, 2, false));
        let rhs = ValueTree(tree(2, 2, false));
        let t = Thunk::Identification(num(5));
        let lhs_elements = [Fix::from(t), Fix::from(num(1))];
        let rhs_elements = [Fix::from(num(5)), Fix::from(num(1))];
        let tags = [
            EvalTag::new(Object::Thunk(t), num(5)),
            EvalTag::new(Object::Value(num(1)), num(1)),
        ];
        let combined = combine_eval(
            (Object::ObjectTree(lhs), &lhs_elements[..]),
            (rhs, &rhs_elements[..]),
            &tags,
        )
        .unwrap();
        assert_eq!(combined.rhs(), Value::ValueTree(rhs));
        assert_eq!(
            combine_eval((Object::ObjectTree(lhs), &lhs_elements[..]), (rhs, &rhs_elements[..]), &tags[..1]),
            None
        );
        let wrong = [tags[1], tags[0]];
        assert_eq!(
            combine_eval((Object::ObjectTree(lhs), &lhs_elements[..]), (rhs, &rhs_elements[..]), &wrong),
            None
        );
    }

    #[test]
    fn test_exchange_tag() {
        let author = Fix::from(Blob::literal(b"tag").unwrap());
        let ty = Fix::from(Blob::literal(b"u64").unwrap());
        let t = Thunk::Identification(num(5));
        let lhs = ObjectTree(tree(1, 3, true));
        let rhs = ValueTree(tree(2, 3, true));
        let subject = EvalTag::new(Object::Thunk(t), num(5));
        let lhs_elements = [Fix::from(t), author, ty];
        let rhs_elements = [Fix::from(num(5)), author, ty];
        let exchanged = exchange_tag(
            (Object::ObjectTree(lhs), &lhs_elements[..]),
            (rhs, &rhs_elements[..]),
            subject,
        )
        .unwrap();
        assert_eq!(exchanged.lhs(), Object::ObjectTree(lhs));

        // the type can't change along the way
        let forged = [Fix::from(num(5)), author, author];
        assert_eq!(
            exchange_tag((Object::ObjectTree(lhs), &lhs_elements[..]), (rhs, &forged[..]), subject),
            None
        );
        // and plain trees aren't tags
        let plain = ValueTree(tree(2, 3, false));
        assert_eq!(
            exchange_tag((Object::ObjectTree(lhs), &lhs_elements[..]), (plain, &rhs_elements[..]), subject),
            None
        );
    }

    #[test]
    fn test_eval_reference() {
        let b = Blob::from_u64(1);
        let tag = EvalTag::new(Object::Value(Value::Blob(b)), Value::Blob(b));
        let by_ref = eval_reference(tag).unwrap();
        assert_eq!(by_ref.lhs(), Object::Value(Value::BlobRef(BlobRef(b))));
        assert_eq!(eval_reference(by_ref), None);
    }
}
