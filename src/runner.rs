//! The `Runner` executes a procedure against a combination. The runtime only
//! ever calls it from `apply`, once per combination, and treats it as a
//! black box that may be slow.
//!
//! A combination is an `ObjectTree` whose element 0 names the procedure (a
//! blob) and whose remaining elements are the arguments. `NativeRunner`
//! resolves procedure blobs to Rust closures, which is how the CLI, the tests
//! and the benches define programs.

use std::fmt::Debug;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::{FixError, Result};
use crate::handle::{
    Blob, Encode, Expression, Fix, Object, ObjectTree, Thunk, Value,
};
use crate::storage::RuntimeStorage;

/// What a procedure sees while it runs. The running procedure is explicit
/// here: tags minted through `create_tag` are authored by it.
pub struct Context<'a> {
    storage: &'a RuntimeStorage,
    procedure: Blob,
    combination: ObjectTree,
}

impl<'a> Context<'a> {
    pub fn new(storage: &'a RuntimeStorage, procedure: Blob, combination: ObjectTree) -> Self {
        Self {
            storage,
            procedure,
            combination,
        }
    }

    #[inline]
    pub fn storage(&self) -> &'a RuntimeStorage {
        self.storage
    }

    #[inline]
    pub fn procedure(&self) -> Blob {
        self.procedure
    }

    #[inline]
    pub fn combination(&self) -> ObjectTree {
        self.combination
    }

    pub fn create_blob(&self, bytes: &[u8]) -> Result<Blob> {
        self.storage.create_blob(bytes)
    }

    pub fn create_tag(&self, subject: Object, ty: Blob) -> Result<Object> {
        self.storage.create_tag(subject, self.procedure, ty)
    }

    /// Builds the thunk `procedure(args...)`
    pub fn application(&self, procedure: Blob, args: &[Expression]) -> Result<Thunk> {
        let mut elements = Vec::with_capacity(args.len() + 1);
        elements.push(Expression::Object(Object::Value(Value::Blob(procedure))));
        elements.extend_from_slice(args);
        Ok(Thunk::Application(
            self.storage.create_expression_tree(&elements)?,
        ))
    }

    /// Reads an argument as a little-endian integer
    pub fn u64_arg(&self, arg: &Object) -> Result<u64> {
        let bytes = self.bytes_arg(arg)?;
        if bytes.len() > 8 {
            return Err(FixError::Procedure(format!(
                "{} is not a u64",
                Fix::from(*arg)
            )));
        }
        let mut buf = [0; 8];
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn bytes_arg(&self, arg: &Object) -> Result<Arc<[u8]>> {
        match arg {
            Object::Value(Value::Blob(b)) => self.storage.get_blob(b),
            other => Err(FixError::Procedure(format!(
                "expected a blob, got {}",
                Fix::from(*other)
            ))),
        }
    }
}

pub trait Runner: Send + Sync + Debug {
    /// Runs `procedure` on `args`, the elements of the combination after the
    /// procedure itself
    fn run(&self, ctx: &Context<'_>, args: &[Object]) -> Result<Object>;
}

/// Loads a combination, splits off its procedure and hands it to `runner`
pub fn invoke(
    runner: &dyn Runner,
    storage: &RuntimeStorage,
    combination: ObjectTree,
) -> Result<Object> {
    let elements = storage.get_tree(combination.tree())?;
    let (head, args) = elements
        .split_first()
        .ok_or_else(|| FixError::Procedure("empty combination".into()))?;
    let procedure = match head.try_into_kind::<Value>() {
        Some(Value::Blob(b)) => b,
        Some(Value::BlobRef(r)) => r.0,
        _ => {
            return Err(FixError::Procedure(format!(
                "{head} does not name a procedure"
            )))
        }
    };
    let args = args
        .iter()
        .map(|a| a.unwrap::<Object>())
        .collect::<Result<Vec<_>>>()?;
    let ctx = Context::new(storage, procedure, combination);
    runner.run(&ctx, &args)
}

pub type Procedure = dyn Fn(&Context<'_>, &[Object]) -> Result<Object> + Send + Sync;

/// Procedures implemented in Rust, addressed by the bytes of their name
#[derive(Clone, Default)]
pub struct NativeRunner {
    procedures: IndexMap<Vec<u8>, Arc<Procedure>>,
}

impl Debug for NativeRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeRunner")
            .field(
                "procedures",
                &self
                    .procedures
                    .keys()
                    .map(|k| String::from_utf8_lossy(k))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl NativeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// A runner preloaded with `add`, `mul`, `fib` and `tag`
    pub fn with_builtins() -> Self {
        let mut runner = Self::new();
        runner.register("add", |ctx, args| binop(ctx, args, u64::wrapping_add));
        runner.register("mul", |ctx, args| binop(ctx, args, u64::wrapping_mul));
        runner.register("fib", fib);
        runner.register("tag", |ctx, args| match args {
            [subject, ty] => {
                let ty = match ty {
                    Object::Value(Value::Blob(b)) => *b,
                    _ => return Err(FixError::Procedure("tag type must be a blob".into())),
                };
                ctx.create_tag(*subject, ty)
            }
            _ => Err(FixError::Procedure("tag takes 2 arguments".into())),
        });
        runner
    }

    pub fn register<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&Context<'_>, &[Object]) -> Result<Object> + Send + Sync + 'static,
    {
        self.procedures.insert(name.as_bytes().to_vec(), Arc::new(f));
        self
    }

    /// The blob naming a registered procedure
    pub fn procedure(name: &str) -> Blob {
        Blob::literal(name.as_bytes()).expect("procedure names are short")
    }

    pub fn names(&self) -> impl Iterator<Item = String> + '_ {
        self.procedures
            .keys()
            .map(|k| String::from_utf8_lossy(k).into_owned())
    }
}

impl Runner for NativeRunner {
    fn run(&self, ctx: &Context<'_>, args: &[Object]) -> Result<Object> {
        let name = ctx.storage().get_blob(&ctx.procedure())?;
        let procedure = self.procedures.get(&name[..]).ok_or_else(|| {
            FixError::Procedure(format!(
                "unknown procedure {}",
                String::from_utf8_lossy(&name)
            ))
        })?;
        procedure(ctx, args)
    }
}

fn binop(ctx: &Context<'_>, args: &[Object], op: fn(u64, u64) -> u64) -> Result<Object> {
    match args {
        [a, b] => {
            let n = op(ctx.u64_arg(a)?, ctx.u64_arg(b)?);
            Ok(Object::Value(Value::Blob(Blob::from_u64(n))))
        }
        _ => Err(FixError::Procedure(format!(
            "expected 2 arguments, got {}",
            args.len()
        ))),
    }
}

/// `fib(n)` for `n < 2` is `n`; otherwise it is the thunk
/// `add(Strict(fib(n - 1)), Strict(fib(n - 2)))`, leaving the recursion to the
/// runtime so that shared calls are memoized.
fn fib(ctx: &Context<'_>, args: &[Object]) -> Result<Object> {
    let [n] = args else {
        return Err(FixError::Procedure("fib takes 1 argument".into()));
    };
    let n = ctx.u64_arg(n)?;
    if n < 2 {
        return Ok(Object::Value(Value::Blob(Blob::from_u64(n))));
    }
    let recurse = |k: u64| -> Result<Expression> {
        let arg = Expression::Object(Object::Value(Value::Blob(Blob::from_u64(k))));
        let call = ctx.application(ctx.procedure(), &[arg])?;
        Ok(Expression::Encode(Encode::Strict(call)))
    };
    let add = ctx.application(
        NativeRunner::procedure("add"),
        &[recurse(n - 1)?, recurse(n - 2)?],
    )?;
    Ok(Object::Thunk(add))
}
