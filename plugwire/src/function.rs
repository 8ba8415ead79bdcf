//! Function registry and the adapters that turn plain Rust closures into
//! `ordered values in → ordered values out` callables.
//!
//! Closures of up to eight parameters implement [`Handler`]; each parameter
//! and result type must be a [`WireType`]. Results may be `()`, a single wire
//! type, a tuple of up to four wire types, or a `Result` of any of those whose
//! error is reported back to the caller.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::codec::ValueCodec;
use crate::error::Error;
use crate::types::{TypeEntry, WireType};
use crate::values::AnyValue;

/// How a registered function expects its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Fixed,
    /// The last parameter is a sequence; callers may pass it whole or spread.
    Variadic,
}

/// Wire names of a function's parameters and results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<String>,
    pub results: Vec<String>,
}

impl Signature {
    pub(crate) fn from_entries<C: ValueCodec>(
        params: &[TypeEntry<C>],
        results: &[TypeEntry<C>],
    ) -> Self {
        Self {
            params: params.iter().map(|t| t.name().to_string()).collect(),
            results: results.iter().map(|t| t.name().to_string()).collect(),
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.params.join(", "))?;
        match self.results.len() {
            0 => Ok(()),
            1 => write!(f, " -> {}", self.results[0]),
            _ => write!(f, " -> ({})", self.results.join(", ")),
        }
    }
}

/// Conversion of a function's return value into result values.
pub trait IntoResults: Send + 'static {
    fn result_types<C: ValueCodec>() -> Vec<TypeEntry<C>>;

    /// `func_id` labels errors raised by fallible functions.
    fn into_results(self, func_id: &str) -> Result<Vec<AnyValue>, Error>;
}

impl IntoResults for () {
    fn result_types<C: ValueCodec>() -> Vec<TypeEntry<C>> {
        Vec::new()
    }

    fn into_results(self, _func_id: &str) -> Result<Vec<AnyValue>, Error> {
        Ok(Vec::new())
    }
}

impl<T: WireType> IntoResults for T {
    fn result_types<C: ValueCodec>() -> Vec<TypeEntry<C>> {
        vec![TypeEntry::of::<T>()]
    }

    fn into_results(self, _func_id: &str) -> Result<Vec<AnyValue>, Error> {
        Ok(vec![Box::new(self)])
    }
}

impl<R, E> IntoResults for Result<R, E>
where
    R: IntoResults,
    E: fmt::Display + Send + 'static,
{
    fn result_types<C: ValueCodec>() -> Vec<TypeEntry<C>> {
        R::result_types::<C>()
    }

    fn into_results(self, func_id: &str) -> Result<Vec<AnyValue>, Error> {
        match self {
            Ok(results) => results.into_results(func_id),
            Err(e) => Err(Error::function_failed(func_id, e.to_string())),
        }
    }
}

macro_rules! impl_tuple_results {
    ($($ty:ident),+) => {
        impl<$($ty: WireType),+> IntoResults for ($($ty,)+) {
            fn result_types<C: ValueCodec>() -> Vec<TypeEntry<C>> {
                vec![$(TypeEntry::of::<$ty>()),+]
            }

            #[allow(non_snake_case)]
            fn into_results(self, _func_id: &str) -> Result<Vec<AnyValue>, Error> {
                let ($($ty,)+) = self;
                Ok(vec![$(Box::new($ty) as AnyValue),+])
            }
        }
    };
}

impl_tuple_results!(A, B);
impl_tuple_results!(A, B, D);
impl_tuple_results!(A, B, D, E);

fn downcast_arg<T: WireType>(
    func_id: &str,
    position: usize,
    value: AnyValue,
) -> Result<T, Error> {
    value.downcast::<T>().map(|b| *b).map_err(|_| {
        Error::invalid_arguments(
            func_id,
            format!("argument {position} is not a {}", T::wire_name()),
        )
    })
}

/// A closure callable with a fixed list of wire-typed arguments.
///
/// `Args` is the tuple of parameter types; it only exists to let one closure
/// type carry a single unambiguous implementation.
pub trait Handler<Args>: Send + Sync + 'static {
    fn param_types<C: ValueCodec>() -> Vec<TypeEntry<C>>;

    fn result_types<C: ValueCodec>() -> Vec<TypeEntry<C>>;

    fn invoke(&self, func_id: &str, args: Vec<AnyValue>) -> Result<Vec<AnyValue>, Error>;
}

/// A closure whose last parameter is a `Vec<V>` collecting trailing arguments.
pub trait VariadicHandler<Args>: Send + Sync + 'static {
    fn param_types<C: ValueCodec>() -> Vec<TypeEntry<C>>;

    fn result_types<C: ValueCodec>() -> Vec<TypeEntry<C>>;

    fn invoke(&self, func_id: &str, args: Vec<AnyValue>) -> Result<Vec<AnyValue>, Error>;
}

macro_rules! impl_handler {
    ($($arg:ident),*) => {
        impl<Func, Ret, $($arg,)*> Handler<($($arg,)*)> for Func
        where
            Func: Fn($($arg),*) -> Ret + Send + Sync + 'static,
            Ret: IntoResults,
            $($arg: WireType,)*
        {
            fn param_types<C: ValueCodec>() -> Vec<TypeEntry<C>> {
                vec![$(TypeEntry::of::<$arg>()),*]
            }

            fn result_types<C: ValueCodec>() -> Vec<TypeEntry<C>> {
                Ret::result_types::<C>()
            }

            #[allow(non_snake_case, unused_mut, unused_variables)]
            fn invoke(&self, func_id: &str, args: Vec<AnyValue>) -> Result<Vec<AnyValue>, Error> {
                let arity: usize = 0 $(+ { let _ = stringify!($arg); 1 })*;
                if args.len() != arity {
                    return Err(Error::invalid_arguments(
                        func_id,
                        format!("expected {arity} arguments, got {}", args.len()),
                    ));
                }
                let mut args = args.into_iter().enumerate();
                $(
                    let $arg = match args.next() {
                        Some((position, value)) => downcast_arg::<$arg>(func_id, position, value)?,
                        None => unreachable!("arity checked above"),
                    };
                )*
                (self)($($arg),*).into_results(func_id)
            }
        }

        impl<Func, Ret, $($arg,)* V> VariadicHandler<($($arg,)* Vec<V>,)> for Func
        where
            Func: Fn($($arg,)* Vec<V>) -> Ret + Send + Sync + 'static,
            Ret: IntoResults,
            $($arg: WireType,)*
            V: WireType,
        {
            fn param_types<C: ValueCodec>() -> Vec<TypeEntry<C>> {
                vec![$(TypeEntry::of::<$arg>(),)* TypeEntry::of::<Vec<V>>(), TypeEntry::of::<V>()]
            }

            fn result_types<C: ValueCodec>() -> Vec<TypeEntry<C>> {
                Ret::result_types::<C>()
            }

            #[allow(non_snake_case, unused_mut, unused_variables)]
            fn invoke(&self, func_id: &str, args: Vec<AnyValue>) -> Result<Vec<AnyValue>, Error> {
                let fixed: usize = 0 $(+ { let _ = stringify!($arg); 1 })*;
                if args.len() < fixed {
                    return Err(Error::invalid_arguments(
                        func_id,
                        format!("expected at least {fixed} arguments, got {}", args.len()),
                    ));
                }
                let mut args = args.into_iter().enumerate();
                $(
                    let $arg = match args.next() {
                        Some((position, value)) => downcast_arg::<$arg>(func_id, position, value)?,
                        None => unreachable!("arity checked above"),
                    };
                )*
                let mut rest: Vec<(usize, AnyValue)> = args.collect();
                // A single trailing Vec<V> is the slice form; anything else is spread.
                let packed = if rest.len() == 1 && rest[0].1.is::<Vec<V>>() {
                    let (position, value) = rest.remove(0);
                    downcast_arg::<Vec<V>>(func_id, position, value)?
                } else {
                    rest.into_iter()
                        .map(|(position, value)| downcast_arg::<V>(func_id, position, value))
                        .collect::<Result<Vec<V>, Error>>()?
                };
                (self)($($arg,)* packed).into_results(func_id)
            }
        }
    };
}

impl_handler!();
impl_handler!(A1);
impl_handler!(A1, A2);
impl_handler!(A1, A2, A3);
impl_handler!(A1, A2, A3, A4);
impl_handler!(A1, A2, A3, A4, A5);
impl_handler!(A1, A2, A3, A4, A5, A6);
impl_handler!(A1, A2, A3, A4, A5, A6, A7);
impl_handler!(A1, A2, A3, A4, A5, A6, A7, A8);

type Invoke = dyn Fn(&str, Vec<AnyValue>) -> Result<Vec<AnyValue>, Error> + Send + Sync;

/// A registered function.
#[derive(Clone)]
pub struct FunctionEntry {
    kind: FunctionKind,
    signature: Signature,
    invoke: Arc<Invoke>,
}

impl FunctionEntry {
    pub(crate) fn new(
        kind: FunctionKind,
        signature: Signature,
        invoke: impl Fn(&str, Vec<AnyValue>) -> Result<Vec<AnyValue>, Error> + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            signature,
            invoke: Arc::new(invoke),
        }
    }

    pub fn kind(&self) -> FunctionKind {
        self.kind
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn invoke(&self, func_id: &str, args: Vec<AnyValue>) -> Result<Vec<AnyValue>, Error> {
        (self.invoke)(func_id, args)
    }
}

impl fmt::Debug for FunctionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionEntry")
            .field("kind", &self.kind)
            .field("signature", &self.signature)
            .finish()
    }
}

/// Identifier → registered function.
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, FunctionEntry>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, returning the entry it replaced.
    pub fn insert(&mut self, id: impl Into<String>, entry: FunctionEntry) -> Option<FunctionEntry> {
        self.functions.insert(id.into(), entry)
    }

    pub fn get(&self, id: &str) -> Option<&FunctionEntry> {
        self.functions.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.functions.contains_key(id)
    }

    /// Registered identifiers, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
