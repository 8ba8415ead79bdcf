//! Capabilities: declared method sets whose wire types are harvested from a
//! mock implementation.
//!
//! A capability (a trait object type such as `dyn Greeter`) never crosses the
//! wire. Registering it together with a mock seeds the type registry with
//! every parameter and result type its methods mention, so values of those
//! types can be exchanged.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::codec::ValueCodec;
use crate::error::Error;
use crate::function::{IntoResults, Signature};
use crate::types::{TypeEntry, WireType};

/// Describes the methods of a capability trait.
///
/// ```ignore
/// trait Greeter: Send + Sync {
///     fn greet(&self, name: String) -> String;
/// }
///
/// impl Capability for dyn Greeter {
///     fn name() -> &'static str {
///         "Greeter"
///     }
///
///     fn describe<C: ValueCodec>(methods: &mut MethodSet<C>) {
///         methods.method::<(String,), String>("greet");
///     }
/// }
/// ```
pub trait Capability: Send + Sync + 'static {
    fn name() -> &'static str;

    fn describe<C: ValueCodec>(methods: &mut MethodSet<C>);
}

/// Tuple of parameter types for a capability method.
pub trait ParamTypes {
    fn param_types<C: ValueCodec>() -> Vec<TypeEntry<C>>;
}

macro_rules! impl_param_types {
    ($($ty:ident),*) => {
        impl<$($ty: WireType),*> ParamTypes for ($($ty,)*) {
            fn param_types<C: ValueCodec>() -> Vec<TypeEntry<C>> {
                vec![$(TypeEntry::of::<$ty>()),*]
            }
        }
    };
}

impl_param_types!();
impl_param_types!(A1);
impl_param_types!(A1, A2);
impl_param_types!(A1, A2, A3);
impl_param_types!(A1, A2, A3, A4);
impl_param_types!(A1, A2, A3, A4, A5);
impl_param_types!(A1, A2, A3, A4, A5, A6);
impl_param_types!(A1, A2, A3, A4, A5, A6, A7);
impl_param_types!(A1, A2, A3, A4, A5, A6, A7, A8);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSignature {
    pub name: String,
    pub signature: Signature,
}

/// Collects method signatures while a capability describes itself.
pub struct MethodSet<C> {
    methods: Vec<MethodSignature>,
    types: Vec<TypeEntry<C>>,
    duplicate: Option<String>,
}

impl<C: ValueCodec> MethodSet<C> {
    pub(crate) fn new() -> Self {
        Self {
            methods: Vec::new(),
            types: Vec::new(),
            duplicate: None,
        }
    }

    pub fn method<P: ParamTypes, R: IntoResults>(&mut self, name: &str) -> &mut Self {
        if self.methods.iter().any(|m| m.name == name) {
            self.duplicate.get_or_insert_with(|| name.to_string());
            return self;
        }
        let params = P::param_types::<C>();
        let results = R::result_types::<C>();
        self.methods.push(MethodSignature {
            name: name.to_string(),
            signature: Signature::from_entries(&params, &results),
        });
        self.types.extend(params);
        self.types.extend(results);
        self
    }

    pub(crate) fn finish(
        self,
        capability: &str,
    ) -> Result<(Vec<MethodSignature>, Vec<TypeEntry<C>>), Error> {
        if let Some(name) = self.duplicate {
            return Err(Error::InvalidRegistration(format!(
                "capability {capability} declares method `{name}` more than once"
            )));
        }
        if self.methods.is_empty() {
            return Err(Error::InvalidRegistration(format!(
                "capability {capability} declares no methods"
            )));
        }
        Ok((self.methods, self.types))
    }
}

/// A registered capability and its mock.
#[derive(Clone)]
pub struct CapabilityEntry {
    name: &'static str,
    rust_name: &'static str,
    methods: Vec<MethodSignature>,
    mock: Arc<dyn Any + Send + Sync>,
}

impl CapabilityEntry {
    pub(crate) fn new<I: Capability + ?Sized>(mock: Arc<I>, methods: Vec<MethodSignature>) -> Self {
        Self {
            name: I::name(),
            rust_name: std::any::type_name::<I>(),
            methods,
            mock: Arc::new(mock),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn rust_name(&self) -> &'static str {
        self.rust_name
    }

    pub fn methods(&self) -> &[MethodSignature] {
        &self.methods
    }

    pub fn method(&self, name: &str) -> Option<&Signature> {
        self.methods
            .iter()
            .find(|m| m.name == name)
            .map(|m| &m.signature)
    }
}

impl fmt::Debug for CapabilityEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityEntry")
            .field("name", &self.name)
            .field("rust_name", &self.rust_name)
            .field("methods", &self.methods)
            .finish()
    }
}

/// Capability name → capability entry.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    entries: HashMap<&'static str, CapabilityEntry>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, entry: CapabilityEntry) -> Option<CapabilityEntry> {
        self.entries.insert(entry.name, entry)
    }

    pub fn get(&self, name: &str) -> Option<&CapabilityEntry> {
        self.entries.get(name)
    }

    /// The mock registered for capability `I`.
    pub fn mock<I: Capability + ?Sized>(&self) -> Option<Arc<I>> {
        self.entries
            .get(I::name())?
            .mock
            .downcast_ref::<Arc<I>>()
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
