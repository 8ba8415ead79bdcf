//! Dynamically typed argument and result lists.

use std::any::Any;
use std::fmt;

/// A single decoded argument or result.
pub type AnyValue = Box<dyn Any + Send>;

/// Ordered list of dynamically typed values.
#[derive(Default)]
pub struct Values(Vec<AnyValue>);

/// Build a [`Values`] list from expressions.
///
/// ```ignore
/// let args = plugwire::values![2i64, 3i64];
/// ```
#[macro_export]
macro_rules! values {
    () => { $crate::Values::new() };
    ($($value:expr),+ $(,)?) => {
        $crate::Values::from_vec(vec![$(Box::new($value) as $crate::AnyValue),+])
    };
}

impl Values {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_vec(values: Vec<AnyValue>) -> Self {
        Self(values)
    }

    pub fn push<T: Any + Send>(&mut self, value: T) {
        self.0.push(Box::new(value));
    }

    pub fn with<T: Any + Send>(mut self, value: T) -> Self {
        self.push(value);
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the value at `index` if it has type `T`.
    pub fn get<T: Any>(&self, index: usize) -> Option<&T> {
        self.0.get(index)?.downcast_ref::<T>()
    }

    /// Consume the list and take the value at `index` as `T`.
    pub fn take<T: Any>(mut self, index: usize) -> Option<T> {
        if index >= self.0.len() {
            return None;
        }
        self.0.swap_remove(index).downcast::<T>().ok().map(|b| *b)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AnyValue> {
        self.0.iter()
    }

    pub fn into_vec(self) -> Vec<AnyValue> {
        self.0
    }
}

impl From<Vec<AnyValue>> for Values {
    fn from(values: Vec<AnyValue>) -> Self {
        Self(values)
    }
}

impl IntoIterator for Values {
    type Item = AnyValue;
    type IntoIter = std::vec::IntoIter<AnyValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl fmt::Debug for Values {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Values").field("len", &self.0.len()).finish()
    }
}
