//! Per-session merge callbacks
//!
//! A [`Functions`] object is handed to [`Store::new_session`] and decides how
//! read-modify-write operations combine an input with the current value.
//!
//! [`Store::new_session`]: crate::Store::new_session

use hybridkv_common::SessionId;
use std::marker::PhantomData;

/// Read-modify-write callbacks
pub trait Functions<V>: Send {
    /// RMW input type
    type Input: Clone + Send + 'static;

    /// Value stored when RMW finds no existing value
    fn initial_value(&self, input: &Self::Input) -> V;

    /// Combine the current value with `input`
    ///
    /// Returning `None` keeps the current value and writes nothing.
    fn merge(&self, current: &V, input: &Self::Input) -> Option<V>;

    /// A computed value lost its index CAS and will be recomputed
    fn dispose(&self, _value: V) {}

    /// A checkpoint covering this session's operations up to `serial` is
    /// durable
    fn checkpoint_completed(&self, _session: SessionId, _serial: u64) {}
}

/// Merge with a closure; the input doubles as the initial value
pub struct SimpleFunctions<V, F> {
    merge: F,
    _value: PhantomData<fn() -> V>,
}

impl<V, F> SimpleFunctions<V, F>
where
    F: Fn(&V, &V) -> V + Send,
{
    pub fn new(merge: F) -> Self {
        Self {
            merge,
            _value: PhantomData,
        }
    }
}

impl<V, F> Functions<V> for SimpleFunctions<V, F>
where
    V: Clone + Send + 'static,
    F: Fn(&V, &V) -> V + Send,
{
    type Input = V;

    fn initial_value(&self, input: &V) -> V {
        input.clone()
    }

    fn merge(&self, current: &V, input: &V) -> Option<V> {
        Some((self.merge)(current, input))
    }
}

/// Sum merge for numeric values
pub fn sum_functions<V>() -> SimpleFunctions<V, fn(&V, &V) -> V>
where
    V: Clone + Send + 'static + std::ops::Add<Output = V>,
{
    SimpleFunctions::new(|a: &V, b: &V| a.clone() + b.clone())
}

/// First writer wins: RMW inserts when absent and never overwrites
pub struct TryAddFunctions<V> {
    _value: PhantomData<fn() -> V>,
}

impl<V> TryAddFunctions<V> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _value: PhantomData,
        }
    }
}

impl<V> Default for TryAddFunctions<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Functions<V> for TryAddFunctions<V>
where
    V: Clone + Send + 'static,
{
    type Input = V;

    fn initial_value(&self, input: &V) -> V {
        input.clone()
    }

    fn merge(&self, _current: &V, _input: &V) -> Option<V> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_functions() {
        let f = sum_functions::<u64>();
        assert_eq!(f.initial_value(&25), 25);
        assert_eq!(f.merge(&25, &27), Some(52));
    }

    #[test]
    fn test_try_add_keeps_existing() {
        let f = TryAddFunctions::<String>::new();
        assert_eq!(f.initial_value(&"first".to_string()), "first");
        assert_eq!(f.merge(&"first".to_string(), &"second".to_string()), None);
    }

    #[test]
    fn test_closure_merge() {
        let f = SimpleFunctions::new(|a: &Vec<u8>, b: &Vec<u8>| [a.as_slice(), b.as_slice()].concat());
        assert_eq!(f.merge(&vec![1], &vec![2, 3]), Some(vec![1, 2, 3]));
    }
}
