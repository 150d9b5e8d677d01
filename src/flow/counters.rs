//! Named per-flow counters
//!
//! Counters are registered once by name and addressed afterwards by the
//! returned handle. Values live in the flows themselves, one block per
//! direction, and only counters that were actually touched end up in a
//! report.

use parking_lot::RwLock;

use super::table::FlowRef;
use crate::error::{Error, Result};

/// Value type of a counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    Int,
    Uint,
    Float,
}

/// Registered counter names, indexed by handle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterNames {
    pub ints: Vec<String>,
    pub uints: Vec<String>,
    pub floats: Vec<String>,
}

impl CounterNames {
    fn list(&self, kind: CounterKind) -> &Vec<String> {
        match kind {
            CounterKind::Int => &self.ints,
            CounterKind::Uint => &self.uints,
            CounterKind::Float => &self.floats,
        }
    }

    fn list_mut(&mut self, kind: CounterKind) -> &mut Vec<String> {
        match kind {
            CounterKind::Int => &mut self.ints,
            CounterKind::Uint => &mut self.uints,
            CounterKind::Float => &mut self.floats,
        }
    }
}

/// Signed counter handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntCounter(usize);

/// Unsigned counter handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UintCounter(usize);

/// Floating point counter handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FloatCounter(usize);

/// Counter name registry shared by all flows
#[derive(Debug, Default)]
pub struct CounterRegistry {
    names: RwLock<CounterNames>,
}

impl CounterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_int(&self, name: &str) -> Result<IntCounter> {
        self.register(CounterKind::Int, name).map(IntCounter)
    }

    pub fn new_uint(&self, name: &str) -> Result<UintCounter> {
        self.register(CounterKind::Uint, name).map(UintCounter)
    }

    pub fn new_float(&self, name: &str) -> Result<FloatCounter> {
        self.register(CounterKind::Float, name).map(FloatCounter)
    }

    /// Handle for `name`, registering it on first use. Lets several
    /// decoders share the same counter.
    pub fn uint(&self, name: &str) -> UintCounter {
        UintCounter(self.get_or_register(CounterKind::Uint, name))
    }

    pub fn int(&self, name: &str) -> IntCounter {
        IntCounter(self.get_or_register(CounterKind::Int, name))
    }

    pub fn float(&self, name: &str) -> FloatCounter {
        FloatCounter(self.get_or_register(CounterKind::Float, name))
    }

    /// Copy of all registered names
    pub fn snapshot(&self) -> CounterNames {
        self.names.read().clone()
    }

    pub(crate) fn sizes(&self) -> (usize, usize, usize) {
        let names = self.names.read();
        (names.ints.len(), names.uints.len(), names.floats.len())
    }

    fn register(&self, kind: CounterKind, name: &str) -> Result<usize> {
        let mut names = self.names.write();
        let list = names.list_mut(kind);
        if list.iter().any(|n| n == name) {
            return Err(Error::DuplicateCounter(name.to_string()));
        }
        list.push(name.to_string());
        Ok(list.len() - 1)
    }

    fn get_or_register(&self, kind: CounterKind, name: &str) -> usize {
        if let Some(idx) = self.names.read().list(kind).iter().position(|n| n == name) {
            return idx;
        }
        let mut names = self.names.write();
        let list = names.list_mut(kind);
        match list.iter().position(|n| n == name) {
            Some(idx) => idx,
            None => {
                list.push(name.to_string());
                list.len() - 1
            }
        }
    }
}

/// Counter values for one direction of a flow
///
/// `None` marks a counter that was never written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowStats {
    pub ints: Vec<Option<i64>>,
    pub uints: Vec<Option<u64>>,
    pub floats: Vec<Option<f64>>,
}

impl FlowStats {
    pub fn with_sizes((ints, uints, floats): (usize, usize, usize)) -> Self {
        Self {
            ints: vec![None; ints],
            uints: vec![None; uints],
            floats: vec![None; floats],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ints.iter().all(Option::is_none)
            && self.uints.iter().all(Option::is_none)
            && self.floats.iter().all(Option::is_none)
    }

    /// Non-empty values paired with their names
    pub fn named_values<'a>(
        &'a self,
        names: &'a CounterNames,
    ) -> impl Iterator<Item = (&'a str, serde_json::Value)> + 'a {
        let ints = names
            .ints
            .iter()
            .zip(&self.ints)
            .filter_map(|(n, v)| v.map(|v| (n.as_str(), serde_json::Value::from(v))));
        let uints = names
            .uints
            .iter()
            .zip(&self.uints)
            .filter_map(|(n, v)| v.map(|v| (n.as_str(), serde_json::Value::from(v))));
        let floats = names
            .floats
            .iter()
            .zip(&self.floats)
            .filter_map(|(n, v)| v.map(|v| (n.as_str(), serde_json::Value::from(v))));
        ints.chain(uints).chain(floats)
    }
}

// Counters registered after a flow was created are appended lazily.
fn slot<T: Clone>(values: &mut Vec<Option<T>>, idx: usize) -> &mut Option<T> {
    if values.len() <= idx {
        values.resize(idx + 1, None);
    }
    &mut values[idx]
}

impl IntCounter {
    pub fn add(&self, flow: &mut FlowRef<'_>, delta: i64) {
        let v = slot(&mut flow.stats_mut().ints, self.0);
        *v = Some(v.unwrap_or(0).wrapping_add(delta));
    }

    pub fn set(&self, flow: &mut FlowRef<'_>, value: i64) {
        *slot(&mut flow.stats_mut().ints, self.0) = Some(value);
    }
}

impl UintCounter {
    pub fn add(&self, flow: &mut FlowRef<'_>, delta: u64) {
        let v = slot(&mut flow.stats_mut().uints, self.0);
        *v = Some(v.unwrap_or(0).wrapping_add(delta));
    }

    pub fn set(&self, flow: &mut FlowRef<'_>, value: u64) {
        *slot(&mut flow.stats_mut().uints, self.0) = Some(value);
    }
}

impl FloatCounter {
    pub fn add(&self, flow: &mut FlowRef<'_>, delta: f64) {
        let v = slot(&mut flow.stats_mut().floats, self.0);
        *v = Some(v.unwrap_or(0.0) + delta);
    }

    pub fn set(&self, flow: &mut FlowRef<'_>, value: f64) {
        *slot(&mut flow.stats_mut().floats, self.0) = Some(value);
    }
}
