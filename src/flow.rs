/*
 * Copyright 2020 Actyx AG
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */
//! Typed collections for the incremental OEE computations
//!
//! Timely and differential dataflow are generic over timestamps, multiplicities and scope
//! nesting. The computations in this crate need none of that freedom: time is a `usize`
//! batch counter, multiplicities are `isize` and everything runs in a single-threaded worker.
//! Fixing those parameters leaves one type parameter per collection.
//!
//! ```rust
//! use oee_data_flow::flow::{Scope, Flow, Input, Stateless};
//! use oee_data_flow::model::ProductionRecord;
//!
//! fn units<'a>(scope: &mut Scope<'a>) -> (Input<ProductionRecord>, Flow<'a, i64, Stateless>) {
//!     let (input, records) = Flow::new(scope);
//!     let out = records.map(|r: ProductionRecord| r.total_units);
//!     (input, out)
//! }
//! ```
//!
//! A flow's second type parameter records whether it went through a grouping. Grouped
//! results depend on all earlier records, so after a restart such a flow must be fed the
//! already exported records again before new ones.
use differential_dataflow::{
    collection::{AsCollection, Collection},
    input::{Input as _, InputSession},
    operators::{
        arrange::{
            agent::TraceAgent,
            arrangement::{ArrangeByKey, Arranged},
        },
        reduce::ReduceCore,
    },
    trace::implementations::{ord::OrdValBatch, spine_fueled_neu::Spine},
    ExchangeData, Hashable,
};
use std::{marker::PhantomData, rc::Rc, sync::mpsc::Receiver};
use timely::{
    communication::allocator::Thread,
    dataflow::{
        operators::{capture::Event, probe::Handle, Capture},
        scopes::Child,
    },
    worker::Worker,
};

/// Scope handed to the logic functions by [`Machine::new`](../machine/struct.Machine.html#method.new)
pub type Scope<'a> = Child<'a, Worker<Thread>, usize>;

type Batch<K, V> = Rc<OrdValBatch<K, V, usize, isize>>;
type Trace<K, V> = TraceAgent<Spine<K, V, usize, isize, Batch<K, V>>>;

/// Feeds one [`Flow`](struct.Flow.html)
pub struct Input<T: ExchangeData>(InputSession<usize, T, isize>);

impl<T: ExchangeData> Input<T> {
    /// Close the current batch; later inserts belong to `time`
    pub fn advance_to(&mut self, time: usize) {
        self.0.advance_to(time)
    }
    pub fn flush(&mut self) {
        self.0.flush()
    }
    pub fn insert(&mut self, value: T) {
        self.0.insert(value)
    }
    /// Retract a value inserted earlier, e.g. a record that was booked twice
    pub fn remove(&mut self, value: T) {
        self.0.remove(value)
    }
}

/// Captured changes of a flow
pub struct Output<T: ExchangeData>(Receiver<Event<usize, (T, usize, isize)>>);

impl<T: ExchangeData> Output<T> {
    /// Changes captured so far, without their timestamps; progress events are skipped
    pub fn msgs<'a>(&'a mut self) -> impl Iterator<Item = (T, isize)> + 'a {
        self.0
            .try_iter()
            .filter_map(|event| match event {
                Event::Messages(_, msgs) => Some(msgs),
                Event::Progress(_) => None,
            })
            .flatten()
            .map(|(msg, _time, mult)| (msg, mult))
    }
}

pub struct Probe(Handle<usize>);

impl Probe {
    /// true while results for `time` may still arrive
    pub fn less_than(&self, time: usize) -> bool {
        self.0.less_than(&time)
    }
}

/// Whether a flow's results depend on earlier inputs
pub trait NeedsState {
    const NEEDS_STATE: bool;
}

/// Flows built from per-record operations only
pub struct Stateless {}
impl NeedsState for Stateless {
    const NEEDS_STATE: bool = false;
}

/// Flows that passed through a grouping
pub struct Stateful {}
impl NeedsState for Stateful {
    const NEEDS_STATE: bool = true;
}

/// A differential collection of `T` in the worker's top-level scope
pub struct Flow<'a, T: ExchangeData, St: NeedsState>(Collection<Scope<'a>, T, isize>, PhantomData<St>);

impl<'a, T: ExchangeData> Flow<'a, T, Stateless> {
    pub fn new(scope: &mut Scope<'a>) -> (Input<T>, Flow<'a, T, Stateless>) {
        let (input, collection) = scope.new_collection();
        (Input(input), Flow(collection, PhantomData))
    }
}

impl<'a, T: ExchangeData, St: NeedsState> Flow<'a, T, St> {
    pub fn filter(&self, f: impl Fn(&T) -> bool + 'static) -> Self {
        Self(self.0.filter(f), PhantomData)
    }

    pub fn map<U: ExchangeData>(&self, f: impl Fn(T) -> U + 'static) -> Flow<'a, U, St> {
        Flow(self.0.map(f), PhantomData)
    }

    /// Index the elements by `key` so that each group can be [`reduce`](struct.Grouped.html#method.reduce)d
    pub fn group_by<K: ExchangeData + Hashable>(
        &self,
        mut key: impl FnMut(&T) -> K + 'static,
    ) -> Grouped<'a, K, T> {
        let keyed = self.0.map(move |elem| (key(&elem), elem));
        Grouped(keyed.arrange_by_key(), PhantomData)
    }

    pub fn probe(&self) -> Probe {
        Probe(self.0.probe())
    }

    /// Capture the changes of this flow, as used by [`Machine`](../machine/struct.Machine.html)
    pub fn output(&self) -> Output<T> {
        Output(self.0.inner.capture())
    }
}

impl<'a, T: ExchangeData> Flow<'a, T, Stateful> {
    /// Both flows' elements in one flow
    pub fn concat<St: NeedsState>(&self, other: &Flow<'a, T, St>) -> Flow<'a, T, Stateful> {
        Flow(self.0.concat(&other.0), PhantomData)
    }
}

/// Elements of a flow indexed by key, kept in memory
pub struct Grouped<'a, K, V>(Arranged<Scope<'a>, Trace<K, V>>, PhantomData<(K, V)>)
where
    K: ExchangeData + Hashable,
    V: ExchangeData;

impl<'a, K, V> Grouped<'a, K, V>
where
    K: ExchangeData + Hashable,
    V: ExchangeData,
{
    /// Recompute the values of every key whose inputs changed
    ///
    /// `f` sees the key's current values in sorted order, each with its multiplicity, and
    /// pushes the new output values (normally with multiplicity 1). Differences to the
    /// previous outputs leave the flow as deltas.
    pub fn reduce<V2, L>(&self, f: L) -> Grouped<'a, K, V2>
    where
        V2: ExchangeData,
        L: FnMut(&K, &[(&V, isize)], &mut Vec<(V2, isize)>) + 'static,
    {
        Grouped(self.0.reduce_abelian("Reduce", f), PhantomData)
    }

    /// Values without their keys
    pub fn ungroup(&self) -> Flow<'a, V, Stateful> {
        self.ungroup_with(|_, v| v.clone())
    }

    pub fn ungroup_with<T: ExchangeData>(
        &self,
        f: impl FnMut(&K, &V) -> T + 'static,
    ) -> Flow<'a, T, Stateful> {
        Flow(self.0.as_collection(f), PhantomData)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{Inputs, Machine};
    use anyhow::Result;

    impl Inputs for Input<(String, i64)> {
        type Elem = (String, i64);
        fn advance_clock(&mut self, time: usize) {
            self.advance_to(time);
            self.flush();
        }
        fn feed(&mut self, input: &Self::Elem) -> Result<()> {
            self.insert(input.clone());
            Ok(())
        }
    }

    fn s(s: &str) -> String {
        s.to_owned()
    }

    #[test]
    fn grouped_sum_must_emit_deltas() {
        let mut machine = Machine::new(|scope| {
            let (handle, coll) = Flow::<(String, i64), _>::new(scope);
            let out = coll
                .filter(|(_, units)| *units > 0)
                .group_by(|(machine, _)| machine.clone())
                .reduce(|_, inputs, outputs| {
                    let sum = inputs
                        .iter()
                        .map(|((_, units), mult)| *units * *mult as i64)
                        .sum::<i64>();
                    outputs.push((sum, 1));
                })
                .ungroup_with(|machine, sum| (machine.clone(), *sum));
            (handle, out)
        });
        machine.assert(&[(s("Mixer"), 10)], &[((s("Mixer"), 10), 1)]);
        machine.assert(&[(s("Packer"), 0)], &[]);
        machine.assert(
            &[(s("Mixer"), 5), (s("Filler"), 7)],
            &[((s("Filler"), 7), 1), ((s("Mixer"), 10), -1), ((s("Mixer"), 15), 1)],
        );
        // the same value twice counts twice
        machine.assert(
            &[(s("Filler"), 7)],
            &[((s("Filler"), 7), -1), ((s("Filler"), 14), 1)],
        );
    }

    #[test]
    fn removal_must_retract() {
        let mut machine = Machine::new(|scope| {
            let (handle, coll) = Flow::<(String, i64), _>::new(scope);
            (handle, coll.map(|(machine, _)| machine))
        });
        machine.assert(&[(s("Mixer"), 3), (s("Mixer"), 4)], &[(s("Mixer"), 2)]);
        machine.inputs().remove((s("Mixer"), 3));
        assert_eq!(machine.drain_deltas().into_vec(), vec![(s("Mixer"), -1)]);
        machine.inputs().remove((s("Mixer"), 4));
        machine.inputs().insert((s("Filler"), 1));
        assert_eq!(
            machine.drain_deltas().into_vec(),
            vec![(s("Filler"), 1), (s("Mixer"), -1)]
        );
    }

    #[test]
    fn stateless_flow_must_not_need_state() {
        let machine = Machine::new(|scope| {
            let (handle, coll) = Flow::<(String, i64), _>::new(scope);
            (handle, coll.map(|(_, units)| units))
        });
        assert!(!machine.needs_state());
    }
}
