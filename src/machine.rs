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
//! Driving a dataflow in batches
//!
//! A [`Machine`](struct.Machine.html) owns a single-threaded timely worker with one dataflow
//! in it. Records go in through its [`Inputs`](trait.Inputs.html); each call to
//! [`drain_deltas`](struct.Machine.html#method.drain_deltas) closes the current batch, runs
//! the worker until the batch has passed the output and returns the consolidated changes.
use anyhow::Result;
use differential_dataflow::ExchangeData;
use timely::{communication::allocator::thread::Thread, worker::Worker};

use crate::{
    deltas::Deltas,
    flow::{Flow, Input, NeedsState, Output, Probe, Scope},
    model::ProductionRecord,
};
use std::marker::PhantomData;

/// A dataflow together with the worker running it
///
/// The logical time counts the batches drained so far.
pub struct Machine<In: Inputs, Out: ExchangeData, St: NeedsState> {
    inputs: In,
    output: Output<Out>,
    probe: Probe,
    worker: Worker<Thread>,
    batch: usize,
    ph: PhantomData<St>,
}

/// What a machine is fed through
pub trait Inputs {
    type Elem;

    /// close the running batch, later elements belong to batch `time`
    fn advance_clock(&mut self, time: usize);
    /// Hand one element to the dataflow, failing if it cannot be accepted
    fn feed(&mut self, input: &Self::Elem) -> Result<()>;
}

/// Production records are validated on the way in
impl Inputs for Input<ProductionRecord> {
    type Elem = ProductionRecord;
    fn advance_clock(&mut self, time: usize) {
        self.advance_to(time);
        self.flush();
    }
    fn feed(&mut self, input: &ProductionRecord) -> Result<()> {
        input.validate()?;
        self.insert(input.clone());
        Ok(())
    }
}

impl<In: Inputs, Out: ExchangeData, St: NeedsState> Machine<In, Out, St> {
    /// Build the dataflow with `logic`
    ///
    /// The scope only lives while `logic` runs, so the flow can only be returned, not kept.
    pub fn new<F>(logic: F) -> Self
    where
        F: for<'a> FnOnce(&mut Scope<'a>) -> (In, Flow<'a, Out, St>),
    {
        let mut worker = Worker::new(Thread::new());
        let (inputs, output, probe) = worker.dataflow(|scope| {
            let (inputs, flow) = logic(scope);
            (inputs, flow.output(), flow.probe())
        });
        Self {
            inputs,
            output,
            probe,
            worker,
            batch: 0,
            ph: PhantomData,
        }
    }

    /// Whether the output depends on earlier records, see [`NeedsState`](../flow/trait.NeedsState.html)
    pub fn needs_state(&self) -> bool {
        St::NEEDS_STATE
    }

    pub fn inputs(&mut self) -> &mut In {
        &mut self.inputs
    }

    /// Changes of the output caused by everything fed since the previous call
    pub fn drain_deltas(&mut self) -> Deltas<Out> {
        self.batch += 1;
        let batch = self.batch;
        self.inputs.advance_clock(batch);
        let probe = &self.probe;
        self.worker.step_while(|| probe.less_than(batch));
        let mut deltas = Deltas::new();
        for change in self.output.msgs() {
            deltas += change;
        }
        deltas
    }

    #[cfg(test)]
    pub fn assert(&mut self, input: &[In::Elem], output: &[(Out, isize)]) {
        for i in input {
            self.inputs().feed(i).unwrap();
        }
        assert_eq!(self.drain_deltas().to_vec(), output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{tests::record, Shift};

    #[test]
    fn must_reject_invalid_records() {
        let mut machine = Machine::new(|scope| {
            let (input, records) = Flow::<ProductionRecord, _>::new(scope);
            (input, records.map(|r| r.good_units))
        });
        let bad = record("Mixer", Shift::Night, (2025, 7, 1), 480.0, 500.0, 0.1, 10, 10);
        let err = machine.inputs().feed(&bad).unwrap_err();
        assert!(err.to_string().contains("downtime"));

        let good = record("Mixer", Shift::Night, (2025, 7, 1), 480.0, 50.0, 0.1, 10, 9);
        machine.assert(&[good.clone(), good], &[(9, 2)]);
        assert!(machine.drain_deltas().is_empty());
    }
}
