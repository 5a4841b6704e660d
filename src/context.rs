// src/context.rs
//
// Everything a rank needs to run a phase, passed explicitly
//
// One `RunContext` exists per rank. It borrows the communicator, the backend
// chosen at configuration time, and the shared clock; there are no globals.

use crate::backend::Backend;
use crate::comm::Communicator;
use crate::timebase::Timebase;

pub struct RunContext<'a, C: Communicator, B: Backend> {
    pub comm: &'a C,
    pub backend: &'a B,
    pub timebase: &'a Timebase,
}

impl<'a, C: Communicator, B: Backend> RunContext<'a, C, B> {
    pub fn new(comm: &'a C, backend: &'a B, timebase: &'a Timebase) -> Self {
        Self {
            comm,
            backend,
            timebase,
        }
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn size(&self) -> usize {
        self.comm.size()
    }

    pub fn is_root(&self) -> bool {
        self.comm.rank() == 0
    }

    /// Same backend and clock over a sub-group communicator
    pub fn with_comm<'b>(&self, comm: &'b C) -> RunContext<'b, C, B>
    where
        'a: 'b,
    {
        RunContext {
            comm,
            backend: self.backend,
            timebase: self.timebase,
        }
    }

    /// Seconds on the shared timebase
    pub fn now(&self) -> f64 {
        self.timebase.now()
    }
}
