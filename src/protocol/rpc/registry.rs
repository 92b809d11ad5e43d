//! The program registry: explicit `program -> version -> procedure`
//! mapping lookups built by registration calls at server startup.
//!
//! The registry is read-only once serving begins; dispatch only ever reads
//! it, so sharing it across concurrent readers is safe.

use std::collections::{BTreeMap, HashMap};

use crate::protocol::rpc::CallContext;
use crate::protocol::xdr::rpc::call_body;
use crate::protocol::xdr::schema::{Descriptor, Value};

/// A registered procedure: how to decode its arguments, how to encode its
/// result, and the handler to run in between.
pub struct ProcedureEntry {
    pub(crate) args: Descriptor,
    pub(crate) ret: Descriptor,
    pub(crate) handler: Box<dyn Handler>,
}

impl ProcedureEntry {
    pub fn args(&self) -> &Descriptor {
        &self.args
    }

    pub fn ret(&self) -> &Descriptor {
        &self.ret
    }
}

/// A procedure handler receives the decoded call header and arguments and
/// returns a value constructible from the procedure's return descriptor.
/// Any error is reported to the peer as `SYSTEM_ERR`.
pub trait Handler: Send + Sync {
    fn handle(&self, context: &CallContext, call: &call_body, args: Value)
        -> anyhow::Result<Value>;
}

impl<F> Handler for F
where
    F: Fn(&CallContext, &call_body, Value) -> anyhow::Result<Value> + Send + Sync,
{
    fn handle(
        &self,
        context: &CallContext,
        call: &call_body,
        args: Value,
    ) -> anyhow::Result<Value> {
        self(context, call, args)
    }
}

/// Maps `(program, version, procedure)` triples to registered procedures.
///
/// Versions are kept ordered so the supported range reported by
/// `PROG_MISMATCH` can be read straight off the map at request time.
#[derive(Default)]
pub struct ProgramRegistry {
    programs: HashMap<u32, BTreeMap<u32, HashMap<u32, ProcedureEntry>>>,
}

impl ProgramRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a procedure handler. Registering the same triple twice
    /// replaces the earlier entry.
    pub fn register<H>(
        &mut self,
        program: u32,
        version: u32,
        procedure: u32,
        args: Descriptor,
        ret: Descriptor,
        handler: H,
    ) where
        H: Fn(&CallContext, &call_body, Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.programs
            .entry(program)
            .or_default()
            .entry(version)
            .or_default()
            .insert(procedure, ProcedureEntry { args, ret, handler: Box::new(handler) });
    }

    pub fn has_program(&self, program: u32) -> bool {
        self.programs.contains_key(&program)
    }

    pub fn has_version(&self, program: u32, version: u32) -> bool {
        self.programs
            .get(&program)
            .is_some_and(|versions| versions.contains_key(&version))
    }

    /// Minimum and maximum version ids registered for a program, computed
    /// from the registry at request time rather than cached.
    pub fn version_bounds(&self, program: u32) -> Option<(u32, u32)> {
        let versions = self.programs.get(&program)?;
        let low = versions.keys().next()?;
        let high = versions.keys().next_back()?;
        Some((*low, *high))
    }

    pub fn procedure(
        &self,
        program: u32,
        version: u32,
        procedure: u32,
    ) -> Option<&ProcedureEntry> {
        self.programs.get(&program)?.get(&version)?.get(&procedure)
    }
}
