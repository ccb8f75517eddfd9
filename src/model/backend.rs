use std::collections::BTreeSet;

use anyhow::Result;
use serde_json::Value;

use crate::{
    config::ModelSource,
    model::{Argument, Capability, NamedParams, loader::LoadOptions},
};

/// Named parameters a skill accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamSchema {
    /// Exactly these names; everything else is dropped before the call.
    Declared(BTreeSet<String>),
    /// Any named parameter is accepted.
    Open,
    /// The backend cannot describe the skill's parameters.
    Unknown,
}

impl ParamSchema {
    pub fn declared<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ParamSchema::Declared(names.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillDescriptor {
    pub params: ParamSchema,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileOutcome {
    Compiled,
    /// The backend has no compile pass.
    Unsupported,
}

/// A loaded inference engine. Implementations are shared across request
/// tasks and called from the blocking pool.
pub trait VisionBackend: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// `None` when the backend does not expose the skill.
    fn describe(&self, capability: Capability) -> Option<SkillDescriptor>;

    fn call(&self, capability: Capability, args: Vec<Argument>, params: NamedParams)
    -> Result<Value>;

    /// Optional ahead-of-time optimisation run once after load.
    fn compile(&mut self) -> Result<CompileOutcome> {
        Ok(CompileOutcome::Unsupported)
    }
}

pub trait BackendLoader: Send + Sync + 'static {
    fn load(&self, source: &ModelSource, options: &LoadOptions) -> Result<Box<dyn VisionBackend>>;
}
