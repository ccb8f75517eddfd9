//! Scripted backend and loader for unit tests.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::{
    config::ModelSource,
    model::{
        Argument, BackendLoader, Capability, CompileOutcome, NamedParams, ParamSchema,
        SkillDescriptor, VisionBackend, loader::LoadOptions,
    },
};

#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub capability: Capability,
    pub args: Vec<Argument>,
    pub params: NamedParams,
}

pub(crate) struct ScriptedBackend {
    pub skills: HashMap<Capability, ParamSchema>,
    pub results: HashMap<Capability, Value>,
    pub compile: Option<Result<CompileOutcome, String>>,
    pub delay: Option<Duration>,
    pub calls: Arc<AtomicUsize>,
    /// Highest number of calls seen running at the same time.
    pub peak_in_flight: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    pub recorded: Arc<Mutex<Vec<RecordedCall>>>,
}

impl ScriptedBackend {
    /// Every skill, open parameters, canned moondream-shaped results.
    pub fn moondream() -> Self {
        let skills = Capability::ALL
            .iter()
            .map(|&c| (c, ParamSchema::Open))
            .collect();
        let results = HashMap::from([
            (Capability::Caption, json!({"caption": "A dog lying on a couch."})),
            (Capability::Query, json!({"answer": "It looks relaxed."})),
            (
                Capability::Detect,
                json!({"objects": [{"x_min": 0.1, "y_min": 0.2, "x_max": 0.5, "y_max": 0.9}]}),
            ),
            (Capability::Point, json!({"points": [{"x": 0.3, "y": 0.55}]})),
        ]);
        Self {
            skills,
            results,
            compile: None,
            delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            recorded: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_result(mut self, capability: Capability, value: Value) -> Self {
        self.results.insert(capability, value);
        self
    }

    pub fn with_schema(mut self, capability: Capability, schema: ParamSchema) -> Self {
        self.skills.insert(capability, schema);
        self
    }

    pub fn without(mut self, capability: Capability) -> Self {
        self.skills.remove(&capability);
        self
    }
}

impl VisionBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn describe(&self, capability: Capability) -> Option<SkillDescriptor> {
        self.skills
            .get(&capability)
            .map(|params| SkillDescriptor {
                params: params.clone(),
            })
    }

    fn call(&self, capability: Capability, args: Vec<Argument>, params: NamedParams) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        self.recorded.lock().push(RecordedCall {
            capability,
            args,
            params,
        });
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.results
            .get(&capability)
            .cloned()
            .ok_or_else(|| anyhow!("no scripted result for {capability}"))
    }

    fn compile(&mut self) -> Result<CompileOutcome> {
        match self.compile.clone() {
            None => Ok(CompileOutcome::Unsupported),
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(msg)) => Err(anyhow!(msg)),
        }
    }
}

/// Hands out one prepared backend, or fails.
pub(crate) struct ScriptedLoader {
    backend: Mutex<Option<Result<ScriptedBackend, String>>>,
    gate: Option<Mutex<std::sync::mpsc::Receiver<()>>>,
    pub seen_options: Mutex<Option<LoadOptions>>,
}

impl ScriptedLoader {
    pub fn ok(backend: ScriptedBackend) -> Self {
        Self {
            backend: Mutex::new(Some(Ok(backend))),
            gate: None,
            seen_options: Mutex::new(None),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            backend: Mutex::new(Some(Err(message.to_string()))),
            gate: None,
            seen_options: Mutex::new(None),
        }
    }

    /// Blocks inside `load` until the returned sender fires.
    pub fn gated(backend: ScriptedBackend) -> (Self, std::sync::mpsc::Sender<()>) {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut loader = Self::ok(backend);
        loader.gate = Some(Mutex::new(rx));
        (loader, tx)
    }
}

impl BackendLoader for ScriptedLoader {
    fn load(&self, _source: &ModelSource, options: &LoadOptions) -> Result<Box<dyn VisionBackend>> {
        *self.seen_options.lock() = Some(*options);
        if let Some(gate) = self.gate.as_ref() {
            let _ = gate.lock().recv();
        }
        match self.backend.lock().take() {
            Some(Ok(backend)) => Ok(Box::new(backend)),
            Some(Err(msg)) => Err(anyhow!(msg)),
            None => Err(anyhow!("backend already handed out")),
        }
    }
}
