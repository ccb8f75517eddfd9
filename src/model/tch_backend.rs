//! TorchScript skill module served through libtorch.
//!
//! The model repository ships a `skills.json` manifest next to a TorchScript
//! export that has one method per skill:
//!
//! ```json
//! {
//!   "module": "moondream.ts",
//!   "skills": {
//!     "caption": { "params": ["length", "stream", "reasoning"] },
//!     "query":   { "accepts_extra": true },
//!     "detect":  {}
//!   }
//! }
//! ```
//!
//! A skill without `params` has an unknown schema and receives every named
//! parameter. Methods take the image as a `u8` tensor of shape `[H, W, 3]`,
//! then any text arguments, then a dict of named parameters, and return either
//! a JSON string or a dict.

use std::{collections::HashMap, fs};

use anyhow::{Context, Result, anyhow, bail};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Map, Number, Value};
use tch::{CModule, Device, IValue, Kind, Tensor, no_grad};
use tracing::{info, warn};

use crate::{
    config::ModelSource,
    device::{DeviceKind, Precision},
    model::{
        Argument, BackendLoader, Capability, CompileOutcome, NamedParams, ParamSchema,
        SkillDescriptor, VisionBackend, loader::{LoadOptions, resolve_artifact},
    },
};

pub const MANIFEST_FILE: &str = "skills.json";

#[derive(Debug, Deserialize)]
struct SkillManifest {
    module: String,
    #[serde(default)]
    skills: HashMap<String, SkillEntry>,
}

#[derive(Debug, Deserialize)]
struct SkillEntry {
    params: Option<Vec<String>>,
    #[serde(default)]
    accepts_extra: bool,
}

impl SkillEntry {
    fn schema(&self) -> ParamSchema {
        if self.accepts_extra {
            return ParamSchema::Open;
        }
        match self.params.as_ref() {
            Some(names) => ParamSchema::declared(names.iter().cloned()),
            None => ParamSchema::Unknown,
        }
    }
}

fn parse_manifest(raw: &str) -> Result<(String, HashMap<Capability, ParamSchema>)> {
    let manifest: SkillManifest = serde_json::from_str(raw).context("invalid skills manifest")?;

    let mut skills = HashMap::new();
    for (name, entry) in &manifest.skills {
        match Capability::ALL.iter().find(|c| c.as_str() == name) {
            Some(&capability) => {
                skills.insert(capability, entry.schema());
            }
            None => warn!(skill = %name, "ignoring unknown skill in manifest"),
        }
    }
    Ok((manifest.module, skills))
}

pub struct TorchScriptLoader;

impl BackendLoader for TorchScriptLoader {
    fn load(&self, source: &ModelSource, options: &LoadOptions) -> Result<Box<dyn VisionBackend>> {
        let manifest_path = resolve_artifact(source, MANIFEST_FILE)?;
        let raw = fs::read_to_string(&manifest_path)
            .with_context(|| format!("failed to read {}", manifest_path.display()))?;
        let (module_file, skills) = parse_manifest(&raw)?;
        let module_path = resolve_artifact(source, &module_file)?;

        let device = torch_device(options);

        let mut module = CModule::load_on_device(&module_path, device)
            .with_context(|| format!("failed to load {}", module_path.display()))?;
        module.set_eval();
        if options.precision == Precision::Full {
            module
                .f_to(device, Kind::Float, false)
                .context("failed to convert module to f32")?;
        }

        info!(
            module = %module_path.display(),
            ?device,
            skills = skills.len(),
            "torchscript module loaded"
        );

        Ok(Box::new(TorchScriptBackend {
            skills,
            device,
            module: Mutex::new(module),
        }))
    }
}

/// Pinned placement wins; CPU loads carry no placement and fall back to the
/// selected device.
fn torch_device(options: &LoadOptions) -> Device {
    match options.placement.unwrap_or(options.device) {
        DeviceKind::Cuda => Device::Cuda(0),
        DeviceKind::Mps => Device::Mps,
        DeviceKind::Cpu => Device::Cpu,
    }
}

pub struct TorchScriptBackend {
    skills: HashMap<Capability, ParamSchema>,
    device: Device,
    module: Mutex<CModule>,
}

impl VisionBackend for TorchScriptBackend {
    fn name(&self) -> &str {
        "torchscript"
    }

    fn describe(&self, capability: Capability) -> Option<SkillDescriptor> {
        self.skills.get(&capability).map(|params| SkillDescriptor {
            params: params.clone(),
        })
    }

    fn call(&self, capability: Capability, args: Vec<Argument>, params: NamedParams) -> Result<Value> {
        let mut inputs = Vec::with_capacity(args.len() + 1);
        for arg in args {
            inputs.push(match arg {
                Argument::Image(image) => {
                    let rgb = image.to_rgb8();
                    let (width, height) = rgb.dimensions();
                    let tensor = Tensor::from_slice(rgb.as_raw())
                        .reshape([height as i64, width as i64, 3])
                        .to(self.device);
                    IValue::Tensor(tensor)
                }
                Argument::Text(text) => IValue::String(text),
            });
        }
        inputs.push(json_to_ivalue(Value::Object(params)));

        let output = no_grad(|| {
            let module = self.module.lock();
            module.method_is(capability.as_str(), inputs.as_slice())
        })
        .with_context(|| format!("{capability} failed"))?;

        output_to_json(output)
    }

    fn compile(&mut self) -> Result<CompileOutcome> {
        let module = self.module.get_mut();
        module
            .method_is::<IValue>("compile", &[])
            .context("module has no usable compile method")?;
        Ok(CompileOutcome::Compiled)
    }
}

fn json_to_ivalue(value: Value) -> IValue {
    match value {
        Value::Null => IValue::None,
        Value::Bool(b) => IValue::Bool(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => IValue::Int(i),
            None => IValue::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => IValue::String(s),
        Value::Array(items) => IValue::GenericList(items.into_iter().map(json_to_ivalue).collect()),
        Value::Object(map) => IValue::GenericDict(
            map.into_iter()
                .map(|(k, v)| (IValue::String(k), json_to_ivalue(v)))
                .collect(),
        ),
    }
}

/// A skill may hand back its whole result pre-serialised as a JSON object.
/// Strings anywhere else are text and stay strings.
fn output_to_json(output: IValue) -> Result<Value> {
    match output {
        IValue::String(s) => match serde_json::from_str::<Map<String, Value>>(&s) {
            Ok(map) => Ok(Value::Object(map)),
            Err(_) => Ok(Value::String(s)),
        },
        other => ivalue_to_json(other),
    }
}

fn ivalue_to_json(value: IValue) -> Result<Value> {
    Ok(match value {
        IValue::None => Value::Null,
        IValue::Bool(b) => Value::Bool(b),
        IValue::Int(i) => Value::from(i),
        IValue::Double(d) => Number::from_f64(d)
            .map(Value::Number)
            .ok_or_else(|| anyhow!("non-finite float in model output"))?,
        IValue::String(s) => Value::String(s),
        IValue::StringList(items) => Value::from(items),
        IValue::IntList(items) => Value::from(items),
        IValue::DoubleList(items) => Value::from(items),
        IValue::BoolList(items) => Value::from(items),
        IValue::Tuple(items) | IValue::GenericList(items) => Value::Array(
            items
                .into_iter()
                .map(ivalue_to_json)
                .collect::<Result<Vec<_>>>()?,
        ),
        IValue::GenericDict(entries) => {
            let mut map = Map::new();
            for (key, value) in entries {
                let IValue::String(key) = key else {
                    bail!("model output dict has a non-string key");
                };
                map.insert(key, ivalue_to_json(value)?);
            }
            Value::Object(map)
        }
        other => bail!("unsupported model output: {other:?}"),
    })
}
