mod backend;
pub mod invoker;
pub mod loader;
mod registry;
mod types;

#[cfg(feature = "tch-backend")]
pub mod tch_backend;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{BackendLoader, CompileOutcome, ParamSchema, SkillDescriptor, VisionBackend};
pub use loader::LoadOptions;
pub use registry::{LifecycleState, ModelRegistry};
pub use types::{
    Argument, CaptionResponse, Capability, DetectResponse, InvocationRequest, NamedParams,
    PointResponse, QueryResponse, RasterImage,
};
