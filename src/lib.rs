pub mod config;
pub mod device;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod server;

pub use config::{AppConfig, ModelSource};
pub use device::{DeviceProfile, select_device};
pub use error::ServiceError;
pub use model::{BackendLoader, Capability, ModelRegistry, VisionBackend};
pub use server::build_router;
