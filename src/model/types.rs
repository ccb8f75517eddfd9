use std::{fmt, sync::Arc};

use image::{DynamicImage, RgbImage};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ServiceError;

pub type NamedParams = Map<String, Value>;

/// Skills a vision backend can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Caption,
    Query,
    Detect,
    Point,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::Caption,
        Capability::Query,
        Capability::Detect,
        Capability::Point,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Caption => "caption",
            Capability::Query => "query",
            Capability::Detect => "detect",
            Capability::Point => "point",
        }
    }

    /// Key holding the payload in the backend's result.
    pub fn result_key(self) -> &'static str {
        match self {
            Capability::Caption => "caption",
            Capability::Query => "answer",
            Capability::Detect => "objects",
            Capability::Point => "points",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pixel data that is known to have decoded successfully. There is no other
/// way to build one.
#[derive(Debug, Clone)]
pub struct RasterImage {
    inner: DynamicImage,
}

impl RasterImage {
    pub fn decode(bytes: &[u8]) -> Result<Self, ServiceError> {
        if bytes.is_empty() {
            return Err(ServiceError::InvalidImage("empty upload".into()));
        }
        let inner =
            image::load_from_memory(bytes).map_err(|e| ServiceError::InvalidImage(e.to_string()))?;
        Ok(Self { inner })
    }

    pub fn width(&self) -> u32 {
        self.inner.width()
    }

    pub fn height(&self) -> u32 {
        self.inner.height()
    }

    pub fn to_rgb8(&self) -> RgbImage {
        self.inner.to_rgb8()
    }
}

#[derive(Debug, Clone)]
pub enum Argument {
    Image(Arc<RasterImage>),
    Text(String),
}

/// One call into the backend: the skill, its positional arguments in order,
/// and the caller's named parameters before adaptation.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub capability: Capability,
    pub args: Vec<Argument>,
    pub params: NamedParams,
}

impl InvocationRequest {
    pub fn new(capability: Capability) -> Self {
        Self {
            capability,
            args: Vec::new(),
            params: NamedParams::new(),
        }
    }

    pub fn image(mut self, image: Arc<RasterImage>) -> Self {
        self.args.push(Argument::Image(image));
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.args.push(Argument::Text(text.into()));
        self
    }

    pub fn param(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptionResponse {
    pub caption: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryResponse {
    pub answer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectResponse {
    pub objects: Vec<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PointResponse {
    pub points: Vec<Map<String, Value>>,
}
