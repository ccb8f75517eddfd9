use serde_json::Value;

use crate::{
    error::ServiceError,
    model::{InvocationRequest, NamedParams, ParamSchema, VisionBackend},
};

/// Run one skill on a loaded backend. Named parameters are adapted to what the
/// skill declares so one call site works across backends with different
/// signatures.
pub fn invoke(backend: &dyn VisionBackend, request: InvocationRequest) -> Result<Value, ServiceError> {
    let InvocationRequest {
        capability,
        args,
        params,
    } = request;

    let descriptor = backend
        .describe(capability)
        .ok_or(ServiceError::UnsupportedCapability(capability))?;
    let params = adapt_params(&descriptor.params, params);

    backend
        .call(capability, args, params)
        .map_err(|err| ServiceError::Invocation(format!("{err:#}")))
}

pub fn adapt_params(schema: &ParamSchema, supplied: NamedParams) -> NamedParams {
    match schema {
        ParamSchema::Declared(names) => supplied
            .into_iter()
            .filter(|(name, _)| names.contains(name))
            .collect(),
        ParamSchema::Open | ParamSchema::Unknown => supplied,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeSet,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use anyhow::{Result, anyhow};
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::model::{Argument, Capability, SkillDescriptor};

    struct Recorder {
        schema: ParamSchema,
        only: Capability,
        calls: AtomicUsize,
        seen: Mutex<Option<NamedParams>>,
        fail: bool,
    }

    impl Recorder {
        fn new(only: Capability, schema: ParamSchema) -> Self {
            Self {
                schema,
                only,
                calls: AtomicUsize::new(0),
                seen: Mutex::new(None),
                fail: false,
            }
        }
    }

    impl VisionBackend for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn describe(&self, capability: Capability) -> Option<SkillDescriptor> {
            (capability == self.only).then(|| SkillDescriptor {
                params: self.schema.clone(),
            })
        }

        fn call(&self, _: Capability, _: Vec<Argument>, params: NamedParams) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.seen.lock() = Some(params);
            if self.fail {
                return Err(anyhow!("CUDA out of memory"));
            }
            Ok(json!({"caption": "a dog"}))
        }
    }

    fn supplied() -> NamedParams {
        let mut params = NamedParams::new();
        params.insert("length".into(), json!("short"));
        params.insert("stream".into(), json!(false));
        params.insert("reasoning".into(), json!(true));
        params
    }

    #[test]
    fn declared_schema_keeps_exactly_the_intersection() {
        let declared = ["length", "settings", "stream"];
        let filtered = adapt_params(&ParamSchema::declared(declared), supplied());

        let kept: BTreeSet<_> = filtered.keys().cloned().collect();
        let expected: BTreeSet<_> = ["length".to_string(), "stream".to_string()].into();
        assert_eq!(kept, expected);
        assert_eq!(filtered["length"], json!("short"));
    }

    #[test]
    fn open_and_unknown_schemas_pass_everything() {
        assert_eq!(adapt_params(&ParamSchema::Open, supplied()), supplied());
        assert_eq!(adapt_params(&ParamSchema::Unknown, supplied()), supplied());
    }

    #[test]
    fn empty_declaration_drops_all_params() {
        let filtered = adapt_params(&ParamSchema::declared(Vec::<String>::new()), supplied());
        assert!(filtered.is_empty());
    }

    #[test]
    fn unsupported_skill_is_never_called() {
        let backend = Recorder::new(Capability::Caption, ParamSchema::Open);
        for capability in [Capability::Query, Capability::Detect, Capability::Point] {
            let err = invoke(&backend, InvocationRequest::new(capability)).unwrap_err();
            assert!(matches!(err, ServiceError::UnsupportedCapability(c) if c == capability));
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn backend_sees_filtered_params() {
        let backend = Recorder::new(Capability::Caption, ParamSchema::declared(["length"]));
        let request = InvocationRequest {
            capability: Capability::Caption,
            args: Vec::new(),
            params: supplied(),
        };

        let result = invoke(&backend, request).unwrap();
        assert_eq!(result["caption"], "a dog");
        let seen = backend.seen.lock().clone().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen.contains_key("length"));
    }

    #[test]
    fn backend_errors_become_invocation_failures() {
        let mut backend = Recorder::new(Capability::Caption, ParamSchema::Unknown);
        backend.fail = true;

        let err = invoke(&backend, InvocationRequest::new(Capability::Caption)).unwrap_err();
        match err {
            ServiceError::Invocation(detail) => assert!(detail.contains("out of memory")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }
}
