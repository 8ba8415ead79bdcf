//! Per-process façade: owns the registries and codecs, encodes outbound calls,
//! decodes inbound values and dispatches inbound calls.
//!
//! A controller is configured and populated while it is exclusively owned.
//! The entry points ([`Controller::load_plugin`], [`Controller::serve_stdio`],
//! [`Controller::connect`]) consume it, after which it is shared immutably by
//! the connection and every dispatch task.

use std::any::Any;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;

use crate::bridge::codec::{
    DEFAULT_MAX_FRAME_LENGTH, FRAME_FORMAT_ENV, FrameFormat, MAX_FRAME_LENGTH_ENV, body_len,
    max_frame_length_from_env,
};
use crate::bridge::protocol::{Message, Value};
use crate::capability::{Capability, CapabilityEntry, CapabilityRegistry, MethodSet};
use crate::codec::{JsonCodec, ValueCodec};
use crate::error::{Error, Result};
use crate::function::{
    FunctionEntry, FunctionKind, FunctionRegistry, Handler, Signature, VariadicHandler,
};
use crate::plugin::{Endpoint, Plugin};
use crate::types::{TypeEntry, TypeRegistry, WireType};
use crate::values::{AnyValue, Values};

/// Default bound of the outbound call queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 6;

/// Configuration for a [`Controller`] and the connections it creates.
#[derive(Debug, Clone)]
pub struct ControllerConfig<C = JsonCodec> {
    pub value_codec: C,
    pub frame_format: FrameFormat,
    /// Largest frame body sent or accepted. Must match the peer's.
    pub max_frame_length: usize,
    /// Bound of the outbound call queue and of the dispatch result queue.
    pub queue_capacity: usize,
    /// Deadline applied to every pending call unless overridden per call.
    pub call_timeout: Option<Duration>,
    /// Reject re-registration of a function or capability instead of replacing it.
    pub strict_registration: bool,
}

impl Default for ControllerConfig<JsonCodec> {
    fn default() -> Self {
        Self::new(JsonCodec)
    }
}

impl<C: ValueCodec> ControllerConfig<C> {
    pub fn new(value_codec: C) -> Self {
        Self {
            value_codec,
            frame_format: FrameFormat::default(),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            call_timeout: None,
            strict_registration: false,
        }
    }

    pub fn with_value_codec<D: ValueCodec>(self, value_codec: D) -> ControllerConfig<D> {
        ControllerConfig {
            value_codec,
            frame_format: self.frame_format,
            max_frame_length: self.max_frame_length,
            queue_capacity: self.queue_capacity,
            call_timeout: self.call_timeout,
            strict_registration: self.strict_registration,
        }
    }

    pub fn with_frame_format(mut self, format: FrameFormat) -> Self {
        self.frame_format = format;
        self
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    /// Zero is bumped to one; tokio channels need a positive bound.
    pub fn with_queue_capacity(mut self, n: usize) -> Self {
        self.queue_capacity = n.max(1);
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn with_strict_registration(mut self, strict: bool) -> Self {
        self.strict_registration = strict;
        self
    }
}

pub struct Controller<C: ValueCodec = JsonCodec> {
    config: ControllerConfig<C>,
    types: TypeRegistry<C>,
    functions: FunctionRegistry,
    capabilities: CapabilityRegistry,
}

impl Controller<JsonCodec> {
    pub fn new() -> Self {
        Self::with_config(ControllerConfig::default())
    }
}

impl Default for Controller<JsonCodec> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ValueCodec> std::fmt::Debug for Controller<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("codec", &self.config.value_codec.name())
            .field("frame_format", &self.config.frame_format)
            .field("types", &self.types)
            .field("functions", &self.functions.ids())
            .finish()
    }
}

impl<C: ValueCodec> Controller<C> {
    pub fn with_config(config: ControllerConfig<C>) -> Self {
        Self {
            config,
            types: TypeRegistry::new(),
            functions: FunctionRegistry::new(),
            capabilities: CapabilityRegistry::new(),
        }
    }

    pub fn config(&self) -> &ControllerConfig<C> {
        &self.config
    }

    pub fn codec(&self) -> &C {
        &self.config.value_codec
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register a callable under `id`, along with every parameter and result type.
    pub fn register_function<Args, H: Handler<Args>>(
        &mut self,
        id: impl Into<String>,
        handler: H,
    ) -> Result<()> {
        let params = H::param_types::<C>();
        let results = H::result_types::<C>();
        self.insert_function(
            id.into(),
            FunctionKind::Fixed,
            params,
            results,
            move |func_id, args| handler.invoke(func_id, args),
        )
    }

    /// Register a callable whose last parameter is a `Vec<V>`.
    ///
    /// Callers may pass the vector itself or spread its elements as trailing
    /// arguments.
    pub fn register_variadic<Args, H: VariadicHandler<Args>>(
        &mut self,
        id: impl Into<String>,
        handler: H,
    ) -> Result<()> {
        let params = H::param_types::<C>();
        let results = H::result_types::<C>();
        self.insert_function(
            id.into(),
            FunctionKind::Variadic,
            params,
            results,
            move |func_id, args| handler.invoke(func_id, args),
        )
    }

    fn insert_function(
        &mut self,
        id: String,
        kind: FunctionKind,
        params: Vec<TypeEntry<C>>,
        results: Vec<TypeEntry<C>>,
        invoke: impl Fn(&str, Vec<AnyValue>) -> Result<Vec<AnyValue>> + Send + Sync + 'static,
    ) -> Result<()> {
        if id.is_empty() {
            return Err(Error::InvalidRegistration(
                "function identifier must not be empty".to_string(),
            ));
        }
        if self.config.strict_registration && self.functions.contains(&id) {
            return Err(Error::InvalidRegistration(format!(
                "function `{id}` is already registered"
            )));
        }

        let signature = Signature::from_entries(&params, &results);
        self.types
            .insert_all(params.into_iter().chain(results).collect())?;

        tracing::debug!(func_id = %id, ?kind, %signature, "Registered function");
        let entry = FunctionEntry::new(kind, signature, invoke);
        if self.functions.insert(id.clone(), entry).is_some() {
            tracing::warn!(func_id = %id, "Function re-registered, previous definition replaced");
        }
        Ok(())
    }

    /// Register capability `I` with its mock, seeding the type registry with
    /// every type its methods use.
    pub fn register_capability<I: Capability + ?Sized>(
        &mut self,
        mock: Option<Arc<I>>,
    ) -> Result<()> {
        let name = I::name();
        let Some(mock) = mock else {
            return Err(Error::InvalidRegistration(format!(
                "capability {name} registered without a mock"
            )));
        };
        if self.config.strict_registration && self.capabilities.contains(name) {
            return Err(Error::InvalidRegistration(format!(
                "capability {name} is already registered"
            )));
        }

        let mut methods = MethodSet::new();
        I::describe(&mut methods);
        let (methods, types) = methods.finish(name)?;
        self.types.insert_all(types)?;

        tracing::debug!(capability = name, methods = methods.len(), "Registered capability");
        if self
            .capabilities
            .insert(CapabilityEntry::new(mock, methods))
            .is_some()
        {
            tracing::warn!(capability = name, "Capability re-registered, previous mock replaced");
        }
        Ok(())
    }

    /// Register a single wire type, returning its wire name.
    pub fn register_type<T: WireType>(&mut self) -> Result<String> {
        self.types.register::<T>()
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub fn types(&self) -> &TypeRegistry<C> {
        &self.types
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.capabilities
    }

    pub fn signature(&self, id: &str) -> Option<&Signature> {
        self.functions.get(id).map(FunctionEntry::signature)
    }

    pub fn mock<I: Capability + ?Sized>(&self) -> Option<Arc<I>> {
        self.capabilities.mock::<I>()
    }

    // =========================================================================
    // Encode / decode / invoke
    // =========================================================================

    /// Encode a dynamically typed value under its registered wire name.
    pub fn encode_value(&self, value: &(dyn Any + Send)) -> Result<Value> {
        let value: &dyn Any = value;
        let entry = self.types.lookup_value(value).ok_or_else(|| {
            Error::UnsupportedType("value of an unregistered type".to_string())
        })?;
        let payload = entry.encode(&self.config.value_codec, value)?;
        Ok(Value::new(entry.name(), payload))
    }

    /// Encode a statically typed value; the type must be registered.
    pub fn encode<T: WireType>(&self, value: &T) -> Result<Value> {
        self.encode_value(value).map_err(|e| match e {
            Error::UnsupportedType(_) => {
                Error::UnsupportedType(format!("{} is not registered", T::wire_name()))
            }
            other => other,
        })
    }

    pub fn encode_values(&self, values: &Values) -> Result<Vec<Value>> {
        values
            .iter()
            .map(|value| self.encode_value(&**value))
            .collect()
    }

    pub fn decode_value(&self, value: &Value) -> Result<AnyValue> {
        let entry = self
            .types
            .get(&value.type_name)
            .ok_or_else(|| Error::UnknownType(value.type_name.clone()))?;
        entry.decode(&self.config.value_codec, &value.payload)
    }

    pub fn decode_values(&self, values: &[Value]) -> Result<Values> {
        values
            .iter()
            .map(|value| self.decode_value(value))
            .collect::<Result<Vec<_>>>()
            .map(Values::from_vec)
    }

    /// Invoke a registered function in this process.
    pub fn invoke_local(&self, id: &str, args: Values) -> Result<Values> {
        let entry = self
            .functions
            .get(id)
            .ok_or_else(|| Error::UnknownFunction(id.to_string()))?;
        entry.invoke(id, args.into_vec()).map(Values::from_vec)
    }

    /// Encode the arguments of an outbound call to `id`.
    ///
    /// `id` must be registered locally; the local definition stands in for the
    /// remote function and declares the types that cross the wire.
    pub fn encode_call(&self, id: &str, args: &Values) -> Result<Vec<Value>> {
        if !self.functions.contains(id) {
            return Err(Error::UnknownFunction(id.to_string()));
        }
        self.encode_values(args)
    }

    /// Refuse a message whose frame body would exceed the configured limit.
    pub(crate) fn check_frame(&self, message: &Message) -> Result<()> {
        let max = self.config.max_frame_length;
        let len = body_len(message)?;
        if len > max {
            return Err(Error::EncodeFailure {
                type_name: "frame".to_string(),
                reason: format!(
                    "{} frame of {len} bytes exceeds the {max} byte limit",
                    message.func_id
                ),
            });
        }
        Ok(())
    }

    // =========================================================================
    // Entry points
    // =========================================================================

    /// Master role: prepare the plugin executable at `path` as a child process.
    ///
    /// The child is spawned by [`Plugin::start`].
    pub fn load_plugin(self, path: impl AsRef<Path>) -> Result<Plugin<C>> {
        let path = std::path::absolute(path.as_ref())?;
        tracing::debug!(path = %path.display(), "Loading plugin");
        self.load_command(Command::new(path))
    }

    /// Master role with a caller-built command (arguments, environment).
    ///
    /// Standard streams are overridden: stdin and stdout carry the wire,
    /// stderr is inherited.
    pub fn load_command(self, mut command: Command) -> Result<Plugin<C>> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .env(FRAME_FORMAT_ENV, self.config.frame_format.as_str())
            .env(MAX_FRAME_LENGTH_ENV, self.config.max_frame_length.to_string());
        Ok(Plugin::new(Arc::new(self), Endpoint::Process(command)))
    }

    /// Plugin role: serve over this process's stdin/stdout, starting immediately.
    ///
    /// The frame format and limit exported by the master take precedence over
    /// the configured ones.
    pub fn serve_stdio(mut self) -> Result<Plugin<C>> {
        if let Some(format) = FrameFormat::from_env()? {
            self.config.frame_format = format;
        }
        if let Some(max) = max_frame_length_from_env()? {
            self.config.max_frame_length = max;
        }
        let plugin = self.connect(tokio::io::stdin(), tokio::io::stdout());
        plugin.start()?;
        Ok(plugin)
    }

    /// Connect over an arbitrary stream pair. Call [`Plugin::start`] to run it.
    pub fn connect<R, W>(self, reader: R, writer: W) -> Plugin<C>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Plugin::new(
            Arc::new(self),
            Endpoint::Streams {
                reader: Box::new(reader),
                writer: Box::new(writer),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    use crate::types::{Complex32, Complex64};
    use crate::values;

    trait Greeter: Send + Sync {
        fn greet(&self, name: String) -> String;
    }

    impl Capability for dyn Greeter {
        fn name() -> &'static str {
            "Greeter"
        }

        fn describe<C: ValueCodec>(methods: &mut MethodSet<C>) {
            methods.method::<(String,), String>("greet");
        }
    }

    struct Polite;

    impl Greeter for Polite {
        fn greet(&self, name: String) -> String {
            format!("hello, {name}")
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Reading {
        sensor: String,
        celsius: f64,
        raw: Vec<u8>,
        tag: [u8; 4],
    }

    crate::wire_type!(Reading => "Reading");

    fn roundtrip<T: WireType + Clone + PartialEq + std::fmt::Debug>(value: T) {
        let mut controller = Controller::new();
        controller.register_type::<T>().unwrap();
        let encoded = controller.encode(&value).unwrap();
        assert_eq!(encoded.type_name, T::wire_name());
        let decoded = controller.decode_value(&encoded).unwrap();
        assert_eq!(decoded.downcast_ref::<T>(), Some(&value));
    }

    #[test]
    fn add_returns_sum() {
        let mut controller = Controller::new();
        controller
            .register_function("add", |a: i64, b: i64| a + b)
            .unwrap();

        let out = controller.invoke_local("add", values![2i64, 3i64]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out.get::<i64>(0), Some(&5));
        assert_eq!(controller.signature("add").unwrap().to_string(), "(i64, i64) -> i64");
    }

    #[test]
    fn greeter_capability_registers_string() {
        let mut controller = Controller::new();
        let mock: Arc<dyn Greeter> = Arc::new(Polite);
        controller.register_capability::<dyn Greeter>(Some(mock)).unwrap();

        assert!(controller.types().contains("string"));
        let entry = controller.capabilities().get("Greeter").unwrap();
        assert_eq!(entry.method("greet").unwrap().to_string(), "(string) -> string");
        let mock = controller.mock::<dyn Greeter>().unwrap();
        assert_eq!(mock.greet("bob".into()), "hello, bob");
    }

    #[test]
    fn capability_without_mock_is_rejected() {
        let mut controller = Controller::new();
        let err = controller
            .register_capability::<dyn Greeter>(None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRegistration(_)), "{err}");
        assert!(controller.types().is_empty());
    }

    #[test]
    fn last_registration_wins_by_default() {
        let mut controller = Controller::new();
        controller.register_function("answer", || 1u8).unwrap();
        controller.register_function("answer", || 2u8).unwrap();
        let out = controller.invoke_local("answer", Values::new()).unwrap();
        assert_eq!(out.get::<u8>(0), Some(&2));
    }

    #[test]
    fn strict_registration_rejects_duplicates() {
        let config = ControllerConfig::default().with_strict_registration(true);
        let mut controller = Controller::with_config(config);
        controller.register_function("answer", || 1u8).unwrap();
        let err = controller.register_function("answer", || 2u8).unwrap_err();
        assert!(matches!(err, Error::InvalidRegistration(_)), "{err}");
    }

    #[test]
    fn empty_identifier_is_rejected() {
        let mut controller = Controller::new();
        assert!(controller.register_function("", || ()).is_err());
    }

    #[test]
    fn unregistered_value_is_unsupported() {
        let controller = Controller::new();
        let err = controller.encode(&7u16).unwrap_err();
        assert_eq!(err, Error::UnsupportedType("u16 is not registered".into()));
    }

    #[test]
    fn unknown_type_name_is_rejected() {
        let controller = Controller::new();
        let err = controller
            .decode_value(&Value::new("Mystery", b"{}".to_vec()))
            .unwrap_err();
        assert_eq!(err, Error::UnknownType("Mystery".into()));
    }

    #[test]
    fn corrupt_payload_is_decode_failure() {
        let mut controller = Controller::new();
        controller.register_type::<i32>().unwrap();
        let err = controller
            .decode_value(&Value::new("i32", b"\"nope\"".to_vec()))
            .unwrap_err();
        assert!(matches!(err, Error::DecodeFailure { .. }), "{err}");
    }

    #[test]
    fn unknown_function_is_reported() {
        let controller = Controller::new();
        let err = controller.invoke_local("nope", Values::new()).unwrap_err();
        assert_eq!(err, Error::UnknownFunction("nope".into()));
        let err = controller.encode_call("nope", &Values::new()).unwrap_err();
        assert_eq!(err, Error::UnknownFunction("nope".into()));
    }

    #[test]
    fn encode_call_encodes_every_argument() {
        let mut controller = Controller::new();
        controller
            .register_function("greet", |name: String| format!("hi {name}"))
            .unwrap();
        let values = controller
            .encode_call("greet", &values!["ann".to_string()])
            .unwrap();
        assert_eq!(values, vec![Value::new("string", b"\"ann\"".to_vec())]);
    }

    #[test]
    fn supported_kinds_roundtrip() {
        roundtrip(true);
        roundtrip(i8::MIN);
        roundtrip(i64::MAX);
        roundtrip(u64::MAX);
        roundtrip(-1.5f32);
        roundtrip(1024.75f64);
        roundtrip(Complex32::new(1.0, -2.0));
        roundtrip(Complex64::new(0.5, 4.25));
        roundtrip("héllo".to_string());
        roundtrip(vec![0u8, 255, 7]);
        roundtrip([9u8; 16]);
        roundtrip(Reading {
            sensor: "north".into(),
            celsius: -3.5,
            raw: vec![1, 2, 3],
            tag: *b"abcd",
        });
    }

    #[test]
    fn non_finite_floats_fail_to_encode() {
        let mut controller = Controller::new();
        controller.register_type::<f64>().unwrap();
        controller.register_type::<Complex32>().unwrap();

        for value in [f64::INFINITY, f64::NEG_INFINITY, f64::NAN] {
            let err = controller.encode(&value).unwrap_err();
            assert!(
                matches!(&err, Error::EncodeFailure { type_name, .. } if type_name == "f64"),
                "{err}"
            );
        }
        let err = controller
            .encode(&Complex32::new(f32::NAN, 0.0))
            .unwrap_err();
        assert!(matches!(err, Error::EncodeFailure { .. }), "{err}");
    }

    #[test]
    fn config_builder() {
        let config = ControllerConfig::default()
            .with_frame_format(FrameFormat::Lines)
            .with_queue_capacity(0)
            .with_max_frame_length(4096)
            .with_call_timeout(Duration::from_secs(2));
        assert_eq!(config.frame_format, FrameFormat::Lines);
        assert_eq!(config.max_frame_length, 4096);
        assert_eq!(config.queue_capacity, 1);
        assert_eq!(config.call_timeout, Some(Duration::from_secs(2)));
        assert!(!config.strict_registration);
    }
}
