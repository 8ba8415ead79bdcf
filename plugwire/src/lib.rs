//! plugwire: bidirectional function calls between a master process and its
//! plugin over a pair of byte streams.
//!
//! Both sides build a [`Controller`], register the functions, capabilities and
//! types they understand, then turn it into a [`Plugin`] connection:
//!
//! ```ignore
//! // master
//! let mut controller = Controller::new();
//! controller.register_function("add", |a: i64, b: i64| a + b)?;
//! let plugin = controller.load_plugin("./my-plugin")?;
//! plugin.start()?;
//! let sum = plugin.call("add", values![2i64, 3i64]).await?.await?;
//!
//! // plugin
//! let mut controller = Controller::new();
//! controller.register_function("add", |a: i64, b: i64| a + b)?;
//! controller.serve_stdio()?.wait().await?;
//! ```

pub mod bridge;
pub mod capability;
pub mod codec;
pub mod controller;
pub mod error;
pub mod function;
pub mod plugin;
pub mod types;
mod values;

pub use bridge::codec::{
    DEFAULT_MAX_FRAME_LENGTH, FRAME_FORMAT_ENV, FrameFormat, MAX_FRAME_LENGTH_ENV,
};
pub use bridge::protocol::{Message, Value};
pub use capability::{Capability, MethodSet};
pub use codec::{JsonCodec, ValueCodec};
pub use controller::{Controller, ControllerConfig};
pub use error::{Error, Result};
pub use function::{FunctionKind, Handler, IntoResults, Signature, VariadicHandler};
pub use plugin::{ConnectionState, PendingCall, Plugin};
pub use types::{Complex32, Complex64, WireType};
pub use values::{AnyValue, Values};
