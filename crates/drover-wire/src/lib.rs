//! drover-wire — framed request/reply transport for task dispatch.
//!
//! One coordinator ([`ReplyEndpoint`]) serves many remote workers
//! ([`RequestEndpoint`]). Every frame on the wire is a length-prefixed,
//! zlib-compressed, bincode-serialized message, and per connection the
//! exchange is strict request/reply: a worker blocks until its reply
//! arrives, and the coordinator answers each request exactly once through
//! a consume-on-reply handle.
//!
//! Payloads are [`Record`]s — ordered maps of named [`Value`]s, including
//! shaped numeric [`Tensor`]s that result aggregation can fold
//! element-wise or slab-by-slab.

pub mod codec;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod record;
pub mod value;

pub use codec::{DEFAULT_COMPRESSION, MAX_FRAME_BYTES, decode, encode};
pub use endpoint::{ReplyEndpoint, ReplyHandle, RequestEndpoint, WireOptions};
pub use error::{WireError, WireResult};
pub use flate2::Compression;
pub use message::{Reply, Request};
pub use record::Record;
pub use value::{Dtype, Tensor, TensorData, TensorError, Value};
