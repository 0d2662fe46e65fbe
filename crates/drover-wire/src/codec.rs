//! Frame codec — length-prefixed, zlib-compressed, bincode payloads.
//!
//! Framing is handled by `LengthDelimitedCodec`; this module covers the
//! payload half: serialize with bincode, then compress with zlib at a
//! per-send level. Decompression is symmetric and side-effect-free, so a
//! payload that fails to decode can simply be dropped without disturbing
//! the stream.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::codec::LengthDelimitedCodec;

use crate::error::{WireError, WireResult};

/// zlib level used when a send does not specify one.
pub const DEFAULT_COMPRESSION: u32 = 6;

/// Upper bound on a single frame; large enough for any reduce buffer this
/// protocol is used with.
pub const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

/// Serialize and compress one message payload.
pub fn encode<T: Serialize>(msg: &T, level: Compression) -> WireResult<Vec<u8>> {
    let raw = bincode::serialize(msg).map_err(|e| WireError::Encode(e.to_string()))?;
    let mut enc = ZlibEncoder::new(Vec::new(), level);
    enc.write_all(&raw)
        .and_then(|_| enc.finish())
        .map_err(|e| WireError::Encode(e.to_string()))
}

/// Decompress and deserialize one message payload.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> WireResult<T> {
    let mut raw = Vec::new();
    ZlibDecoder::new(payload)
        .read_to_end(&mut raw)
        .map_err(|e| WireError::Decode(e.to_string()))?;
    bincode::deserialize(&raw).map_err(|e| WireError::Decode(e.to_string()))
}

/// Framing shared by both endpoint ends.
pub(crate) fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Reply, Request};
    use crate::record::Record;
    use crate::value::Tensor;

    fn sample_result() -> Request {
        Request::Result(
            Record::new()
                .with("scale", 7i64)
                .with("dat", Tensor::from_f32(&[2, 3], vec![1.5; 6]).unwrap()),
        )
    }

    #[test]
    fn round_trips_at_any_level() {
        for level in [0u32, 1, 6, 9] {
            let msg = sample_result();
            let payload = encode(&msg, Compression::new(level)).unwrap();
            let back: Request = decode(&payload).unwrap();
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn round_trips_every_reply_variant() {
        for reply in [
            Reply::Work(Record::new().with("n", 1i64)),
            Reply::Standby,
            Reply::Done,
            Reply::Ack,
        ] {
            let payload = encode(&reply, Compression::default()).unwrap();
            let back: Reply = decode(&payload).unwrap();
            assert_eq!(back, reply);
        }
    }

    #[test]
    fn rejects_truncated_payload() {
        let mut payload = encode(&sample_result(), Compression::default()).unwrap();
        payload.truncate(payload.len() / 2);
        assert!(matches!(
            decode::<Request>(&payload),
            Err(WireError::Decode(_))
        ));
    }

    #[test]
    fn rejects_garbage_payload() {
        assert!(decode::<Request>(b"definitely not zlib").is_err());
    }

    #[test]
    fn rejects_a_tensor_whose_buffer_disagrees_with_its_shape() {
        // Serialize-only twins of the tensor layout, so the frame can
        // claim two elements while carrying six.
        #[derive(Serialize)]
        struct RawTensor {
            shape: Vec<usize>,
            data: RawData,
        }
        #[derive(Serialize)]
        enum RawData {
            F32(Vec<f32>),
        }
        let bad = RawTensor {
            shape: vec![2],
            data: RawData::F32(vec![1.0; 6]),
        };
        let payload = encode(&bad, Compression::default()).unwrap();
        assert!(matches!(
            decode::<Tensor>(&payload),
            Err(WireError::Decode(_))
        ));
    }
}
