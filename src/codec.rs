//! Wire codec for the carbon pickle receiver.
//!
//! Each outgoing message is one frame: a 4-byte big-endian unsigned length
//! followed by the payload. The payload is a pickle-serialized list of
//! `(metric, (timestamp, value))` tuples, which is what the reference
//! carbon pickle receiver expects. Serialization uses protocol 2, the
//! highest protocol the reference receivers accept.
//!
//! The forwarding path only ever encodes; decoding is provided for
//! receivers in tests and tooling.

use crate::metric::{Datapoint, MetricName};
use anyhow::{anyhow, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the frame length prefix in bytes.
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Serialize a batch of datapoints into one ready-to-write frame.
///
/// The returned buffer is contiguous so the transport can hand it to the
/// kernel in a single write. No partial frames are ever produced.
pub fn encode_batch(batch: &[(MetricName, Datapoint)]) -> Result<Bytes> {
    let tuples: Vec<(&str, (u64, f64))> = batch
        .iter()
        .map(|(metric, point)| (metric.as_str(), (point.timestamp, point.value)))
        .collect();
    let payload = serde_pickle::to_vec(&tuples, serde_pickle::SerOptions::new().proto_v2())?;
    Ok(frame(&payload))
}

/// Prefix a serialized payload with its big-endian length.
pub fn frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_BYTES + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Decode a complete frame (length prefix included) back into a batch.
pub fn decode_frame(frame: &[u8]) -> Result<Vec<(MetricName, Datapoint)>> {
    if frame.len() < LENGTH_PREFIX_BYTES {
        return Err(anyhow!("frame shorter than its length prefix"));
    }
    let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    let payload = &frame[LENGTH_PREFIX_BYTES..];
    if payload.len() != declared {
        return Err(anyhow!(
            "frame length mismatch: prefix says {} bytes, payload has {}",
            declared,
            payload.len()
        ));
    }
    decode_payload(payload)
}

/// Decode a frame payload (length prefix already stripped).
pub fn decode_payload(payload: &[u8]) -> Result<Vec<(MetricName, Datapoint)>> {
    let tuples: Vec<(String, (u64, f64))> =
        serde_pickle::from_slice(payload, serde_pickle::DeOptions::new())?;
    Ok(tuples
        .into_iter()
        .map(|(metric, (timestamp, value))| (metric, Datapoint { timestamp, value }))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_carries_big_endian_length_prefix() {
        let framed = frame(b"hello");
        assert_eq!(&framed[..4], &5u32.to_be_bytes());
        assert_eq!(&framed[4..], b"hello");
    }

    #[test]
    fn one_element_batch_round_trips() {
        let batch = vec![("a.b".to_string(), Datapoint::new(100, 1.5))];
        let framed = encode_batch(&batch).unwrap();
        let decoded = decode_frame(&framed).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn batch_order_is_preserved() {
        let batch: Vec<(MetricName, Datapoint)> = (0..5)
            .map(|i| ("m".to_string(), Datapoint::new(i, i as f64)))
            .collect();
        let framed = encode_batch(&batch).unwrap();
        let decoded = decode_frame(&framed).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn payload_is_protocol_2_pickle() {
        let batch = vec![("a".to_string(), Datapoint::new(1, 2.0))];
        let framed = encode_batch(&batch).unwrap();
        // \x80 PROTO 2 is the protocol 2 preamble.
        assert_eq!(framed[4], 0x80);
        assert_eq!(framed[5], 2);
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let framed = encode_batch(&[("a".to_string(), Datapoint::new(1, 2.0))]).unwrap();
        assert!(decode_frame(&framed[..framed.len() - 1]).is_err());
        assert!(decode_frame(&framed[..2]).is_err());
    }
}
