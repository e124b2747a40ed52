// Copyright The Uncloud Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Byte-level response merging.
//!
//! Every non-streaming RPC response in this system is shaped as
//! `message XResponse { repeated XReply messages = 1; }`, and every `XReply`
//! begins with `ResponseMetadata metadata = 1`. Because both field numbers
//! are fixed and equal, a one-to-many fan-out can be assembled by
//! concatenating independently produced per-peer fragments: no concrete
//! message type is ever constructed or parsed here, which is what lets the
//! Director merge replies for an RPC method it knows nothing about.
//!
//! The trick, step by step, for a single peer:
//!
//! 1. The peer (even when it only ever sees a one-to-one call, since every
//!    method returns the `repeated` shape) answers with a full `XResponse`
//!    wrapping exactly one `XReply`. [`extract_reply`] strips that outer
//!    `repeated` framing and returns the inner `XReply`'s raw bytes.
//! 2. [`inject_metadata`] appends a `ResponseMetadata` field (tag
//!    [`METADATA_FIELD`]) to those bytes. Protobuf decoders don't care about
//!    field order or duplicate scans of a message's tail, so appending is
//!    sufficient — the one-to-one path never populates this field itself.
//! 3. [`wrap_as_element`] re-frames the result as a single element of the
//!    *outer* `repeated` field (tag [`REPLY_FIELD`]) with a freshly computed
//!    length.
//!
//! Concatenating the output of step 3 for every dispatched peer, in any
//! grouping, yields a byte-identical combined `XResponse` whose `messages`
//! decode one-for-one to the dispatched peers — see the `associativity` test
//! below for Testable Property 3.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::encoding::{decode_key, decode_varint, encode_key, encode_varint, WireType};
use prost::Message;

use crate::{ResponseMetadata, METADATA_FIELD, REPLY_FIELD};

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("response's first field was not the expected repeated wrapper at field {REPLY_FIELD}")]
    UnexpectedWireFormat,
    #[error("response claimed a length-delimited field longer than the remaining buffer")]
    Truncated,
    #[error("response wrapped zero replies; exactly one was expected from a single backend")]
    NoReply,
}

/// Strips the outer `repeated XReply messages = 1` framing from a raw,
/// encoded `XResponse` that wraps exactly one reply, returning that reply's
/// raw bytes.
///
/// Returns `Err(UnexpectedWireFormat)` if the buffer's first field is not
/// the expected wrapper — the caller should surface this as `Internal`,
/// per spec §7.
pub fn extract_reply(mut buf: Bytes) -> Result<Bytes, MergeError> {
    if buf.is_empty() {
        return Err(MergeError::NoReply);
    }
    let (field, wire_type) = decode_key(&mut buf).map_err(|_| MergeError::UnexpectedWireFormat)?;
    if field != REPLY_FIELD || wire_type != WireType::LengthDelimited {
        return Err(MergeError::UnexpectedWireFormat);
    }
    let len = decode_varint(&mut buf).map_err(|_| MergeError::UnexpectedWireFormat)? as usize;
    if buf.remaining() < len {
        return Err(MergeError::Truncated);
    }
    Ok(buf.slice(..len))
}

/// Appends a `ResponseMetadata` field to the tail of an encoded `XReply`.
/// `reply` may be empty (the all-default `XReply`, used to materialise a
/// per-peer failure with no other fields populated).
pub fn inject_metadata(reply: &[u8], metadata: &ResponseMetadata) -> BytesMut {
    let encoded_metadata = metadata.encode_to_vec();
    let mut out = BytesMut::with_capacity(reply.len() + encoded_metadata.len() + 8);
    out.put_slice(reply);
    encode_key(METADATA_FIELD, WireType::LengthDelimited, &mut out);
    encode_varint(encoded_metadata.len() as u64, &mut out);
    out.put_slice(&encoded_metadata);
    out
}

/// Re-frames `reply` as a single element of the outer `repeated` field.
pub fn wrap_as_element(reply: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(reply.len() + 8);
    encode_key(REPLY_FIELD, WireType::LengthDelimited, &mut out);
    encode_varint(reply.len() as u64, &mut out);
    out.put_slice(reply);
    out
}

/// Turns one backend's raw one-to-one `XResponse` into a single
/// `repeated`-field element tagged with `metadata`, ready to be
/// concatenated with every other peer's element.
pub fn to_reply_element(
    one_to_one_response: Bytes,
    metadata: &ResponseMetadata,
) -> Result<Bytes, MergeError> {
    let reply = extract_reply(one_to_one_response)?;
    let tagged = inject_metadata(&reply, metadata);
    Ok(wrap_as_element(&tagged).freeze())
}

/// Materialises a per-peer failure (spec §4.1 "Error reporting in
/// one-to-many mode"): a `Reply` whose only populated field is `metadata`,
/// with `metadata.error`/`metadata.status` set.
pub fn failure_element(metadata: &ResponseMetadata) -> Bytes {
    let tagged = inject_metadata(&[], metadata);
    wrap_as_element(&tagged).freeze()
}

/// Concatenates independently produced per-peer elements (each produced by
/// [`to_reply_element`] or [`failure_element`]) into one combined,
/// byte-valid `XResponse`. Associative by construction: concatenation is
/// associative regardless of how the caller groups the fold.
pub fn merge_elements<I>(elements: I) -> Bytes
where
    I: IntoIterator<Item = Bytes>,
{
    let mut out = BytesMut::new();
    for element in elements {
        out.put_slice(&element);
    }
    out.freeze()
}

/// Appends a trailing `ResponseMetadata` field directly to a streaming
/// frame (spec §4.1: "the injector simply appends a trailing
/// `ResponseMetadata` field to every frame").
pub fn inject_metadata_streaming(frame: &[u8], metadata: &ResponseMetadata) -> Bytes {
    inject_metadata(frame, metadata).freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ListServicesReply, ListServicesResponse, ServiceInfo};

    fn one_to_one_response(service_name: &str) -> Bytes {
        let resp = ListServicesResponse {
            messages: vec![ListServicesReply {
                metadata: None,
                services: vec![ServiceInfo {
                    id: format!("{service_name}-id"),
                    name: service_name.to_string(),
                    replicas: 1,
                }],
            }],
        };
        resp.encode_to_vec().into()
    }

    fn metadata_for(machine: &str) -> ResponseMetadata {
        ResponseMetadata::success(
            format!("[fd00::{machine}]"),
            format!("{machine}-id"),
            machine.to_string(),
        )
    }

    #[test]
    fn extract_reply_round_trips() {
        let raw = one_to_one_response("web");
        let reply = extract_reply(raw).unwrap();
        let decoded = ListServicesReply::decode(reply).unwrap();
        assert_eq!(decoded.services[0].name, "web");
    }

    #[test]
    fn extract_reply_rejects_bad_wire_format() {
        // Field 2, not field 1: violates the invariant.
        let mut buf = BytesMut::new();
        encode_key(2, WireType::LengthDelimited, &mut buf);
        encode_varint(0, &mut buf);
        let err = extract_reply(buf.freeze()).unwrap_err();
        assert!(matches!(err, MergeError::UnexpectedWireFormat));
    }

    #[test]
    fn associativity_property_3() {
        let elems: Vec<Bytes> = ["a", "b", "c"]
            .iter()
            .map(|m| to_reply_element(one_to_one_response(m), &metadata_for(m)).unwrap())
            .collect();

        let left_first = merge_elements(vec![
            merge_elements(vec![elems[0].clone(), elems[1].clone()]),
            elems[2].clone(),
        ]);
        let right_first = merge_elements(vec![
            elems[0].clone(),
            merge_elements(vec![elems[1].clone(), elems[2].clone()]),
        ]);
        assert_eq!(left_first, right_first);

        let decoded = ListServicesResponse::decode(left_first).unwrap();
        assert_eq!(decoded.messages.len(), 3);
        for (i, machine) in ["a", "b", "c"].iter().enumerate() {
            assert_eq!(decoded.messages[i].metadata.as_ref().unwrap().machine_id, format!("{machine}-id"));
            assert_eq!(decoded.messages[i].services[0].name, *machine);
        }
    }

    #[test]
    fn per_peer_failure_materialization_property_4() {
        let ok = to_reply_element(one_to_one_response("a"), &metadata_for("a")).unwrap();
        let failed = failure_element(&ResponseMetadata::failure(
            "[fd00::b]".to_string(),
            "b-id".to_string(),
            "b".to_string(),
            14, // UNAVAILABLE
            "connection refused".to_string(),
        ));

        let merged = merge_elements(vec![ok, failed]);
        let decoded = ListServicesResponse::decode(merged).unwrap();

        assert_eq!(decoded.messages.len(), 2);
        assert!(decoded.messages[0].metadata.as_ref().unwrap().error.is_empty());
        assert!(!decoded.messages[0].services.is_empty());

        let failed_reply = &decoded.messages[1];
        assert_eq!(failed_reply.metadata.as_ref().unwrap().error, "connection refused");
        assert!(failed_reply.services.is_empty());
    }
}
