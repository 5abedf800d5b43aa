//! Conversion between runtime statuses and `tonic::Status`.
//!
//! Error details travel in `grpc-status-details-bin` as an encoded
//! `google.rpc.Status` whose `details` are `google.protobuf.Any` values, the
//! same layout other gRPC stacks decode.

use bytes::Bytes;
use prost::Message as _;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, KeyAndValueRef, MetadataMap};

use greeting::{Code, ErrorDetail, Metadata, Status};

const DEBUG_INFO_TYPE_URL: &str = "type.googleapis.com/google.rpc.DebugInfo";

/// `google.rpc.Status`
#[derive(Clone, PartialEq, prost::Message)]
struct RpcStatus {
    #[prost(int32, tag = "1")]
    code: i32,
    #[prost(string, tag = "2")]
    message: String,
    #[prost(message, repeated, tag = "3")]
    details: Vec<ProtoAny>,
}

/// `google.protobuf.Any`
#[derive(Clone, PartialEq, prost::Message)]
struct ProtoAny {
    #[prost(string, tag = "1")]
    type_url: String,
    #[prost(bytes = "vec", tag = "2")]
    value: Vec<u8>,
}

/// `google.rpc.DebugInfo`
#[derive(Clone, PartialEq, prost::Message)]
struct DebugInfo {
    #[prost(string, repeated, tag = "1")]
    stack_entries: Vec<String>,
    #[prost(string, tag = "2")]
    detail: String,
}

/// Convert a runtime status into a tonic status carrying `metadata`.
pub fn to_tonic(status: &Status, metadata: &Metadata) -> tonic::Status {
    tonic::Status::with_details_and_metadata(
        tonic::Code::from_i32(status.code().as_i32()),
        status.message(),
        encode_details(status),
        to_metadata_map(metadata),
    )
}

/// Convert a tonic status into a runtime status, decoding known details.
pub fn from_tonic(status: &tonic::Status) -> Status {
    let converted = Status::new(Code::from_i32(status.code() as i32), status.message());
    decode_details(status.details())
        .into_iter()
        .fold(converted, Status::with_detail)
}

/// A success status that only carries trailer metadata.
///
/// Yielded as the final item of a streaming response so tonic writes
/// `metadata` into the trailers next to `grpc-status: 0`.
pub fn ok_with_trailer(metadata: &Metadata) -> tonic::Status {
    tonic::Status::with_metadata(tonic::Code::Ok, "", to_metadata_map(metadata))
}

fn encode_details(status: &Status) -> Bytes {
    if status.details().is_empty() {
        return Bytes::new();
    }
    let details = status
        .details()
        .iter()
        .map(|detail| match detail {
            ErrorDetail::DebugInfo {
                stack_entries,
                detail,
            } => ProtoAny {
                type_url: DEBUG_INFO_TYPE_URL.to_string(),
                value: DebugInfo {
                    stack_entries: stack_entries.clone(),
                    detail: detail.clone(),
                }
                .encode_to_vec(),
            },
        })
        .collect();
    let encoded = RpcStatus {
        code: status.code().as_i32(),
        message: status.message().to_string(),
        details,
    }
    .encode_to_vec();
    Bytes::from(encoded)
}

fn decode_details(bytes: &[u8]) -> Vec<ErrorDetail> {
    if bytes.is_empty() {
        return Vec::new();
    }
    let status = match RpcStatus::decode(bytes) {
        Ok(status) => status,
        Err(e) => {
            tracing::warn!("undecodable status details: {}", e);
            return Vec::new();
        }
    };
    status
        .details
        .into_iter()
        .filter(|any| any.type_url == DEBUG_INFO_TYPE_URL)
        .filter_map(|any| DebugInfo::decode(any.value.as_slice()).ok())
        .map(|info| ErrorDetail::DebugInfo {
            stack_entries: info.stack_entries,
            detail: info.detail,
        })
        .collect()
}

/// Build tonic metadata; entries that are not valid ASCII metadata are skipped.
pub fn to_metadata_map(metadata: &Metadata) -> MetadataMap {
    let mut map = MetadataMap::new();
    for (key, values) in metadata.iter() {
        let Ok(name) = AsciiMetadataKey::from_bytes(key.as_bytes()) else {
            tracing::warn!(key, "skipping invalid metadata key");
            continue;
        };
        for value in values {
            match value.parse::<AsciiMetadataValue>() {
                Ok(value) => {
                    map.append(name.clone(), value);
                }
                Err(_) => tracing::warn!(key, "skipping invalid metadata value"),
            }
        }
    }
    map
}

/// Copy the ASCII entries of tonic metadata; binary entries are dropped.
pub fn from_metadata_map(map: &MetadataMap) -> Metadata {
    let mut metadata = Metadata::new();
    for entry in map.iter() {
        if let KeyAndValueRef::Ascii(key, value) = entry
            && let Ok(value) = value.to_str()
        {
            metadata.append(key.as_str(), value);
        }
    }
    metadata
}
