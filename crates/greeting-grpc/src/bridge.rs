//! tonic service that forwards every call into the runtime.

use std::pin::Pin;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Streaming};

use greeting::{ClientCall, Connector, HelloResponse, Metadata, RequestSender, methods};

use crate::proto;
use crate::proto::greeting_service_server::GreetingService;
use crate::status::{from_metadata_map, from_tonic, ok_with_trailer, to_metadata_map, to_tonic};

type ResponseStream =
    Pin<Box<dyn Stream<Item = Result<proto::HelloResponse, tonic::Status>> + Send>>;

/// Responses buffered between the runtime and tonic per streaming call.
const RESPONSE_BUFFER: usize = 16;

/// Forwards gRPC calls to a runtime reachable through `connector`.
#[derive(Debug, Clone)]
pub struct GrpcBridge {
    connector: Connector,
}

impl GrpcBridge {
    /// Create a bridge over an in-process connector.
    pub fn new(connector: Connector) -> Self {
        Self { connector }
    }

    async fn open(
        &self,
        method: &str,
        metadata: &MetadataMap,
    ) -> Result<ClientCall, tonic::Status> {
        let incoming = from_metadata_map(metadata);
        let timeout = metadata
            .get("grpc-timeout")
            .and_then(|value| value.to_str().ok())
            .and_then(parse_timeout);
        let call = match timeout {
            Some(timeout) => {
                let deadline = deadline_after(Instant::now(), timeout)?;
                self.connector.call_with_deadline(method, incoming, deadline).await
            }
            None => self.connector.call(method, incoming).await,
        };
        call.map_err(|status| to_tonic(&status, &Metadata::new()))
    }
}

/// Longest `TimeoutValue` the gRPC protocol allows.
const MAX_TIMEOUT_DIGITS: usize = 8;

/// Parse a `grpc-timeout` value such as `500m` or `3S`.
fn parse_timeout(value: &str) -> Option<Duration> {
    if !value.is_ascii() || value.len() < 2 {
        return None;
    }
    let (amount, unit) = value.split_at(value.len() - 1);
    if amount.len() > MAX_TIMEOUT_DIGITS || !amount.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = amount.parse().ok()?;
    let timeout = match unit {
        "H" => Duration::from_secs(amount.saturating_mul(3600)),
        "M" => Duration::from_secs(amount.saturating_mul(60)),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(timeout)
}

fn deadline_after(now: Instant, timeout: Duration) -> Result<Instant, tonic::Status> {
    now.checked_add(timeout)
        .ok_or_else(|| tonic::Status::invalid_argument("grpc-timeout out of range"))
}

/// Feed a client stream into the call until it ends or the server stops reading.
fn pump_requests(mut requests: Streaming<proto::HelloRequest>, sender: RequestSender) {
    tokio::spawn(async move {
        while let Some(item) = requests.next().await {
            let delivered = match item {
                Ok(request) => sender.send(greeting::HelloRequest::from(request)).await,
                Err(status) => {
                    if sender.send_error(from_tonic(&status)).await.is_err() {
                        tracing::debug!(
                            code = %status.code(),
                            "request stream error not delivered"
                        );
                    }
                    break;
                }
            };
            if delivered.is_err() {
                tracing::debug!("server stopped reading the request stream");
                break;
            }
        }
    });
}

/// Merge header and trailer metadata for an error that ends the call.
fn error_metadata(header: Option<Metadata>, trailer: Metadata) -> Metadata {
    let mut metadata = header.unwrap_or_default();
    metadata.merge(trailer);
    metadata
}

/// Collect a single-response call.
async fn unary_response(call: ClientCall) -> Result<Response<proto::HelloResponse>, tonic::Status> {
    let outcome = call.finish().await;
    if let Some(status) = &outcome.status {
        return Err(to_tonic(status, &error_metadata(outcome.header, outcome.trailer)));
    }
    if !outcome.trailer.is_empty() {
        // tonic writes unary trailers itself; only error statuses carry ours.
        tracing::debug!(trailer = ?outcome.trailer, "dropping unary success trailer");
    }

    let header = outcome.header.clone().unwrap_or_default();
    let messages = outcome
        .into_messages::<HelloResponse>()
        .map_err(|status| to_tonic(&status, &Metadata::new()))?;
    if messages.len() > 1 {
        tracing::warn!(count = messages.len(), "unary call produced extra responses");
    }
    let Some(message) = messages.into_iter().next() else {
        return Err(tonic::Status::internal("call completed without a response"));
    };

    let mut response = Response::new(proto::HelloResponse::from(message));
    *response.metadata_mut() = to_metadata_map(&header);
    Ok(response)
}

/// Relay a streaming response: header metadata first, then messages, then
/// the trailer on the final status.
async fn stream_response(mut call: ClientCall) -> Result<Response<ResponseStream>, tonic::Status> {
    let Some(header) = call.header().await.cloned() else {
        // Ended before any header, e.g. an unknown method.
        let outcome = call.finish().await;
        return Err(match &outcome.status {
            Some(status) => to_tonic(status, &outcome.trailer),
            None => ok_with_trailer(&outcome.trailer),
        });
    };

    let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
    tokio::spawn(async move {
        loop {
            let item = match call.message::<HelloResponse>().await {
                Ok(Some(message)) => Ok(proto::HelloResponse::from(message)),
                Ok(None) => {
                    let trailer = call.trailer().cloned().unwrap_or_default();
                    let _ = tx.send(Err(ok_with_trailer(&trailer))).await;
                    break;
                }
                Err(status) => {
                    let trailer = call.trailer().cloned().unwrap_or_default();
                    let _ = tx.send(Err(to_tonic(&status, &trailer))).await;
                    break;
                }
            };
            if tx.send(item).await.is_err() {
                // The gRPC client went away; dropping the call cancels it.
                tracing::debug!("response stream dropped by client");
                break;
            }
        }
    });

    let stream: ResponseStream = Box::pin(ReceiverStream::new(rx));
    let mut response = Response::new(stream);
    *response.metadata_mut() = to_metadata_map(&header);
    Ok(response)
}

#[tonic::async_trait]
impl GreetingService for GrpcBridge {
    async fn hello(
        &self,
        request: Request<proto::HelloRequest>,
    ) -> Result<Response<proto::HelloResponse>, tonic::Status> {
        let mut call = self.open(methods::HELLO, request.metadata()).await?;
        send_single(&mut call, request.into_inner()).await;
        unary_response(call).await
    }

    type HelloServerStreamStream = ResponseStream;

    async fn hello_server_stream(
        &self,
        request: Request<proto::HelloRequest>,
    ) -> Result<Response<Self::HelloServerStreamStream>, tonic::Status> {
        let mut call = self
            .open(methods::HELLO_SERVER_STREAM, request.metadata())
            .await?;
        send_single(&mut call, request.into_inner()).await;
        stream_response(call).await
    }

    async fn hello_client_stream(
        &self,
        request: Request<Streaming<proto::HelloRequest>>,
    ) -> Result<Response<proto::HelloResponse>, tonic::Status> {
        let mut call = self
            .open(methods::HELLO_CLIENT_STREAM, request.metadata())
            .await?;
        if let Some(sender) = call.take_sender() {
            pump_requests(request.into_inner(), sender);
        }
        unary_response(call).await
    }

    type HelloBiStreamsStream = ResponseStream;

    async fn hello_bi_streams(
        &self,
        request: Request<Streaming<proto::HelloRequest>>,
    ) -> Result<Response<Self::HelloBiStreamsStream>, tonic::Status> {
        let mut call = self
            .open(methods::HELLO_BI_STREAMS, request.metadata())
            .await?;
        if let Some(sender) = call.take_sender() {
            pump_requests(request.into_inner(), sender);
        }
        stream_response(call).await
    }
}

/// Send the only request of a call and close the request stream.
///
/// A failed send means the server already finished the call; its status is
/// read from the trailer.
async fn send_single(call: &mut ClientCall, request: proto::HelloRequest) {
    if let Err(status) = call.send(greeting::HelloRequest::from(request)).await {
        tracing::debug!(code = %status.code(), "request not delivered");
    }
    call.close_send();
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timeout_units() {
        assert_eq!(parse_timeout("500m"), Some(Duration::from_millis(500)));
        assert_eq!(parse_timeout("3S"), Some(Duration::from_secs(3)));
        assert_eq!(parse_timeout("2M"), Some(Duration::from_secs(120)));
        assert_eq!(parse_timeout("1H"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_timeout("10u"), Some(Duration::from_micros(10)));
        assert_eq!(parse_timeout("7n"), Some(Duration::from_nanos(7)));
    }

    #[test]
    fn test_parse_timeout_rejects_garbage() {
        assert_eq!(parse_timeout(""), None);
        assert_eq!(parse_timeout("m"), None);
        assert_eq!(parse_timeout("10x"), None);
        assert_eq!(parse_timeout("-5S"), None);
        assert_eq!(parse_timeout("+5S"), None);
    }

    #[test]
    fn test_parse_timeout_caps_digits() {
        assert_eq!(
            parse_timeout("99999999H"),
            Some(Duration::from_secs(99_999_999 * 3600))
        );
        assert_eq!(parse_timeout("123456789S"), None);
        assert_eq!(parse_timeout("18446744073709551615S"), None);
    }

    #[test]
    fn test_deadline_overflow_is_invalid_argument() {
        let err = deadline_after(Instant::now(), Duration::MAX).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);

        let now = Instant::now();
        let deadline = deadline_after(now, Duration::from_secs(3)).unwrap();
        assert_eq!(deadline - now, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_open_with_huge_timeout_does_not_panic() {
        let (_listener, connector) = greeting::transport::memory(4);
        let bridge = GrpcBridge::new(connector);

        let mut metadata = MetadataMap::new();
        metadata.insert("grpc-timeout", "18446744073709551615S".parse().unwrap());
        assert!(bridge.open(methods::HELLO, &metadata).await.is_ok());

        metadata.insert("grpc-timeout", "99999999H".parse().unwrap());
        assert!(bridge.open(methods::HELLO, &metadata).await.is_ok());
    }
}
