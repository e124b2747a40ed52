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

//! Wires the [`Director`] directly into the HTTP/2 transport as a single
//! `tower::Service`, instead of per-method generated service impls
//! (§4.1 implementation notes): one routing decision point serves every
//! method name, which is what makes the Director's rules apply uniformly.
//!
//! Only unary calls are proxied here. `StreamLogs` is deliberately never
//! routed through this service: [`uncloud_logs`]'s client drives each
//! machine's `StreamLogs` directly with the generated stub, since its own
//! client-side ordering already subsumes anything a merge step here could
//! add (see `logs::LogMergeEngine`).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{Request, Response};
use hyper::Body;
use tonic::metadata::MetadataMap;
use tonic::Status;
use tower::Service;
use tracing::error;

use uncloud_machine::MachineMapper;

use crate::backend::Backend;
use crate::director::Director;

/// A `tower::Service` over raw HTTP/2 requests that forwards every call to
/// the wrapped [`Director`], regardless of method name.
#[derive(Clone)]
pub struct DirectorService<L, M> {
    director: Arc<Director<L, M>>,
}

impl<L, M> DirectorService<L, M> {
    pub fn new(director: Arc<Director<L, M>>) -> Self {
        DirectorService { director }
    }
}

impl<L, M> Service<Request<Body>> for DirectorService<L, M>
where
    L: Backend + 'static,
    M: MachineMapper + 'static,
{
    type Response = Response<Body>;
    type Error = std::convert::Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let director = Arc::clone(&self.director);
        Box::pin(async move {
            let path = match req.uri().path_and_query() {
                Some(path) => path.clone(),
                None => return Ok(status_response(Status::invalid_argument("missing path"))),
            };
            let metadata = MetadataMap::from_headers(req.headers().clone());

            let body = match hyper::body::to_bytes(req.into_body()).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    return Ok(status_response(Status::internal(format!(
                        "failed to read request body: {err}"
                    ))))
                }
            };
            let message = match decode_grpc_frame(body) {
                Ok(message) => message,
                Err(status) => return Ok(status_response(status)),
            };

            match director.dispatch(path, metadata, message).await {
                Ok(reply) => Ok(grpc_response(encode_grpc_frame(reply))),
                Err(status) => {
                    error!(code = ?status.code(), message = status.message(), "dispatch failed");
                    Ok(status_response(status))
                }
            }
        })
    }
}

/// gRPC's unary wire framing: a one-byte compression flag, a four-byte
/// big-endian message length, then the message. We never compress, so the
/// flag is always 0 on both sides of this proxy.
fn decode_grpc_frame(mut body: Bytes) -> Result<Bytes, Status> {
    if body.remaining() < 5 {
        return Err(Status::internal(
            "request body shorter than the gRPC frame header",
        ));
    }
    let compressed = body.get_u8();
    if compressed != 0 {
        return Err(Status::unimplemented(
            "compressed gRPC frames are not supported by this proxy",
        ));
    }
    let len = body.get_u32() as usize;
    if body.remaining() < len {
        return Err(Status::internal("gRPC frame shorter than its declared length"));
    }
    Ok(body.copy_to_bytes(len))
}

fn encode_grpc_frame(message: Bytes) -> Bytes {
    let mut framed = BytesMut::with_capacity(message.len() + 5);
    framed.put_u8(0);
    framed.put_u32(message.len() as u32);
    framed.put_slice(&message);
    framed.freeze()
}

fn grpc_response(framed_body: Bytes) -> Response<Body> {
    Response::builder()
        .header("content-type", "application/grpc")
        .header("grpc-status", "0")
        .body(Body::from(framed_body))
        .expect("a response with only well-formed headers cannot fail to build")
}

fn status_response(status: Status) -> Response<Body> {
    Response::builder()
        .header("content-type", "application/grpc")
        .header("grpc-status", status.code() as i32)
        .header("grpc-message", status.message())
        .body(Body::empty())
        .expect("a response with only well-formed headers cannot fail to build")
}
