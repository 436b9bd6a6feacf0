//! Response body tee used to populate the response cache on a miss.
//!
//! [`CaptureBody`] forwards every frame of the upstream body to the client
//! unchanged and keeps a copy. When the stream ends the copy is stored. If
//! the client goes away first, the rest of the upstream body is drained on a
//! detached task so the entry is still stored.
use std::{
    pin::Pin,
    task::{Context, Poll, ready},
};

use axum::{
    body::Body,
    http::{HeaderMap, StatusCode},
};
use bytes::{Bytes, BytesMut};
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::BodyExt;

use crate::core::response_cache::{CacheKey, CachedResponse, ResponseCache};

/// Where a finished capture goes.
pub struct CaptureTarget {
    pub cache: ResponseCache,
    pub key: CacheKey,
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl CaptureTarget {
    fn store(self, body: Bytes) {
        self.cache
            .insert(self.key, CachedResponse::capture(self.status, self.headers, body));
    }
}

struct Buffer {
    bytes: BytesMut,
    limit: usize,
    overflowed: bool,
}

impl Buffer {
    fn push(&mut self, data: &Bytes) {
        if self.overflowed {
            return;
        }
        if self.bytes.len() + data.len() > self.limit {
            self.overflowed = true;
            self.bytes = BytesMut::new();
            return;
        }
        self.bytes.extend_from_slice(data);
    }
}

pub struct CaptureBody {
    inner: Option<Body>,
    buffer: Buffer,
    target: Option<CaptureTarget>,
}

impl CaptureBody {
    pub fn new(inner: Body, target: CaptureTarget) -> Self {
        let limit = target.cache.max_entry_bytes();
        Self {
            inner: Some(inner),
            buffer: Buffer {
                bytes: BytesMut::new(),
                limit,
                overflowed: false,
            },
            target: Some(target),
        }
    }

    fn finish(&mut self) {
        self.inner = None;
        let Some(target) = self.target.take() else {
            return;
        };
        if self.buffer.overflowed {
            tracing::debug!(key = %target.key, "response exceeded capture limit, not cached");
            return;
        }
        target.store(self.buffer.bytes.split().freeze());
    }

    fn abandon(&mut self) {
        self.inner = None;
        self.target = None;
    }
}

impl HttpBody for CaptureBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match ready!(Pin::new(inner).poll_frame(cx)) {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    this.buffer.push(data);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(err)) => {
                tracing::debug!(error = %err, "upstream body failed, capture abandoned");
                this.abandon();
                Poll::Ready(Some(Err(err)))
            }
            None => {
                this.finish();
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.as_ref().is_none_or(HttpBody::is_end_stream)
    }

    fn size_hint(&self) -> SizeHint {
        self.inner
            .as_ref()
            .map_or_else(|| SizeHint::with_exact(0), HttpBody::size_hint)
    }
}

impl Drop for CaptureBody {
    fn drop(&mut self) {
        if self.target.is_none() || self.buffer.overflowed {
            return;
        }
        let Some(inner) = self.inner.take() else {
            return;
        };
        if inner.is_end_stream() {
            // HEAD responses and empty bodies are never polled.
            self.finish();
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let Some(target) = self.target.take() else {
            return;
        };
        let buffer = Buffer {
            bytes: std::mem::take(&mut self.buffer.bytes),
            limit: self.buffer.limit,
            overflowed: false,
        };
        runtime.spawn(drain_into_cache(inner, buffer, target));
    }
}

async fn drain_into_cache(mut body: Body, mut buffer: Buffer, target: CaptureTarget) {
    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                if let Some(data) = frame.data_ref() {
                    buffer.push(data);
                }
                if buffer.overflowed {
                    return;
                }
            }
            Err(err) => {
                tracing::debug!(error = %err, key = %target.key, "draining upstream body failed");
                return;
            }
        }
    }
    tracing::debug!(key = %target.key, "client left early, response cached after draining");
    target.store(buffer.bytes.freeze());
}
