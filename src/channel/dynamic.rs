// SPDX-License-Identifier: MIT OR Apache-2.0

//! The channel handed out by the factory.
//!
//! A [`DynamicChannel`] fronts one tonic channel per discovered instance and
//! hands successive calls to them round-robin. It implements
//! [`tower::Service`] over gRPC HTTP bodies, so any generated tonic client
//! accepts it directly: `EchoServiceClient::new(channel)`.

use super::auth::AuthInterceptor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tonic::body::BoxBody;
use tonic::client::GrpcService;
use tonic::transport::Channel;

pub struct DynamicChannel {
    channels: Arc<Vec<Channel>>,
    next: Arc<AtomicUsize>,
    auth: Option<Arc<AuthInterceptor>>,
    // Channel picked by poll_ready for the next call.
    ready: Option<Channel>,
}

impl DynamicChannel {
    pub(crate) fn new(channels: Vec<Channel>, auth: Option<Arc<AuthInterceptor>>) -> Self {
        debug_assert!(!channels.is_empty());
        Self {
            channels: Arc::new(channels),
            next: Arc::new(AtomicUsize::new(0)),
            auth,
            ready: None,
        }
    }

    /// How many backend instances this channel fronts.
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.channels.len()
    }

    fn pick(&self) -> Channel {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.channels.len();
        self.channels[idx].clone()
    }
}

impl Clone for DynamicChannel {
    fn clone(&self) -> Self {
        Self {
            channels: Arc::clone(&self.channels),
            next: Arc::clone(&self.next),
            auth: self.auth.clone(),
            ready: None,
        }
    }
}

impl std::fmt::Debug for DynamicChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicChannel")
            .field("instances", &self.channels.len())
            .field("auth", &self.auth.is_some())
            .finish()
    }
}

impl tower::Service<http::Request<BoxBody>> for DynamicChannel {
    type Response = http::Response<<Channel as GrpcService<BoxBody>>::ResponseBody>;
    type Error = <Channel as GrpcService<BoxBody>>::Error;
    type Future = <Channel as GrpcService<BoxBody>>::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.ready.is_none() {
            let picked = self.pick();
            self.ready = Some(picked);
        }
        match self.ready.as_mut() {
            Some(channel) => GrpcService::poll_ready(channel, cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn call(&mut self, mut request: http::Request<BoxBody>) -> Self::Future {
        let mut channel = self.ready.take().unwrap_or_else(|| self.pick());
        if let Some(auth) = &self.auth {
            auth.apply(request.headers_mut());
        }
        GrpcService::call(&mut channel, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::transport::Endpoint;

    fn lazy_channel(port: u16) -> Channel {
        Endpoint::from_shared(format!("http://127.0.0.1:{port}"))
            .unwrap()
            .connect_lazy()
    }

    #[tokio::test]
    async fn round_robin_cycles_through_instances() {
        let channel = DynamicChannel::new(
            vec![lazy_channel(50051), lazy_channel(50052), lazy_channel(50053)],
            None,
        );

        assert_eq!(channel.instance_count(), 3);
        // The shared counter advances one slot per pick across clones.
        let before = channel.next.load(Ordering::Relaxed);
        let _ = channel.pick();
        let clone = channel.clone();
        let _ = clone.pick();
        assert_eq!(channel.next.load(Ordering::Relaxed), before + 2);
    }

    #[tokio::test]
    async fn clones_share_the_rotation_but_not_readiness() {
        let mut channel = DynamicChannel::new(vec![lazy_channel(50051)], None);
        channel.ready = Some(channel.pick());
        let clone = channel.clone();
        assert!(clone.ready.is_none());
    }
}
