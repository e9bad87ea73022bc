use std::{
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use dashmap::DashMap;
use http::HeaderMap;
use jsonrpsee::{
    MethodResponse,
    server::middleware::rpc::{ResponseFuture, RpcServiceT},
    types::{ErrorObjectOwned, Request},
};
use tower::{Layer, Service};

use tracing::debug;

use crate::error::RelayError;

// Derived from
// https://github.com/paritytech/jsonrpsee/blob/master/examples/examples/rpc_middleware_rate_limiting.rs

/// Methods that cost a credit. Everything else is free.
const LIMITED_METHODS: &[&str] = &["getAvailableTokenId"];

#[derive(Debug, Copy, Clone)]
pub struct Rate {
    num: u16,
    period: Duration,
}

impl Rate {
    pub fn new(num: u16, period: Duration) -> Self {
        Self { num, period }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    Deny { until: Instant },
    Allow { until: Instant, rem: u16 },
}

// Uses a credits-based rate limiting algorithm
//
// Each caller is assigned a certain number of credits
// which are consumed when a call is made. If the number of credits
// is insufficient, the request is denied.
fn next_state(state: State, now: Instant, price: u16, rate: Rate) -> State {
    let refill = || {
        if price > rate.num {
            State::Deny {
                until: now + rate.period,
            }
        } else {
            State::Allow {
                until: now + rate.period,
                rem: rate.num - price,
            }
        }
    };
    match state {
        State::Deny { until } if now < until => State::Deny { until },
        State::Allow { until, rem } if now < until => {
            if price > rem {
                State::Deny { until }
            } else {
                State::Allow {
                    until: now + rate.period,
                    rem: rem - price,
                }
            }
        }
        _ => refill(),
    }
}

/// Who is calling. Taken from the proxy headers, since the relay normally sits behind one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallerId(String);

impl CallerId {
    pub fn anonymous() -> Self {
        CallerId("anonymous".to_owned())
    }

    pub fn from_headers(headers: &HeaderMap) -> Self {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next());
        let real_ip = headers.get("x-real-ip").and_then(|v| v.to_str().ok());
        forwarded
            .or(real_ip)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| CallerId(v.to_owned()))
            .unwrap_or_else(Self::anonymous)
    }
}

/// HTTP middleware that tags every request with its [CallerId].
#[derive(Debug, Clone, Copy, Default)]
pub struct CallerIdLayer;

impl<S> Layer<S> for CallerIdLayer {
    type Service = CallerIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CallerIdService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct CallerIdService<S> {
    inner: S,
}

impl<S, B> Service<http::Request<B>> for CallerIdService<S>
where
    S: Service<http::Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: http::Request<B>) -> Self::Future {
        let caller = CallerId::from_headers(request.headers());
        request.extensions_mut().insert(caller);
        self.inner.call(request)
    }
}

/// Credit buckets of all callers, shared between connections.
#[derive(Debug, Clone)]
pub struct Limiter {
    rate: Rate,
    buckets: Arc<DashMap<CallerId, State>>,
}

impl Limiter {
    pub fn new(rate: Rate) -> Self {
        Limiter {
            rate,
            buckets: Arc::new(DashMap::new()),
        }
    }

    /// Spend the credit for a call. Returns false if the caller has run out.
    pub fn check(&self, caller: &CallerId, method: &str, now: Instant) -> bool {
        // disable rate limiting if rate is 0
        if self.rate.num == 0 || !LIMITED_METHODS.contains(&method) {
            return true;
        }
        let mut state = self
            .buckets
            .entry(caller.clone())
            .or_insert(State::Allow {
                until: now,
                rem: self.rate.num,
            });
        *state = next_state(*state, now, 1, self.rate);
        matches!(*state, State::Allow { .. })
    }

    /// Forget callers whose bucket has expired. An expired bucket refills on the next call anyway, so dropping it
    /// changes nothing but memory. Returns how many were dropped.
    pub fn evict_expired(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, state| match *state {
            State::Deny { until } | State::Allow { until, .. } => now < until,
        });
        before.saturating_sub(self.buckets.len())
    }

    /// Evict expired buckets once per rate period. Never returns.
    pub async fn run_eviction(self) {
        if self.rate.num == 0 {
            return;
        }
        let mut interval = tokio::time::interval(self.rate.period);
        loop {
            interval.tick().await;
            let evicted = self.evict_expired(Instant::now());
            if evicted > 0 {
                debug!(evicted, "rate limit buckets evicted");
            }
        }
    }
}

#[derive(Clone)]
pub struct RateLimit<S> {
    service: S,
    limiter: Limiter,
}

impl<S> RateLimit<S> {
    pub fn new(service: S, limiter: Limiter) -> Self {
        Self { service, limiter }
    }
}

impl<'a, S> RpcServiceT<'a> for RateLimit<S>
where
    S: Send + RpcServiceT<'a>,
{
    type Future = ResponseFuture<S::Future>;

    fn call(&self, req: Request<'a>) -> Self::Future {
        let caller = req
            .extensions()
            .get::<CallerId>()
            .cloned()
            .unwrap_or_else(CallerId::anonymous);

        if self
            .limiter
            .check(&caller, req.method_name(), Instant::now())
        {
            ResponseFuture::future(self.service.call(req))
        } else {
            ResponseFuture::ready(MethodResponse::error(
                req.id,
                ErrorObjectOwned::from(RelayError::RateLimited),
            ))
        }
    }
}
