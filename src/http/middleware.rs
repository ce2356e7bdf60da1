//! Middleware and tripperware chaining.
//!
//! Both kinds decorate the next step of a request: middleware wraps a
//! server [`Handler`], tripperware wraps a client [`Tripper`]. A component
//! that observes both sides (the HTTP logger) implements both traits.
//!
//! ```text
//! chain([m1, m2, m3], h) == m1(m2(m3(h)))
//! request path:  m1 → m2 → m3 → h
//! response path: h → m3 → m2 → m1
//! ```

use std::sync::Arc;

use super::handler::{Handler, Tripper};

/// Decorates a server handler.
pub trait Middleware: Send + Sync {
    fn middleware(&self, next: Handler) -> Handler;
}

/// Decorates a client round-tripper.
pub trait Tripperware: Send + Sync {
    fn tripperware(&self, next: Tripper) -> Tripper;
}

/// Wrap `handler` so that `middleware[0]` runs first on the request path.
pub fn chain(middleware: &[Arc<dyn Middleware>], handler: Handler) -> Handler {
    middleware
        .iter()
        .rev()
        .fold(handler, |next, m| m.middleware(next))
}

/// Wrap `tripper` so that `tripperware[0]` runs first on the request path.
pub fn chain_trippers(tripperware: &[Arc<dyn Tripperware>], tripper: Tripper) -> Tripper {
    tripperware
        .iter()
        .rev()
        .fold(tripper, |next, t| t.tripperware(next))
}

/// Middleware from a plain function.
pub struct MiddlewareFn<F>(pub F);

impl<F> Middleware for MiddlewareFn<F>
where
    F: Fn(Handler) -> Handler + Send + Sync,
{
    fn middleware(&self, next: Handler) -> Handler {
        (self.0)(next)
    }
}

/// Tripperware from a plain function.
pub struct TripperwareFn<F>(pub F);

impl<F> Tripperware for TripperwareFn<F>
where
    F: Fn(Tripper) -> Tripper + Send + Sync,
{
    fn tripperware(&self, next: Tripper) -> Tripper {
        (self.0)(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::handler::{handler_fn, round_trip, serve, tripper_fn};
    use axum::body::Body;
    use axum::http::{Request, Response};
    use std::sync::Mutex;

    fn recording(label: &'static str, log: Arc<Mutex<Vec<String>>>) -> Arc<dyn Middleware> {
        Arc::new(MiddlewareFn(move |next: Handler| {
            let log = log.clone();
            handler_fn(move |req| {
                let log = log.clone();
                let next = next.clone();
                async move {
                    log.lock().unwrap().push(format!("{label}>"));
                    let res = serve(&next, req).await;
                    log.lock().unwrap().push(format!("<{label}"));
                    res
                }
            })
        }))
    }

    #[tokio::test]
    async fn declaration_order_is_execution_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let terminal = {
            let log = log.clone();
            handler_fn(move |_req| {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push("h".to_string());
                    Response::new(Body::empty())
                }
            })
        };
        let mws = vec![
            recording("m1", log.clone()),
            recording("m2", log.clone()),
            recording("m3", log.clone()),
        ];
        let h = chain(&mws, terminal);
        serve(&h, Request::new(Body::empty())).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["m1>", "m2>", "m3>", "h", "<m3", "<m2", "<m1"]
        );
    }

    #[tokio::test]
    async fn empty_chain_is_identity() {
        let t = tripper_fn(|_req| async { Ok(Response::new(Body::from("x"))) });
        let t = chain_trippers(&[], t);
        let res = round_trip(&t, Request::new(Body::empty())).await.unwrap();
        assert_eq!(res.status(), 200);
    }
}
