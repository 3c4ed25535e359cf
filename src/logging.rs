use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use log::log;
use rocket::{
    fairing::{Fairing, Info, Kind},
    request::{FromRequest, Outcome},
    Data, Orbit, Request, Response, Rocket,
};

use crate::{config::Config, error::log_level};

/// Tags every log line that belongs to one request, e.g. `req42`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct RequestId(pub usize);

impl RequestId {
    /// Allocate the next ID. Wraps on overflow.
    pub fn next() -> RequestId {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        RequestId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "req{}", self.0)
    }
}

/// Per-request bookkeeping, cached on the request the first time it is asked for.
#[derive(Debug)]
struct Arrival {
    id: RequestId,
    at: Instant,
}

impl Arrival {
    fn now() -> Self {
        Self {
            id: RequestId::next(),
            at: Instant::now(),
        }
    }

    fn of<'r>(req: &'r Request<'_>) -> &'r Self {
        req.local_cache(Self::now)
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for &'r RequestId {
    type Error = std::convert::Infallible;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        Outcome::Success(&Arrival::of(req).id)
    }
}

/// Logs each request and its response, plus server liftoff and shutdown.
#[derive(Debug, Copy, Clone)]
pub struct LoggerFairing;

#[rocket::async_trait]
impl Fairing for LoggerFairing {
    fn info(&self) -> Info {
        Info {
            name: "Logger",
            kind: Kind::Liftoff | Kind::Request | Kind::Response | Kind::Shutdown,
        }
    }

    async fn on_liftoff(&self, rocket: &Rocket<Orbit>) {
        let config = rocket.config();
        let scheme = if config.tls_enabled() { "https" } else { "http" };
        let tracking = match rocket.state::<Config>() {
            Some(c) if c.voter_tracking() => "on",
            Some(_) => "off",
            None => "unconfigured",
        };
        info!(
            "Accepting votes on {scheme}://{}:{} (voter tracking {tracking})",
            config.address, config.port
        );
    }

    async fn on_request(&self, req: &mut Request<'_>, _data: &mut Data<'_>) {
        let arrival = Arrival::of(req);
        info!("->{} {} {}", arrival.id, req.method(), req.uri());
    }

    async fn on_response<'r>(&self, req: &'r Request<'_>, res: &mut Response<'r>) {
        let arrival = Arrival::of(req);
        let status = res.status();
        let route = req
            .route()
            .map(|route| match route.name {
                Some(ref name) => format!("{name} ({})", route.uri),
                None => route.uri.to_string(),
            })
            .unwrap_or_else(|| "no route".to_string());
        log!(
            log_level(status),
            "<-{} {status} {route} ({}ms)",
            arrival.id,
            arrival.at.elapsed().as_millis()
        );
    }

    async fn on_shutdown(&self, _rocket: &Rocket<Orbit>) {
        warn!("Shutdown requested, finishing in-flight votes");
    }
}
