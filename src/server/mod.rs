//! Server surface around the connection core: accept loops, TLS setup,
//! routing, static files, rate limiting and statistics.

pub mod app;
pub mod listener;
pub mod rate_limit;
pub mod router;
pub mod static_files;
pub mod stats;
pub mod tls;

pub use app::{App, Middleware};
pub use listener::Server;
pub use rate_limit::{RateLimitRegistry, RateLimitResult, RateLimiter};
pub use router::Router;
pub use static_files::StaticFiles;
pub use stats::{ServerStats, StatsSnapshot};
