use std::sync::Arc;

use lantern::config::Config;
use lantern::http::request::{Method, Request};
use lantern::http::response::{Response, StatusCode};
use lantern::server::{App, RateLimitRegistry, Server, ServerStats};
use lantern::websocket::{WebSocketHandler, WebSocketSender};
use tracing_subscriber::EnvFilter;

/// Sends every message straight back.
struct Echo;

impl WebSocketHandler for Echo {
    fn on_open(&self, sender: &WebSocketSender) {
        sender.send_text("Welcome to the lantern echo server");
    }

    fn on_text(&self, sender: &WebSocketSender, text: String) {
        sender.send_text(format!("Echo: {text}"));
    }

    fn on_binary(&self, sender: &WebSocketSender, data: Vec<u8>) {
        sender.send_binary(data);
    }

    fn on_close(&self, code: u16, reason: &str) {
        tracing::debug!(code, reason, "echo client left");
    }
}

fn setup_routes(app: &mut App, stats: Arc<ServerStats>) {
    app.get("/hello", |_| Ok(Response::ok("Hello, World!")));

    app.get("/api/status", move |_| Ok(Response::json(stats.to_json(), StatusCode::Ok)));

    app.get("/greet", |req: &Request| {
        let name = req.query_param("name").unwrap_or("Anonymous");
        Ok(Response::ok(format!("Hello, {name}!")))
    });

    app.post("/api/data", |req: &Request| {
        if req.body.is_empty() {
            return Ok(Response::bad_request("Request body is required"));
        }
        let echo = serde_json::json!({
            "received": String::from_utf8_lossy(&req.body),
            "content_type": req.content_type(),
            "content_length": req.content_length(),
        });
        Ok(Response::json(echo.to_string(), StatusCode::Ok))
    });

    app.get("/user/*", |req: &Request| {
        let id = req.path.rsplit('/').next().unwrap_or_default();
        if id.is_empty() {
            return Ok(Response::bad_request("Invalid user ID"));
        }
        let user = serde_json::json!({
            "id": id,
            "name": format!("User {id}"),
            "email": format!("{id}@example.com"),
        });
        Ok(Response::json(user.to_string(), StatusCode::Ok))
    });

    app.get("/large", |_| {
        let mut body = String::from("This is a large response for exercising compression. ");
        for _ in 0..100 {
            body.push_str("Lorem ipsum dolor sit amet, consectetur adipiscing elit. ");
        }
        Ok(Response::ok(body))
    });

    app.websocket("/ws", Echo);
}

fn setup_middleware(app: &mut App, registry: &RateLimitRegistry, config: &Config) {
    app.use_middleware(|req, res| {
        if req.method == Method::OPTIONS {
            res.set_cors_headers("*");
            return false;
        }
        res.set_cors_headers("*");
        true
    });

    if config.rate_limit.enabled {
        let limiter = registry.global(config.rate_limit.clone());
        app.use_middleware(limiter.middleware());
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = Config::load()?;
    tracing::debug!("effective configuration:\n{}", cfg.to_yaml()?);

    if cfg.static_files.enabled {
        if let Err(e) = std::fs::create_dir_all(&cfg.static_files.document_root) {
            tracing::warn!(error = %e, "could not create document root");
        }
    }

    let stats = Arc::new(ServerStats::new());
    let registry = RateLimitRegistry::from_config(&cfg.rate_limit);

    let mut app = App::from_config(&cfg);
    setup_middleware(&mut app, &registry, &cfg);
    setup_routes(&mut app, Arc::clone(&stats));

    let server = Server::new(cfg, Arc::new(app)).with_stats(stats);
    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}
