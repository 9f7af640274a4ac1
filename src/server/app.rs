//! The application service: middleware, routes, WebSocket endpoints,
//! static files and response compression.

use std::sync::Arc;

use crate::config::{CompressionConfig, Config};
use crate::http::request::{Method, Request};
use crate::http::response::{Response, StatusCode};
use crate::http::service::Service;
use crate::server::router::{Router, path_matches};
use crate::server::static_files::StaticFiles;
use crate::websocket::WebSocketHandler;

/// Runs before routing. Returning false stops the chain and sends the
/// response the middleware left behind.
pub type Middleware = Arc<dyn Fn(&Request, &mut Response) -> bool + Send + Sync>;

#[derive(Default)]
pub struct App {
    router: Router,
    middleware: Vec<Middleware>,
    websocket_routes: Vec<(String, Arc<dyn WebSocketHandler>)>,
    static_files: Option<StaticFiles>,
    compression: Option<CompressionConfig>,
}

impl App {
    pub fn new() -> Self {
        Self::default()
    }

    /// An app with static files and compression set up as configured.
    pub fn from_config(config: &Config) -> Self {
        let mut app = Self::new();
        if config.static_files.enabled {
            app.static_files = Some(StaticFiles::from_config(&config.static_files));
        }
        if config.compression.enabled {
            app.compression = Some(config.compression.clone());
        }
        app
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn router_mut(&mut self) -> &mut Router {
        &mut self.router
    }

    pub fn route<F>(&mut self, method: Method, pattern: &str, handler: F) -> &mut Self
    where
        F: Fn(&Request) -> anyhow::Result<Response> + Send + Sync + 'static,
    {
        self.router.route(method, pattern, handler);
        self
    }

    pub fn get<F>(&mut self, pattern: &str, handler: F) -> &mut Self
    where
        F: Fn(&Request) -> anyhow::Result<Response> + Send + Sync + 'static,
    {
        self.route(Method::GET, pattern, handler)
    }

    pub fn post<F>(&mut self, pattern: &str, handler: F) -> &mut Self
    where
        F: Fn(&Request) -> anyhow::Result<Response> + Send + Sync + 'static,
    {
        self.route(Method::POST, pattern, handler)
    }

    pub fn use_middleware<F>(&mut self, middleware: F) -> &mut Self
    where
        F: Fn(&Request, &mut Response) -> bool + Send + Sync + 'static,
    {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Registers a WebSocket endpoint. Patterns follow the router's rules.
    pub fn websocket(&mut self, pattern: &str, handler: impl WebSocketHandler) -> &mut Self {
        self.websocket_routes
            .push((pattern.to_string(), Arc::new(handler)));
        self
    }

    pub fn static_files(&mut self, files: StaticFiles) -> &mut Self {
        self.static_files = Some(files);
        self
    }

    pub fn compression(&mut self, config: CompressionConfig) -> &mut Self {
        self.compression = Some(config);
        self
    }

    pub fn handle(&self, request: &Request) -> anyhow::Result<Response> {
        let mut preflight = Response::new(StatusCode::Ok);
        for middleware in &self.middleware {
            if !middleware(request, &mut preflight) {
                return Ok(preflight);
            }
        }

        let mut response = self.dispatch(request)?;

        // Headers a middleware added survive unless the handler set them.
        for (name, value) in preflight.headers() {
            if name != "Content-Length" && !response.has_header(name) {
                response.set_header(name, value.clone());
            }
        }

        if let Some(compression) = &self.compression {
            if let Some(accept) = request.header("accept-encoding") {
                response.compress_body_with(accept, compression.min_size, compression.level);
            }
        }
        Ok(response)
    }

    fn dispatch(&self, request: &Request) -> anyhow::Result<Response> {
        let handler = self.router.find(request.method, &request.path).or_else(|| {
            (request.method == Method::HEAD)
                .then(|| self.router.find(Method::GET, &request.path))
                .flatten()
        });
        if let Some(handler) = handler {
            return handler(request);
        }

        if let Some(response) = self.static_files.as_ref().and_then(|files| files.serve(request)) {
            return Ok(response);
        }
        Ok(Response::error_page(StatusCode::NotFound, "Resource not found"))
    }
}

impl Service for App {
    fn call(&self, request: &Request) -> anyhow::Result<Response> {
        self.handle(request)
    }

    fn websocket_handler(&self, request: &Request) -> Option<Arc<dyn WebSocketHandler>> {
        self.websocket_routes
            .iter()
            .find(|(pattern, _)| path_matches(pattern, &request.path))
            .map(|(_, handler)| Arc::clone(handler))
    }
}
