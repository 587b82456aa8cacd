//! HTTP endpoint for session statistics.
//!
//! Serves `GET /stats` as JSON from a background thread using `tiny_http`.
//! `/` redirects to `/stats`; anything else is a 404.

use super::SessionStats;
use log::{error, info, warn};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tiny_http::{Header, Method, Request, Response, Server};

/// Default port for the stats server.
pub const DEFAULT_STATS_PORT: u16 = 8080;

/// How often the server thread checks for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Background HTTP server for [`SessionStats`]. Dropping it stops the thread.
pub struct StatsServer {
    addr: Option<SocketAddr>,
    handle: Option<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl StatsServer {
    /// Bind to `bind_addr` (all interfaces if `None`) on `port` and start serving.
    ///
    /// Port 0 picks a free port; see [`StatsServer::local_addr`].
    pub fn start(
        bind_addr: Option<IpAddr>,
        port: u16,
        stats: Arc<SessionStats>,
    ) -> Result<Self, std::io::Error> {
        let addr = match bind_addr {
            Some(ip) => format!("{}:{}", ip, port),
            None => format!("0.0.0.0:{}", port),
        };
        let server = Server::http(&addr)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::AddrInUse, e.to_string()))?;
        let local = server.server_addr().to_ip();
        info!(
            "[stats] Listening on http://{}/stats",
            local.map(|a| a.to_string()).unwrap_or(addr)
        );

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let handle = thread::Builder::new()
            .name("stats-server".into())
            .spawn(move || run_server(server, stats, flag))?;

        Ok(Self {
            addr: local,
            handle: Some(handle),
            shutdown,
        })
    }

    /// The address actually bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// Stop the server. Takes up to one poll interval.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StatsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn header(name: &str, value: &str) -> Option<Header> {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).ok()
}

fn respond(request: Request, response: Response<std::io::Cursor<Vec<u8>>>) {
    if let Err(e) = request.respond(response) {
        warn!("[stats] Failed to send response: {}", e);
    }
}

fn run_server(server: Server, stats: Arc<SessionStats>, shutdown: Arc<AtomicBool>) {
    let content_type = header("Content-Type", "application/json");
    let location = header("Location", "/stats");
    let allow_get = header("Allow", "GET");

    while !shutdown.load(Ordering::Acquire) {
        let request = match server.recv_timeout(POLL_INTERVAL) {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(e) => {
                error!("[stats] Server error: {}", e);
                break;
            }
        };

        if request.method() != &Method::Get {
            let mut response = Response::from_string("Method Not Allowed").with_status_code(405);
            if let Some(h) = allow_get.clone() {
                response.add_header(h);
            }
            respond(request, response);
            continue;
        }

        match request.url() {
            "/stats" | "/stats/" => {
                let mut response = Response::from_string(stats.to_json()).with_status_code(200);
                if let Some(h) = content_type.clone() {
                    response.add_header(h);
                }
                respond(request, response);
            }
            "/" => {
                let mut response =
                    Response::from_string("See /stats for session statistics").with_status_code(302);
                if let Some(h) = location.clone() {
                    response.add_header(h);
                }
                respond(request, response);
            }
            _ => respond(request, Response::from_string("Not Found").with_status_code(404)),
        }
    }
    info!("[stats] Server stopped");
}
