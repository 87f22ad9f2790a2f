//! Apache-style access logging middleware for actix-web.
//! This middleware is inspired by the classic web-server access loggers:
//! it emits exactly one formatted line per request, written once the
//! response has fully completed, without altering the response itself.
//!
//! # Examples
//! ## Default combined log format
//! ```rust
//! use actix_web::{App, web};
//! use actix_web_middleware_accesslog::AccessLog;
//!
//! let app = App::new()
//!     .wrap(AccessLog::default())
//!     .route("/", web::get().to(|| async { "Hello world!" }));
//! ```
//! Produces lines like:
//! ```text
//! 127.0.0.1 - - [05/Feb/2024:17:11:55 +0000] "GET / HTTP/1.1" 200 140 "-" "curl/8.4.0"
//! ```
//!
//! ## Format templates
//! Templates mix literal text with directives from two dialects,
//! selected per directive by its leading character:
//! ```rust
//! use actix_web::App;
//! use actix_web_middleware_accesslog::AccessLog;
//!
//! let app = App::new()
//!     .wrap(AccessLog::new(":method :url :status - :response-time ms"));
//! ```
//!
//! Colon tokens:
//!
//! - `:url` - original request target, including the query string
//! - `:method` - HTTP method (GET, POST, etc.)
//! - `:status` - response status code
//! - `:response-time` - elapsed milliseconds until the response completed
//! - `:date` - current time as an HTTP-date
//! - `:referrer` - `Referer` request header (`Referrer` also accepted)
//! - `:http-version` - protocol version, e.g. `1.1`
//! - `:remote-addr` - peer address
//! - `:user-agent` - `User-Agent` request header
//! - `:req[Name]` - any request header, name matched case-insensitively
//! - `:res[Name]` - any response header
//!
//! Percent directives (Apache-compatible; missing values render as `-`):
//!
//! - `%h` remote address, `%l` always `-`, `%u` authenticated user
//! - `%t` common-log-format timestamp, `%r` request line
//! - `%>s` status, `%b` `Content-Length` response header
//! - `%{Referer}i`, `%{User-agent}i` request headers
//!
//! Colon tokens render missing values as empty text while percent
//! directives render them as `-`; the two dialects intentionally keep
//! their historical behavior.
//!
//! ## Computed lines
//! A callback can build the line itself, suppress it by returning
//! `None`, and delegate substitution back to [`render`]:
//! ```rust
//! use actix_web::App;
//! use actix_web_middleware_accesslog::{AccessLog, render};
//!
//! let slow_requests = AccessLog::custom(|record| {
//!     let slow = record
//!         .response_time
//!         .is_some_and(|d| d.whole_milliseconds() > 500);
//!     slow.then(|| render(":method :url took :response-time ms", record))
//! });
//! let app = App::new().wrap(slow_requests);
//! ```
//!
//! ## Output and buffering
//! Lines go to standard output by default; `stream` redirects them to
//! any `io::Write`, and `buffered`/`buffer_every` coalesce lines in
//! memory so the underlying stream sees one write per flush interval:
//! ```rust
//! use std::time::Duration;
//! use actix_web::App;
//! use actix_web_middleware_accesslog::AccessLog;
//!
//! let app = App::new().wrap(
//!     AccessLog::default().buffer_every(Duration::from_millis(250)),
//! );
//! ```
//! Buffered lines flush in the order their responses completed, which
//! under concurrent requests is not necessarily arrival order. Lines
//! still pending at process exit are lost; buffering is a best-effort
//! trade of latency for fewer write syscalls.
//!
//! # Features
//! - Combined log format out of the box
//! - Dual-dialect format templates (colon tokens and percent directives)
//! - Computed lines with per-request suppression
//! - Exactly-once emission, tolerant of the middleware being mounted twice
//! - Pattern-based path exclusion
//! - Optional interval-flushed output buffering

mod format;
mod logger;
mod sink;

pub use crate::format::{LogRecord, render, tokenize};
pub use crate::logger::{AccessLog, RemoteUser};
