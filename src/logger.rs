use std::{
    cell::{OnceCell, RefCell},
    collections::HashSet,
    future::Future,
    io,
    marker::PhantomData,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use futures_core::ready;
use pin_project_lite::pin_project;
use regex::Regex;
use time::OffsetDateTime;

use actix_service::{Service, Transform};
use actix_utils::future::{Ready, ready};
use actix_web::HttpMessage;
use actix_web::body::{BodySize, MessageBody};
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::http::header::HeaderMap;
use actix_web::{Error, Result};

use crate::format::{Format, LogRecord};
use crate::sink::{DEFAULT_FLUSH_INTERVAL, Sink, SharedWriter};

/// Middleware that writes one access-log line per request once the
/// response has fully completed.
///
/// The line layout comes from a format template (colon tokens or
/// Apache-style percent directives), a custom callback, or the combined
/// log format when nothing is configured.
///
/// # Examples
/// ```rust
/// use actix_web::App;
/// use actix_web_middleware_accesslog::AccessLog;
///
/// let app = App::new()
///     .wrap(AccessLog::new(":method :url :status - :response-time ms"));
/// ```
pub struct AccessLog(Rc<Inner>);

struct Inner {
    format: Format,
    exclude: HashSet<String>,
    exclude_regex: Vec<Regex>,
    buffer: Option<Duration>,
    stream: RefCell<Option<Box<dyn io::Write>>>,
    sink: OnceCell<Sink>,
}

impl Inner {
    /// Built on first use so that a buffered sink spawns its flush task
    /// inside the worker runtime, not at configuration time.
    fn sink(&self) -> &Sink {
        self.sink.get_or_init(|| {
            let writer = self
                .stream
                .borrow_mut()
                .take()
                .unwrap_or_else(|| Box::new(io::stdout()) as Box<dyn io::Write>);
            let writer: SharedWriter = Rc::new(RefCell::new(writer));
            match self.buffer {
                Some(every) => Sink::buffered(writer, every),
                None => Sink::direct(writer),
            }
        })
    }
}

/// Request-extension marker preventing a second mounted instance from
/// logging the same request again.
struct LogGuard;

/// Authenticated username for the `%u` directive and the fallback line.
///
/// Auth layers or handlers insert it into the request extensions; it is
/// read when the response resolves, so anything that runs during
/// handling is observed.
///
/// ```rust
/// use actix_web::{HttpMessage, HttpRequest};
/// use actix_web_middleware_accesslog::RemoteUser;
///
/// fn on_authenticated(req: &HttpRequest, login: &str) {
///     req.extensions_mut().insert(RemoteUser(login.to_owned()));
/// }
/// ```
#[derive(Clone, Debug)]
pub struct RemoteUser(pub String);

impl AccessLog {
    /// Create `AccessLog` middleware with a format template.
    ///
    /// Colon tokens: `:url`, `:method`, `:status`, `:response-time`,
    /// `:date`, `:referrer`, `:http-version`, `:remote-addr`,
    /// `:user-agent`, `:req[Name]`, `:res[Name]`.
    ///
    /// Percent directives: `%h`, `%l`, `%u`, `%t`, `%r`, `%>s`, `%b`,
    /// `%{Referer}i`, `%{User-agent}i`.
    pub fn new(template: impl Into<String>) -> AccessLog {
        AccessLog::with_format(Format::Template(template.into()))
    }

    /// Create `AccessLog` middleware that computes each line itself.
    /// Returning `None` suppresses the line. The callback can delegate
    /// parts of the work to [`render`](crate::render).
    pub fn custom<F>(f: F) -> AccessLog
    where
        F: Fn(&LogRecord) -> Option<String> + 'static,
    {
        AccessLog::with_format(Format::Custom(Rc::new(f)))
    }

    fn with_format(format: Format) -> AccessLog {
        AccessLog(Rc::new(Inner {
            format,
            exclude: HashSet::new(),
            exclude_regex: Vec::new(),
            buffer: None,
            stream: RefCell::new(None),
            sink: OnceCell::new(),
        }))
    }

    /// Ignore and do not log access info for specified path.
    pub fn exclude<T: Into<String>>(mut self, path: T) -> Self {
        Rc::get_mut(&mut self.0)
            .unwrap()
            .exclude
            .insert(path.into());
        self
    }

    /// Ignore and do not log access info for paths that match regex.
    pub fn exclude_regex<T: Into<String>>(mut self, path: T) -> Self {
        let inner = Rc::get_mut(&mut self.0).unwrap();
        inner.exclude_regex.push(Regex::new(&path.into()).unwrap());
        self
    }

    /// Write log lines to `writer` instead of standard output.
    pub fn stream<W: io::Write + 'static>(mut self, writer: W) -> Self {
        *Rc::get_mut(&mut self.0).unwrap().stream.get_mut() = Some(Box::new(writer));
        self
    }

    /// Buffer log lines in memory and flush them once per second.
    pub fn buffered(self) -> Self {
        self.buffer_every(DEFAULT_FLUSH_INTERVAL)
    }

    /// Buffer log lines in memory and flush them every `every`.
    pub fn buffer_every(mut self, every: Duration) -> Self {
        Rc::get_mut(&mut self.0).unwrap().buffer = Some(every);
        self
    }
}

impl Default for AccessLog {
    /// Create `AccessLog` middleware emitting the combined log format:
    ///
    /// `addr - user [time] "request" status content-length "referer" "user-agent"`
    fn default() -> Self {
        AccessLog::with_format(Format::Default)
    }
}

impl<S, B> Transform<S, ServiceRequest> for AccessLog
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    B: MessageBody,
{
    type Response = ServiceResponse<StreamLog<B>>;
    type Error = Error;
    type Transform = AccessLogMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AccessLogMiddlewareService {
            service,
            inner: Rc::clone(&self.0),
        }))
    }
}

/// Logger middleware service.
pub struct AccessLogMiddlewareService<S> {
    inner: Rc<Inner>,
    service: S,
}

impl<S, B> Service<ServiceRequest> for AccessLogMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    B: MessageBody,
{
    type Response = ServiceResponse<StreamLog<B>>;
    type Error = Error;
    type Future = AccessLogResponse<S, B>;

    actix_service::forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let skipped = self.inner.exclude.contains(req.path())
            || self
                .inner
                .exclude_regex
                .iter()
                .any(|r| r.is_match(req.path()))
            || req.extensions().get::<LogGuard>().is_some();

        if skipped {
            AccessLogResponse {
                fut: self.service.call(req),
                record: None,
                inner: None,
                _phantom: PhantomData,
            }
        } else {
            req.extensions_mut().insert(LogGuard);
            self.inner.sink();
            let record = begin_record(&req);

            AccessLogResponse {
                fut: self.service.call(req),
                record: Some(record),
                inner: Some(Rc::clone(&self.inner)),
                _phantom: PhantomData,
            }
        }
    }
}

/// Request-phase snapshot; response fields are filled in later.
fn begin_record(req: &ServiceRequest) -> LogRecord {
    LogRecord {
        remote_addr: req
            .connection_info()
            .peer_addr()
            .map(|addr| addr.to_string()),
        remote_user: None,
        method: req.method().clone(),
        uri: req
            .uri()
            .path_and_query()
            .map_or_else(|| req.path().to_owned(), |pq| pq.as_str().to_owned()),
        version: req.version(),
        request_headers: req.headers().clone(),
        start: OffsetDateTime::now_utc(),
        status: None,
        response_headers: HeaderMap::new(),
        response_time: None,
    }
}

pin_project! {
    pub struct AccessLogResponse<S, B>
    where
        B: MessageBody,
        S: Service<ServiceRequest>,
    {
        #[pin]
        fut: S::Future,
        record: Option<LogRecord>,
        inner: Option<Rc<Inner>>,
        _phantom: PhantomData<B>,
    }
}

impl<S, B> Future for AccessLogResponse<S, B>
where
    B: MessageBody,
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
{
    type Output = Result<ServiceResponse<StreamLog<B>>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        let res = match ready!(this.fut.poll(cx)) {
            Ok(res) => res,
            Err(err) => return Poll::Ready(Err(err)),
        };

        if let Some(error) = res.response().error() {
            log::debug!("Error in response: {:?}", error);
        }

        if let Some(record) = this.record.as_mut() {
            record.status = Some(res.status());
            record.response_headers = res.headers().clone();
            record.remote_user = res
                .request()
                .extensions()
                .get::<RemoteUser>()
                .map(|user| user.0.clone());
        }

        let record = this.record.take();
        let inner = this.inner.take();

        Poll::Ready(Ok(res.map_body(move |_, body| StreamLog {
            body,
            record,
            inner,
        })))
    }
}

pin_project! {
    /// Passthrough body wrapper; the log line is emitted when the body
    /// is dropped, i.e. when the response has actually completed. The
    /// `Option::take` makes emission exactly-once per request.
    pub struct StreamLog<B> {
        #[pin]
        body: B,
        record: Option<LogRecord>,
        inner: Option<Rc<Inner>>,
    }

    impl<B> PinnedDrop for StreamLog<B> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if let (Some(inner), Some(mut record)) = (this.inner.take(), this.record.take()) {
                record.response_time = Some(OffsetDateTime::now_utc() - record.start);
                if let Some(mut line) = inner.format.render_line(&record) {
                    line.push('\n');
                    inner.sink().write(line);
                }
            }
        }
    }
}

impl<B: MessageBody> MessageBody for StreamLog<B> {
    type Error = B::Error;

    #[inline]
    fn size(&self) -> BodySize {
        self.body.size()
    }

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Bytes, Self::Error>>> {
        self.project().body.poll_next(cx)
    }
}
