use std::rc::Rc;
use std::sync::OnceLock;

use regex::Regex;
use time::{
    Duration, OffsetDateTime, format_description::BorrowedFormatItem, macros::format_description,
};

use actix_web::http::header::HeaderMap;
use actix_web::http::{Method, StatusCode, Version};

/// Common-log-format timestamp, rendered inside `[...]`.
/// Example: `10/Oct/2000:13:55:36 +0000`.
static CLF_TIME: &[BorrowedFormatItem<'static>] = format_description!(
    "[day]/[month repr:short]/[year]:[hour]:[minute]:[second] [offset_hour sign:mandatory][offset_minute]"
);

/// HTTP-date as used by the `:date` token.
/// Example: `Tue, 15 Nov 1994 08:12:31 GMT`.
static HTTP_DATE: &[BorrowedFormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

/// Everything the renderers can observe about one request/response cycle.
///
/// The middleware fills this in three phases: request fields at install
/// time, `status` and `response_headers` when the service resolves, and
/// `response_time` once the response body has fully streamed. Custom
/// format callbacks receive a reference to the finished record.
pub struct LogRecord {
    /// Peer address as reported by the connection, if known.
    pub remote_addr: Option<String>,
    /// Authenticated username, if the host inserted a [`RemoteUser`]
    /// extension during handling.
    ///
    /// [`RemoteUser`]: crate::RemoteUser
    pub remote_user: Option<String>,
    pub method: Method,
    /// Original request target: path plus query string.
    pub uri: String,
    pub version: Version,
    pub request_headers: HeaderMap,
    /// Wall-clock time the request entered the middleware.
    pub start: OffsetDateTime,
    /// Status code, absent until the response head exists.
    pub status: Option<StatusCode>,
    /// Response headers snapshotted when the service resolved.
    pub response_headers: HeaderMap,
    /// Elapsed time from `start` to response completion.
    pub response_time: Option<Duration>,
}

/// Log line selection, fixed at middleware construction.
pub(crate) enum Format {
    /// Combined log format, synthesized without the tokenizer.
    Default,
    /// Token template, dialect chosen per segment.
    Template(String),
    /// Computed line; `None` suppresses the line entirely.
    Custom(Rc<FormatFn>),
}

pub(crate) type FormatFn = dyn Fn(&LogRecord) -> Option<String>;

impl Format {
    pub(crate) fn render_line(&self, record: &LogRecord) -> Option<String> {
        match self {
            Format::Default => Some(combined_log_line(record)),
            Format::Template(template) => Some(render(template, record)),
            Format::Custom(f) => f(record),
        }
    }
}

/// Splits a format template into segments at directive sentinels.
///
/// The first segment starts at index 0; every further segment starts at
/// the next `:` or `%` found strictly after the start of the previous
/// one, whichever comes first. Concatenating the segments reproduces the
/// input exactly, so unrecognized text survives rendering verbatim.
pub fn tokenize(template: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut start = 0;
    while let Some(next) = next_sentinel(template, start) {
        segments.push(&template[start..next]);
        start = next;
    }
    segments.push(&template[start..]);
    segments
}

/// Position of the first sentinel strictly after `start`. Sentinels are
/// ASCII, so byte positions are always char boundaries.
fn next_sentinel(template: &str, start: usize) -> Option<usize> {
    template
        .as_bytes()
        .iter()
        .enumerate()
        .skip(start + 1)
        .find(|(_, b)| **b == b':' || **b == b'%')
        .map(|(i, _)| i)
}

/// Renders a template against a record, selecting the dialect of each
/// segment by its leading sentinel. Custom format callbacks can call
/// this for partial substitution.
pub fn render(template: &str, record: &LogRecord) -> String {
    tokenize(template)
        .into_iter()
        .map(|segment| match segment.as_bytes().first() {
            Some(b':') => render_colon(segment, record),
            Some(b'%') => render_percent(segment, record),
            _ => segment.to_owned(),
        })
        .collect()
}

fn req_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r":req\[([^\]]+)\]").unwrap())
}

fn res_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r":res\[([^\]]+)\]").unwrap())
}

/// Colon dialect. Missing values render as the empty string; this is
/// deliberately not the percent dialect's `-` policy.
fn render_colon(segment: &str, record: &LogRecord) -> String {
    let out = segment
        .replace(":url", &record.uri)
        .replace(":method", record.method.as_str())
        .replace(":status", &status_str(record).unwrap_or_default())
        .replace(
            ":response-time",
            &record
                .response_time
                .map(|d| d.whole_milliseconds().to_string())
                .unwrap_or_default(),
        )
        .replace(":date", &http_date(OffsetDateTime::now_utc()))
        .replace(
            ":referrer",
            &referer(&record.request_headers).unwrap_or_default(),
        )
        .replace(":http-version", http_version(record.version))
        .replace(
            ":remote-addr",
            record.remote_addr.as_deref().unwrap_or_default(),
        )
        .replace(
            ":user-agent",
            &header(&record.request_headers, "user-agent").unwrap_or_default(),
        );
    let out = req_header_re().replace_all(&out, |caps: &regex::Captures<'_>| {
        header(&record.request_headers, &caps[1]).unwrap_or_default()
    });
    res_header_re()
        .replace_all(&out, |caps: &regex::Captures<'_>| {
            header(&record.response_headers, &caps[1]).unwrap_or_default()
        })
        .into_owned()
}

/// Percent dialect, Apache-compatible. Every value is normalized to `-`
/// when missing or empty.
fn render_percent(segment: &str, record: &LogRecord) -> String {
    segment
        .replace("%h", &or_dash(record.remote_addr.clone()))
        .replace("%l", "-")
        .replace("%u", &or_dash(record.remote_user.clone()))
        .replace(
            "%t",
            &format!("[{}]", clf_time(OffsetDateTime::now_utc())),
        )
        .replace("%r", &request_line(record))
        .replace("%>s", &or_dash(status_str(record)))
        .replace(
            "%b",
            &or_dash(header(&record.response_headers, "content-length")),
        )
        .replace(
            "%{Referer}i",
            &or_dash(referer(&record.request_headers)),
        )
        .replace(
            "%{User-agent}i",
            &or_dash(header(&record.request_headers, "user-agent")),
        )
}

/// The fixed combined-log-format line used when no format is configured.
pub(crate) fn combined_log_line(record: &LogRecord) -> String {
    format!(
        "{} - {} [{}] \"{}\" {} {} \"{}\" \"{}\"",
        or_dash(record.remote_addr.clone()),
        or_dash(record.remote_user.clone()),
        clf_time(OffsetDateTime::now_utc()),
        request_line(record),
        or_dash(status_str(record)),
        or_dash(header(&record.response_headers, "content-length")),
        or_dash(referer(&record.request_headers)),
        or_dash(header(&record.request_headers, "user-agent")),
    )
}

/// Substitutes `-` for values that are absent or empty.
fn or_dash(value: Option<String>) -> String {
    match value {
        Some(v) if !v.is_empty() => v,
        _ => "-".to_owned(),
    }
}

/// Header lookup by name. `HeaderMap` lowercases names on lookup, so
/// `Accept`, `accept` and `ACCEPT` all resolve the same entry. Values
/// that are not valid UTF-8 count as absent.
fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned)
}

fn referer(headers: &HeaderMap) -> Option<String> {
    header(headers, "referer").or_else(|| header(headers, "referrer"))
}

fn status_str(record: &LogRecord) -> Option<String> {
    record.status.map(|s| s.as_u16().to_string())
}

fn request_line(record: &LogRecord) -> String {
    format!(
        "{} {} HTTP/{}",
        record.method,
        record.uri,
        http_version(record.version)
    )
}

fn http_version(version: Version) -> &'static str {
    match version {
        actix_http::Version::HTTP_09 => "0.9",
        actix_http::Version::HTTP_10 => "1.0",
        actix_http::Version::HTTP_11 => "1.1",
        actix_http::Version::HTTP_2 => "2.0",
        actix_http::Version::HTTP_3 => "3.0",
        _ => "unknown",
    }
}

fn clf_time(t: OffsetDateTime) -> String {
    t.format(&CLF_TIME).unwrap_or_default()
}

fn http_date(t: OffsetDateTime) -> String {
    t.format(&HTTP_DATE).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::header::{HeaderName, HeaderValue};

    fn record() -> LogRecord {
        let mut request_headers = HeaderMap::new();
        request_headers.insert(
            HeaderName::from_static("user-agent"),
            HeaderValue::from_static("curl/8"),
        );
        request_headers.insert(
            HeaderName::from_static("referer"),
            HeaderValue::from_static("http://example.com/"),
        );
        request_headers.insert(
            HeaderName::from_static("accept"),
            HeaderValue::from_static("text/html"),
        );

        let mut response_headers = HeaderMap::new();
        response_headers.insert(
            HeaderName::from_static("content-length"),
            HeaderValue::from_static("512"),
        );
        response_headers.insert(
            HeaderName::from_static("content-type"),
            HeaderValue::from_static("text/plain"),
        );

        LogRecord {
            remote_addr: Some("192.0.2.1".to_owned()),
            remote_user: None,
            method: Method::GET,
            uri: "/x".to_owned(),
            version: Version::HTTP_11,
            request_headers,
            start: OffsetDateTime::now_utc(),
            status: Some(StatusCode::OK),
            response_headers,
            response_time: Some(Duration::milliseconds(42)),
        }
    }

    #[test]
    fn tokenize_round_trips() {
        for template in [
            "",
            "plain text",
            ":method :url :status",
            ":a%b:c",
            ":a%",
            "%",
            "préfix :req[Accept] suffix",
            "%h %l %u %t \"%r\" %>s %b",
        ] {
            assert_eq!(tokenize(template).concat(), template);
        }
    }

    #[test]
    fn tokenize_empty_is_one_empty_segment() {
        assert_eq!(tokenize(""), vec![""]);
    }

    #[test]
    fn tokenize_splits_adjacent_directives() {
        assert_eq!(tokenize(":a%b:c"), vec![":a", "%b", ":c"]);
    }

    #[test]
    fn tokenize_handles_trailing_sentinel() {
        assert_eq!(tokenize(":a%"), vec![":a", "%"]);
        assert_eq!(tokenize("x:"), vec!["x", ":"]);
    }

    #[test]
    fn tokenize_no_sentinel_is_single_literal() {
        assert_eq!(tokenize("hello world"), vec!["hello world"]);
    }

    #[test]
    fn colon_substitutes_basic_tokens() {
        let rec = record();
        assert_eq!(render(":method :url :status", &rec), "GET /x 200");
    }

    #[test]
    fn colon_response_time_is_whole_millis() {
        let rec = record();
        assert_eq!(render(":response-timems", &rec), "42ms");
    }

    #[test]
    fn colon_http_version_and_remote_addr() {
        let rec = record();
        assert_eq!(
            render("HTTP/:http-version from :remote-addr", &rec),
            "HTTP/1.1 from 192.0.2.1"
        );
    }

    #[test]
    fn colon_missing_values_render_empty() {
        let mut rec = record();
        rec.remote_addr = None;
        rec.status = None;
        rec.response_time = None;
        assert_eq!(render("[:remote-addr][:status][:response-time]", &rec), "[][][]");
    }

    #[test]
    fn colon_header_lookup_is_case_insensitive() {
        let rec = record();
        assert_eq!(render(":req[Accept]", &rec), "text/html");
        assert_eq!(render(":req[accept]", &rec), "text/html");
        assert_eq!(render(":req[ACCEPT]", &rec), "text/html");
    }

    #[test]
    fn colon_response_header_lookup() {
        let rec = record();
        assert_eq!(render(":res[Content-Type]", &rec), "text/plain");
        assert_eq!(render(":res[x-missing]", &rec), "");
    }

    #[test]
    fn colon_date_is_http_date() {
        let rec = record();
        let re = Regex::new(r"^\w{3}, \d{2} \w{3} \d{4} \d{2}:\d{2}:\d{2} GMT$").unwrap();
        assert!(re.is_match(&render(":date", &rec)));
    }

    #[test]
    fn unrecognized_directives_pass_through() {
        let rec = record();
        assert_eq!(render(":nope and %z", &rec), ":nope and %z");
    }

    #[test]
    fn percent_missing_user_is_dash() {
        let rec = record();
        assert_eq!(render("%u", &rec), "-");
    }

    #[test]
    fn percent_present_user() {
        let mut rec = record();
        rec.remote_user = Some("alice".to_owned());
        assert_eq!(render("%u", &rec), "alice");
    }

    #[test]
    fn percent_request_line_and_status() {
        let rec = record();
        assert_eq!(render("\"%r\" %>s %b", &rec), "\"GET /x HTTP/1.1\" 200 512");
    }

    #[test]
    fn percent_missing_content_length_is_dash() {
        let mut rec = record();
        rec.response_headers = HeaderMap::new();
        assert_eq!(render("%b", &rec), "-");
    }

    #[test]
    fn percent_bracketed_request_headers() {
        let rec = record();
        assert_eq!(
            render("\"%{Referer}i\" \"%{User-agent}i\"", &rec),
            "\"http://example.com/\" \"curl/8\""
        );
    }

    #[test]
    fn percent_timestamp_is_bracketed_clf() {
        let rec = record();
        let re = Regex::new(r"^\[\d{2}/\w{3}/\d{4}:\d{2}:\d{2}:\d{2} \+0000\]$").unwrap();
        assert!(re.is_match(&render("%t", &rec)));
    }

    #[test]
    fn fallback_is_combined_log_format() {
        let rec = record();
        let line = combined_log_line(&rec);
        let re = Regex::new(
            r#"^192\.0\.2\.1 - - \[\d{2}/\w{3}/\d{4}:\d{2}:\d{2}:\d{2} \+0000\] "GET /x HTTP/1\.1" 200 512 "http://example\.com/" "curl/8"$"#,
        )
        .unwrap();
        assert!(re.is_match(&line), "unexpected line: {line}");
    }

    #[test]
    fn fallback_normalizes_missing_fields() {
        let mut rec = record();
        rec.remote_addr = None;
        rec.remote_user = None;
        rec.status = None;
        rec.request_headers = HeaderMap::new();
        rec.response_headers = HeaderMap::new();
        let line = combined_log_line(&rec);
        let re = Regex::new(
            r#"^- - - \[[^\]]+\] "GET /x HTTP/1\.1" - - "-" "-"$"#,
        )
        .unwrap();
        assert!(re.is_match(&line), "unexpected line: {line}");
    }

    #[test]
    fn custom_format_can_suppress_and_delegate() {
        let rec = record();
        let fmt = Format::Custom(Rc::new(|r: &LogRecord| {
            if r.status == Some(StatusCode::OK) {
                None
            } else {
                Some(render(":method :url", r))
            }
        }));
        assert!(fmt.render_line(&rec).is_none());

        let mut rec = record();
        rec.status = Some(StatusCode::NOT_FOUND);
        assert_eq!(fmt.render_line(&rec), Some("GET /x".to_owned()));
    }
}
