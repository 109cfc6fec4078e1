use std::fmt;
use std::sync::{Arc, RwLock};

use super::{HeaderName, Method, Request};
use crate::handler::Handler;

/// One element of a route path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    /// `*` in the middle of a path: exactly one segment.
    WildcardOne,
    /// A trailing `*`: zero or more remaining segments.
    WildcardRest,
    /// `:name`: binds the segment value to `name`.
    Capture(String),
}

/// A query or header value predicate; `*` matches any value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    Any,
    Exact(String),
}

impl Pattern {
    fn parse(value: &str) -> Pattern {
        if value == "*" {
            Pattern::Any
        } else {
            Pattern::Exact(value.to_owned())
        }
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Exact(expected) => expected == value,
        }
    }
}

/// A predicate over requests: method, path shape, query items, headers
/// and an optional body check.
///
/// Parsed from a compact form: `"GET /hello/:name?time=*"`. A leading
/// method of `*` (or none) matches any method; a trailing `*` path
/// segment matches the rest of the path.
#[derive(Clone)]
pub struct Route {
    method: Option<Method>,
    segments: Vec<Segment>,
    query: Vec<(String, Pattern)>,
    headers: Vec<(HeaderName, Pattern)>,
    body: Option<Arc<dyn Fn(&[u8]) -> bool + Send + Sync>>,
}

impl Route {
    pub fn new(pattern: &str) -> Route {
        let pattern = pattern.trim();
        let (method, target) = match pattern.split_once(' ') {
            Some((method, target)) => {
                let method = match method {
                    "*" => None,
                    name => Some(Method::from_name(name)),
                };
                (method, target.trim())
            }
            None => (None, pattern),
        };

        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (target, None),
        };

        let mut segments: Vec<Segment> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| match s {
                "*" => Segment::WildcardOne,
                capture if capture.starts_with(':') => {
                    Segment::Capture(capture[1..].to_owned())
                }
                literal => Segment::Literal(literal.to_owned()),
            })
            .collect();
        // a trailing wildcard swallows the rest of the path
        if let Some(last) = segments.last_mut() {
            if *last == Segment::WildcardOne {
                *last = Segment::WildcardRest;
            }
        }

        let query = query
            .unwrap_or("")
            .split('&')
            .filter(|item| !item.is_empty())
            .map(|item| match item.split_once('=') {
                Some((name, value)) => (name.to_owned(), Pattern::parse(value)),
                None => (item.to_owned(), Pattern::Any),
            })
            .collect();

        Route {
            method,
            segments,
            query,
            headers: Vec::new(),
            body: None,
        }
    }

    /// Requires `name` to be present; `"*"` matches any value, anything
    /// else must match exactly (names compare case-insensitively).
    pub fn header(mut self, name: impl Into<HeaderName>, value: &str) -> Route {
        self.headers.push((name.into(), Pattern::parse(value)));
        self
    }

    /// Requires `predicate` to accept the buffered request body.
    pub fn body_predicate(
        mut self,
        predicate: impl Fn(&[u8]) -> bool + Send + Sync + 'static,
    ) -> Route {
        self.body = Some(Arc::new(predicate));
        self
    }

    /// Tests the route against a request, returning the bound path
    /// captures on a match.
    pub fn matches(&self, request: &Request) -> Option<Vec<(String, String)>> {
        if let Some(method) = &self.method {
            if *method != request.method {
                return None;
            }
        }

        let captures = self.match_path(&request.path)?;

        for (name, pattern) in &self.query {
            let value = request.query_value(name)?;
            if !pattern.matches(value) {
                return None;
            }
        }

        for (name, pattern) in &self.headers {
            let value = request.headers.get(name)?;
            if !pattern.matches(value) {
                return None;
            }
        }

        if let Some(predicate) = &self.body {
            if !predicate(&request.body) {
                return None;
            }
        }

        Some(captures)
    }

    fn match_path(&self, path: &str) -> Option<Vec<(String, String)>> {
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut captures = Vec::new();

        let mut index = 0;
        for segment in &self.segments {
            match segment {
                Segment::WildcardRest => return Some(captures),
                Segment::WildcardOne => {
                    parts.get(index)?;
                    index += 1;
                }
                Segment::Literal(literal) => {
                    let part = parts.get(index)?;
                    if literal != part {
                        return None;
                    }
                    index += 1;
                }
                Segment::Capture(name) => {
                    let part = parts.get(index)?;
                    captures.push((name.clone(), (*part).to_owned()));
                    index += 1;
                }
            }
        }

        if index == parts.len() {
            Some(captures)
        } else {
            None
        }
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Route")
            .field("method", &self.method)
            .field("segments", &self.segments)
            .field("query", &self.query)
            .field("headers", &self.headers)
            .field("body", &self.body.as_ref().map(|_| "<predicate>"))
            .finish()
    }
}

#[derive(Clone)]
pub struct RouteEntry {
    pub route: Route,
    pub handler: Arc<dyn Handler>,
}

/// An ordered route table shared between the server and its connections.
///
/// Appending while serving is supported: dispatch takes a copy-on-write
/// snapshot, so a connection sees a consistent table for the duration of
/// one request.
#[derive(Clone, Default)]
pub struct RouteTable {
    inner: Arc<RwLock<Arc<Vec<RouteEntry>>>>,
}

impl RouteTable {
    pub fn new() -> RouteTable {
        RouteTable::default()
    }

    pub fn append(&self, route: Route, handler: impl Handler) {
        self.append_arc(route, Arc::new(handler));
    }

    pub fn append_arc(&self, route: Route, handler: Arc<dyn Handler>) {
        let mut table = self.inner.write().unwrap_or_else(|err| err.into_inner());
        let mut routes: Vec<RouteEntry> = (**table).clone();
        routes.push(RouteEntry { route, handler });
        *table = Arc::new(routes);
    }

    pub fn snapshot(&self) -> Arc<Vec<RouteEntry>> {
        Arc::clone(&self.inner.read().unwrap_or_else(|err| err.into_inner()))
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::http::Method;

    fn request(method: Method, target: &str) -> Request {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, query),
            None => (target, ""),
        };
        let mut request = Request::new(method, path);
        request.query = query
            .split('&')
            .filter(|item| !item.is_empty())
            .map(|item| match item.split_once('=') {
                Some((name, value)) => (name.to_owned(), value.to_owned()),
                None => (item.to_owned(), String::new()),
            })
            .collect();
        request
    }

    #[test]
    fn matches_methods_and_literals() {
        let route = Route::new("GET /hello");

        assert!(route.matches(&request(Method::Get, "/hello")).is_some());
        assert!(route.matches(&request(Method::Post, "/hello")).is_none());
        assert!(route.matches(&request(Method::Get, "/goodbye")).is_none());

        let any = Route::new("/hello");
        assert!(any.matches(&request(Method::Post, "/hello")).is_some());
    }

    #[test]
    fn wildcard_matches_one_segment_in_the_middle() {
        let route = Route::new("GET /hello/*/world");

        assert!(route
            .matches(&request(Method::Get, "/hello/fish/world"))
            .is_some());
        assert!(route
            .matches(&request(Method::Get, "/hello/fish/sea"))
            .is_none());
        assert!(route.matches(&request(Method::Get, "/hello/world")).is_none());
    }

    #[test]
    fn trailing_wildcard_matches_the_rest() {
        let route = Route::new("GET /hello/*");

        assert!(route.matches(&request(Method::Get, "/hello/a/b/c")).is_some());
        assert!(route.matches(&request(Method::Get, "/hello/a")).is_some());
        assert!(route.matches(&request(Method::Get, "/hello")).is_some());
        assert!(route.matches(&request(Method::Get, "/goodbye/a")).is_none());
    }

    #[test]
    fn query_predicates_require_the_item() {
        let route = Route::new("GET /hello?time=*");

        assert!(route
            .matches(&request(Method::Get, "/hello?time=morning"))
            .is_some());
        assert!(route
            .matches(&request(Method::Get, "/hello?count=1&time=morning"))
            .is_some());
        assert!(route.matches(&request(Method::Get, "/hello")).is_none());

        let exact = Route::new("GET /hello?time=morning");
        assert!(exact
            .matches(&request(Method::Get, "/hello?time=evening"))
            .is_none());
    }

    #[test]
    fn header_predicates() {
        let route = Route::new("GET /data").header("Accept", "application/json");

        let mut matching = request(Method::Get, "/data");
        matching.headers.insert("accept", "application/json");
        assert!(route.matches(&matching).is_some());

        let mut wrong = request(Method::Get, "/data");
        wrong.headers.insert("accept", "text/html");
        assert!(route.matches(&wrong).is_none());

        assert!(route.matches(&request(Method::Get, "/data")).is_none());

        let any = Route::new("GET /data").header("Accept", "*");
        assert!(any.matches(&matching).is_some());
    }

    #[test]
    fn body_predicates_see_the_buffered_body() {
        let route = Route::new("POST /events").body_predicate(|body| body.starts_with(b"{"));

        let mut json = request(Method::Post, "/events");
        json.body = bytes::Bytes::from_static(b"{\"ok\":true}");
        assert!(route.matches(&json).is_some());

        let mut text = request(Method::Post, "/events");
        text.body = bytes::Bytes::from_static(b"plain");
        assert!(route.matches(&text).is_none());
    }

    #[test]
    fn captures_bind_segment_values() {
        let route = Route::new("GET /users/:id/posts/:post");

        let captures = route
            .matches(&request(Method::Get, "/users/7/posts/42"))
            .unwrap();
        assert_eq!(
            captures,
            vec![
                ("id".to_owned(), "7".to_owned()),
                ("post".to_owned(), "42".to_owned()),
            ]
        );
    }

    #[test]
    fn append_is_visible_to_existing_snapshots_only_after_refresh() {
        let table = RouteTable::new();
        let before = table.snapshot();

        table.append(
            Route::new("GET /hello"),
            crate::handler::handler(|_| async { Ok(crate::http::Response::text("hi")) }),
        );

        assert!(before.is_empty());
        assert_eq!(table.snapshot().len(), 1);
    }
}
