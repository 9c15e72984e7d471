use std::{collections::HashSet, fmt, str::FromStr};

use thiserror::Error;
use tracing::warn;

use crate::config::AssetConfig;

pub const CONTROL_PATH: &str = "/api/leds";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Patch,
    Options,
}

impl Method {
    pub const ALL: [Method; 7] = [
        Self::Get,
        Self::Head,
        Self::Post,
        Self::Put,
        Self::Delete,
        Self::Patch,
        Self::Options,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported http method `{0}`")]
pub struct UnknownMethod(pub String);

impl FromStr for Method {
    type Err = UnknownMethod;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "GET" => Ok(Self::Get),
            "HEAD" => Ok(Self::Head),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            "PATCH" => Ok(Self::Patch),
            "OPTIONS" => Ok(Self::Options),
            other => Err(UnknownMethod(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodFilter {
    Only(Method),
    Any,
}

impl MethodFilter {
    pub fn accepts(self, method: Method) -> bool {
        match self {
            Self::Only(expected) => expected == method,
            Self::Any => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
    Exact(String),
    /// Literal prefix of a `/prefix/*` pattern, trailing slash kept.
    Prefix(String),
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix('*') {
            Some(prefix) => Self::Prefix(prefix.to_string()),
            None => Self::Exact(pattern.to_string()),
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Exact(literal) => literal == path,
            Self::Prefix(prefix) => path.starts_with(prefix.as_str()),
        }
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(literal) => f.write_str(literal),
            Self::Prefix(prefix) => write!(f, "{prefix}*"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Route<H> {
    pub pattern: PathPattern,
    pub method: MethodFilter,
    pub handler: H,
}

/// One `(pattern, method)` handler slot for servers that register per method.
/// `handler: None` marks a catch-all that answers through [`RouteTable::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration<H> {
    pub pattern: String,
    pub method: Method,
    pub handler: Option<H>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Resolution<'a, H> {
    Matched { handler: &'a H, path: &'a str },
    MethodNotAllowed,
    NotFound,
}

/// Ordered route list; registration order is match priority.
#[derive(Debug, Clone)]
pub struct RouteTable<H> {
    routes: Vec<Route<H>>,
}

impl<H> Default for RouteTable<H> {
    fn default() -> Self {
        Self { routes: Vec::new() }
    }
}

impl<H> RouteTable<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pattern: &str, method: MethodFilter, handler: H) -> &mut Self {
        self.routes.push(Route {
            pattern: PathPattern::parse(pattern),
            method,
            handler,
        });
        self
    }

    pub fn routes(&self) -> &[Route<H>] {
        &self.routes
    }

    pub fn resolve<'a>(&'a self, method: Method, uri: &'a str) -> Resolution<'a, H> {
        let path = strip_query(uri);
        let mut path_matched = false;

        for route in &self.routes {
            if !route.pattern.matches(path) {
                continue;
            }
            if route.method.accepts(method) {
                return Resolution::Matched {
                    handler: &route.handler,
                    path,
                };
            }
            path_matched = true;
        }

        if path_matched {
            Resolution::MethodNotAllowed
        } else {
            Resolution::NotFound
        }
    }
}

impl<H: Clone> RouteTable<H> {
    /// Table order, one slot per accepted method. Repeated `(pattern, method)`
    /// pairs are dropped (first wins), then every method without a `/*` slot
    /// gets a catch-all so no request reaches the server's own error pages.
    pub fn method_registrations(&self) -> Vec<Registration<H>> {
        let mut seen = HashSet::new();
        let mut slots = Vec::new();

        for route in &self.routes {
            let pattern = route.pattern.to_string();
            for method in Method::ALL {
                if !route.method.accepts(method) {
                    continue;
                }
                if !seen.insert((pattern.clone(), method)) {
                    warn!("skipping duplicate route {method} {pattern}");
                    continue;
                }
                slots.push(Registration {
                    pattern: pattern.clone(),
                    method,
                    handler: Some(route.handler.clone()),
                });
            }
        }

        for method in Method::ALL {
            if seen.insert(("/*".to_string(), method)) {
                slots.push(Registration {
                    pattern: "/*".to_string(),
                    method,
                    handler: None,
                });
            }
        }
        slots
    }
}

pub fn strip_query(uri: &str) -> &str {
    let end = uri.find(['?', '#']).unwrap_or(uri.len());
    &uri[..end]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Control,
    Asset,
}

pub fn device_routes(assets: &AssetConfig) -> RouteTable<Endpoint> {
    let mut table = RouteTable::new();
    table
        .register(CONTROL_PATH, MethodFilter::Any, Endpoint::Control)
        .register("/", MethodFilter::Only(Method::Get), Endpoint::Asset);
    for legacy in &assets.legacy_assets {
        table.register(legacy, MethodFilter::Only(Method::Get), Endpoint::Asset);
    }
    table.register("/*", MethodFilter::Only(Method::Get), Endpoint::Asset);
    table
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn literal_registered_before_wildcard_wins() {
        let mut table = RouteTable::new();
        table
            .register("/app.js", MethodFilter::Only(Method::Get), "literal")
            .register("/*", MethodFilter::Only(Method::Get), "wildcard");

        assert_eq!(
            table.resolve(Method::Get, "/app.js"),
            Resolution::Matched {
                handler: &"literal",
                path: "/app.js"
            }
        );
        assert_eq!(
            table.resolve(Method::Get, "/other.js"),
            Resolution::Matched {
                handler: &"wildcard",
                path: "/other.js"
            }
        );
    }

    #[test]
    fn earlier_wildcard_shadows_later_literal() {
        let mut table = RouteTable::new();
        table
            .register("/*", MethodFilter::Only(Method::Get), "wildcard")
            .register("/app.js", MethodFilter::Only(Method::Get), "literal");

        assert!(matches!(
            table.resolve(Method::Get, "/app.js"),
            Resolution::Matched { handler: &"wildcard", .. }
        ));
    }

    #[test]
    fn query_string_is_ignored() {
        let table = device_routes(&AssetConfig::default());

        assert_eq!(
            table.resolve(Method::Post, "/api/leds?debug=1"),
            Resolution::Matched {
                handler: &Endpoint::Control,
                path: "/api/leds"
            }
        );
    }

    #[test]
    fn method_mismatch_is_not_allowed_and_unknown_prefix_is_not_found() {
        let mut table = RouteTable::new();
        table.register("/static/*", MethodFilter::Only(Method::Get), ());

        assert_eq!(
            table.resolve(Method::Post, "/static/app.js"),
            Resolution::MethodNotAllowed
        );
        assert_eq!(table.resolve(Method::Get, "/other"), Resolution::NotFound);
    }

    #[test]
    fn device_routes_are_ordered() {
        let table = device_routes(&AssetConfig {
            legacy_assets: vec!["/app.0f3c9a.js".to_string()],
            ..AssetConfig::default()
        });

        let patterns: Vec<String> = table
            .routes()
            .iter()
            .map(|route| route.pattern.to_string())
            .collect();
        assert_eq!(patterns, vec!["/api/leds", "/", "/app.0f3c9a.js", "/*"]);

        assert!(matches!(
            table.resolve(Method::Get, "/api/leds"),
            Resolution::Matched {
                handler: Endpoint::Control,
                ..
            }
        ));
        assert!(matches!(
            table.resolve(Method::Get, "/index.html"),
            Resolution::Matched {
                handler: Endpoint::Asset,
                ..
            }
        ));
    }

    #[test]
    fn registrations_cover_every_method_with_a_catch_all() {
        let table = device_routes(&AssetConfig::default());
        let slots = table.method_registrations();

        let control: Vec<Method> = slots
            .iter()
            .filter(|slot| slot.pattern == CONTROL_PATH)
            .map(|slot| slot.method)
            .collect();
        assert_eq!(control, Method::ALL.to_vec());

        for method in Method::ALL {
            let wildcard = slots
                .iter()
                .find(|slot| slot.pattern == "/*" && slot.method == method)
                .unwrap_or_else(|| panic!("no /* slot for {method}"));
            let expected = (method == Method::Get).then_some(Endpoint::Asset);
            assert_eq!(wildcard.handler, expected, "{method}");
        }
        assert_eq!(slots.len(), Method::ALL.len() * 2 + 1);
    }

    #[test]
    fn duplicate_registrations_keep_the_first() {
        let assets = AssetConfig {
            legacy_assets: vec![CONTROL_PATH.to_string()],
            ..AssetConfig::default()
        };
        let slots = device_routes(&assets).method_registrations();

        let get_control: Vec<&Registration<Endpoint>> = slots
            .iter()
            .filter(|slot| slot.pattern == CONTROL_PATH && slot.method == Method::Get)
            .collect();
        assert_eq!(get_control.len(), 1);
        assert_eq!(get_control[0].handler, Some(Endpoint::Control));
    }

    #[test]
    fn methods_parse_case_sensitively() {
        assert_eq!("POST".parse::<Method>(), Ok(Method::Post));
        assert!("post".parse::<Method>().is_err());
    }
}
