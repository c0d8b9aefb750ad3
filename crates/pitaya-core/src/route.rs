//! Route parsing.
//!
//! A route addresses a handler as `service.method`, optionally prefixed by
//! the server type that hosts it: `serverType.service.method`.

use std::fmt;
use std::str::FromStr;

/// Errors produced while parsing a route string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("malformed route '{route}': expected 2 or 3 segments, got {segments}")]
    Malformed { route: String, segments: usize },
}

/// A parsed `[serverType.]service.method` identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    server_type: String,
    service: String,
    method: String,
}

impl Route {
    /// Build a route from its parts. An empty `server_type` means "local".
    pub fn new(
        server_type: impl Into<String>,
        service: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            server_type: server_type.into(),
            service: service.into(),
            method: method.into(),
        }
    }

    /// Parse a dotted route string.
    pub fn parse(raw: &str) -> Result<Self, RouteError> {
        let parts: Vec<&str> = raw.split('.').collect();
        match parts.as_slice() {
            [server_type, service, method] => Ok(Self::new(*server_type, *service, *method)),
            [service, method] => Ok(Self::new("", *service, *method)),
            _ => Err(RouteError::Malformed {
                route: raw.to_string(),
                segments: parts.len(),
            }),
        }
    }

    pub fn server_type(&self) -> &str {
        &self.server_type
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// The registry key for this route: `service.method`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.service, self.method)
    }
}

impl FromStr for Route {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.server_type.is_empty() {
            write!(f, "{}.{}", self.service, self.method)
        } else {
            write!(f, "{}.{}.{}", self.server_type, self.service, self.method)
        }
    }
}
