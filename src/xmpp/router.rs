//! Declarative routing of decoded elements.
//!
//! A router is an ordered list of routes; each route pairs a disjunction of
//! matchers with a handler identifier. Handlers themselves are small closed
//! enums dispatched by the loop that owns the connection state, which keeps
//! the routing table free of back-references into the proxy.

use thiserror::Error;

use super::element::{Element, QName};

/// Predicate over a decoded element.
#[derive(Debug, Clone, PartialEq)]
pub enum Matcher {
    /// Namespace URI and local name must both match.
    Name(QName),
    /// Namespace URI must match.
    Space(String),
    /// Matches every element.
    All,
}

impl Matcher {
    pub fn name(space: impl Into<String>, local: impl Into<String>) -> Self {
        Matcher::Name(QName::new(space, local))
    }

    pub fn space(space: impl Into<String>) -> Self {
        Matcher::Space(space.into())
    }

    pub fn matches(&self, element: &Element) -> bool {
        match self {
            Matcher::Name(name) => element.name() == *name,
            Matcher::Space(space) => element.name().space == *space,
            Matcher::All => true,
        }
    }
}

/// One routing entry: any matcher hit selects the handler.
#[derive(Debug)]
pub struct Route<H> {
    matchers: Vec<Matcher>,
    handler: H,
}

impl<H> Route<H> {
    pub fn new(handler: H) -> Self {
        Self {
            matchers: Vec::new(),
            handler,
        }
    }

    pub fn matcher(mut self, matcher: Matcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    fn matches(&self, element: &Element) -> bool {
        self.matchers.iter().any(|m| m.matches(element))
    }
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no routes were found that match: {0}")]
    NoMatch(String),
}

/// Ordered routing table. The first route whose matcher disjunction is
/// satisfied wins.
#[derive(Debug, Default)]
pub struct Router<H> {
    routes: Vec<Route<H>>,
}

impl<H: Copy> Router<H> {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    pub fn add_route(&mut self, route: Route<H>) {
        self.routes.push(route);
    }

    pub fn route(&self, element: &Element) -> Result<H, RouterError> {
        for route in &self.routes {
            if route.matches(element) {
                return Ok(route.handler);
            }
        }
        Err(RouterError::NoMatch(element.xml()))
    }
}
