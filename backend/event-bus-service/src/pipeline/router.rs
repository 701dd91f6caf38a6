//! Static routing table from topics and event types to processors

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{EventBusError, Result};
use crate::events::EventEnvelope;
use crate::pipeline::processor::Processor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteMatcher {
    EventType(String),
    EventTypePrefix(String),
    Topic(String),
    TopicPrefix(String),
}

impl RouteMatcher {
    pub fn matches(&self, envelope: &EventEnvelope, topic: &str) -> bool {
        match self {
            RouteMatcher::EventType(t) => envelope.event_type == *t,
            RouteMatcher::EventTypePrefix(p) => envelope.event_type.starts_with(p.as_str()),
            RouteMatcher::Topic(t) => topic == t,
            RouteMatcher::TopicPrefix(p) => topic.starts_with(p.as_str()),
        }
    }
}

impl fmt::Display for RouteMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteMatcher::EventType(t) => write!(f, "event_type={}", t),
            RouteMatcher::EventTypePrefix(p) => write!(f, "event_type={}*", p),
            RouteMatcher::Topic(t) => write!(f, "topic={}", t),
            RouteMatcher::TopicPrefix(p) => write!(f, "topic={}*", p),
        }
    }
}

pub struct Route {
    pub matcher: RouteMatcher,
    pub processors: Vec<Arc<dyn Processor>>,
}

impl Route {
    pub fn processor_names(&self) -> Vec<&str> {
        self.processors.iter().map(|p| p.name()).collect()
    }
}

/// Immutable after [`RouterBuilder::build`]
pub struct Router {
    routes: Vec<Route>,
    fallback: Route,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::default()
    }

    /// Route for the envelope consumed from `topic`
    ///
    /// An exact event-type route wins; otherwise the first matching route in
    /// registration order. `None` means the event is unknown.
    pub fn resolve(&self, envelope: &EventEnvelope, topic: &str) -> Option<&Route> {
        self.routes
            .iter()
            .find(|r| {
                matches!(r.matcher, RouteMatcher::EventType(_)) && r.matcher.matches(envelope, topic)
            })
            .or_else(|| self.routes.iter().find(|r| r.matcher.matches(envelope, topic)))
    }

    /// Route for unknown events
    pub fn fallback(&self) -> &Route {
        &self.fallback
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}

#[derive(Default)]
pub struct RouterBuilder {
    processors: HashMap<String, Arc<dyn Processor>>,
    routes: Vec<(RouteMatcher, Vec<String>)>,
    fallback: Option<String>,
}

impl RouterBuilder {
    pub fn processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processors
            .insert(processor.name().to_string(), processor);
        self
    }

    pub fn route(mut self, matcher: RouteMatcher, processors: &[&str]) -> Self {
        self.routes.push((
            matcher,
            processors.iter().map(|p| p.to_string()).collect(),
        ));
        self
    }

    /// Processor that receives events no route matches
    pub fn fallback(mut self, processor: &str) -> Self {
        self.fallback = Some(processor.to_string());
        self
    }

    pub fn build(self) -> Result<Router> {
        let lookup = |name: &str| {
            self.processors
                .get(name)
                .cloned()
                .ok_or_else(|| EventBusError::Config(format!("unknown processor '{}'", name)))
        };

        let mut routes = Vec::with_capacity(self.routes.len());
        for (matcher, names) in &self.routes {
            if names.is_empty() {
                return Err(EventBusError::Config(format!(
                    "route {} has no processors",
                    matcher
                )));
            }
            let processors = names
                .iter()
                .map(|n| lookup(n.as_str()))
                .collect::<Result<Vec<_>>>()?;
            routes.push(Route {
                matcher: matcher.clone(),
                processors,
            });
        }

        let fallback_name = self
            .fallback
            .as_deref()
            .ok_or_else(|| EventBusError::Config("router needs a fallback processor".into()))?;
        let fallback = Route {
            matcher: RouteMatcher::TopicPrefix(String::new()),
            processors: vec![lookup(fallback_name)?],
        };

        Ok(Router { routes, fallback })
    }
}

/// Routes between the CDC topics, application events and processors
pub fn default_routes(builder: RouterBuilder) -> RouterBuilder {
    use RouteMatcher::*;

    builder
        .route(Topic("cdc.forms".into()), &["cdc-table", "form", "analytics"])
        .route(Topic("cdc.responses".into()), &["cdc-table", "response", "analytics"])
        .route(Topic("cdc.users".into()), &["cdc-table", "analytics"])
        .route(Topic("cdc.analytics".into()), &["analytics"])
        .route(EventType("form.created".into()), &["form", "analytics"])
        .route(EventType("form.updated".into()), &["form", "analytics"])
        .route(EventType("response.submitted".into()), &["response", "analytics"])
        .route(EventType("user.registered".into()), &["analytics"])
        .route(TopicPrefix("cdc.".into()), &["cdc-table"])
        .fallback("unrouted")
}
