//! Per-node property read coordinator.
//!
//! A [`PropFind`] is created for every node visited by a PROPFIND traversal
//! and handed to each `propFind` listener. Listeners resolve the properties
//! they know about with [`PropFind::handle`]; whatever is left unresolved is
//! reported as 404 by the serializer.
//!
//! Listeners never have to coordinate with each other: the first listener to
//! resolve a property wins and later `handle` calls for it are no-ops. Values
//! that are expensive to compute go through [`PropFind::handle_with`], which
//! only evaluates the provider when the property is still outstanding.

use std::collections::HashMap;

use http::StatusCode;

use crate::error::DavResult;

/// Clark-notation name of the collection resource type.
pub const COLLECTION: &str = "{DAV:}collection";

/// Properties returned for an `allprop` request unless plugins add more.
pub const ALLPROPS_DEFAULT: &[&str] = &[
    "{DAV:}getlastmodified",
    "{DAV:}getcontentlength",
    "{DAV:}resourcetype",
    "{DAV:}quota-used-bytes",
    "{DAV:}quota-available-bytes",
    "{DAV:}getetag",
    "{DAV:}getcontenttype",
];

/// Traversal depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Zero,
    One,
    Infinity,
}

impl Depth {
    /// Depth handed to the children of a node visited at `self`.
    pub fn child(self) -> Depth {
        match self {
            Depth::Zero | Depth::One => Depth::Zero,
            Depth::Infinity => Depth::Infinity,
        }
    }

    pub fn as_header(self) -> &'static str {
        match self {
            Depth::Zero => "0",
            Depth::One => "1",
            Depth::Infinity => "infinity",
        }
    }
}

/// Kind of PROPFIND body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropFindKind {
    /// `<d:prop>` with explicit names.
    Named,
    /// `<d:allprop>` or an empty body.
    AllProps,
    /// `<d:propname>`: names only, no values.
    PropName,
}

/// A property value ready for serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropValue {
    Text(String),
    Integer(i64),
    Href(String),
    /// Clark names of resource types, e.g. [`COLLECTION`].
    ResourceType(Vec<String>),
    /// Repeated child elements, e.g. `<oc:tag>` entries of `<oc:tags>`.
    List { element: String, items: Vec<String> },
    /// Structured child elements, e.g. `<d:lockentry>` trees.
    Xml(Vec<XmlElement>),
}

/// Minimal element tree for structured property values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlElement {
    /// Clark name, `{namespace}local`.
    pub name: String,
    pub text: Option<String>,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: None,
            children: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    #[must_use]
    pub fn with_child(mut self, child: XmlElement) -> Self {
        self.children.push(child);
        self
    }
}

impl PropValue {
    /// Textual value, for properties sent as plain text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropValue::Text(s) | PropValue::Href(s) => Some(s),
            _ => None,
        }
    }

    pub fn list(element: impl Into<String>, items: Vec<String>) -> Self {
        PropValue::List {
            element: element.into(),
            items,
        }
    }
}

impl From<String> for PropValue {
    fn from(s: String) -> Self {
        PropValue::Text(s)
    }
}

impl From<&str> for PropValue {
    fn from(s: &str) -> Self {
        PropValue::Text(s.to_string())
    }
}

impl From<i64> for PropValue {
    fn from(n: i64) -> Self {
        PropValue::Integer(n)
    }
}

impl From<u64> for PropValue {
    fn from(n: u64) -> Self {
        PropValue::Integer(i64::try_from(n).unwrap_or(i64::MAX))
    }
}

impl From<bool> for PropValue {
    fn from(b: bool) -> Self {
        PropValue::Integer(i64::from(b))
    }
}

/// Properties sharing one status in a multistatus response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropStat {
    pub status: StatusCode,
    pub properties: Vec<(String, Option<PropValue>)>,
}

/// Serialized outcome for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropFindResponse {
    pub path: String,
    pub is_collection: bool,
    pub propstats: Vec<PropStat>,
}

#[derive(Debug, Clone)]
struct Entry {
    status: StatusCode,
    value: Option<PropValue>,
}

/// Property read coordinator for one node.
#[derive(Debug, Clone)]
pub struct PropFind {
    path: String,
    depth: Depth,
    kind: PropFindKind,
    requested: Vec<String>,
    /// Result keys in insertion order.
    order: Vec<String>,
    results: HashMap<String, Entry>,
}

impl PropFind {
    /// Create a coordinator. `names` is ignored unless `kind` is
    /// [`PropFindKind::Named`]; duplicates keep their first position.
    pub fn new(path: impl Into<String>, kind: PropFindKind, names: Vec<String>, depth: Depth) -> Self {
        let names = match kind {
            PropFindKind::Named => names,
            PropFindKind::AllProps | PropFindKind::PropName => {
                ALLPROPS_DEFAULT.iter().map(ToString::to_string).collect()
            }
        };

        let mut propfind = Self {
            path: path.into(),
            depth,
            kind,
            requested: Vec::with_capacity(names.len()),
            order: Vec::with_capacity(names.len()),
            results: HashMap::with_capacity(names.len()),
        };
        for name in names {
            if propfind.results.contains_key(&name) {
                continue;
            }
            propfind.results.insert(
                name.clone(),
                Entry {
                    status: StatusCode::NOT_FOUND,
                    value: None,
                },
            );
            propfind.order.push(name.clone());
            propfind.requested.push(name);
        }
        propfind
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn depth(&self) -> Depth {
        self.depth
    }

    pub fn set_depth(&mut self, depth: Depth) {
        self.depth = depth;
    }

    pub fn kind(&self) -> PropFindKind {
        self.kind
    }

    /// `allprop` and `propname` requests accept properties nobody named.
    pub fn is_all_props(&self) -> bool {
        self.kind != PropFindKind::Named
    }

    /// Requested names in request order.
    pub fn requested_properties(&self) -> &[String] {
        &self.requested
    }

    /// Whether a provider for `name` would be consulted.
    pub fn is_requested(&self, name: &str) -> bool {
        self.is_all_props() || self.results.contains_key(name)
    }

    /// Status of `name`, or `None` when it is not part of the result.
    pub fn status(&self, name: &str) -> Option<StatusCode> {
        self.results.get(name).map(|e| e.status)
    }

    /// Whether `name` is still waiting for a value.
    pub fn is_pending(&self, name: &str) -> bool {
        self.status(name) == Some(StatusCode::NOT_FOUND)
    }

    pub fn get(&self, name: &str) -> Option<&PropValue> {
        self.results.get(name).and_then(|e| e.value.as_ref())
    }

    /// Set a value with 200, or mark 404 when `value` is `None`.
    pub fn set(&mut self, name: &str, value: Option<PropValue>) {
        let status = if value.is_some() {
            StatusCode::OK
        } else {
            StatusCode::NOT_FOUND
        };
        self.set_with_status(name, value, status);
    }

    /// Set a value with an explicit status.
    ///
    /// Unrequested properties are dropped unless this is an `allprop` or
    /// `propname` request, which collects everything plugins offer.
    pub fn set_with_status(&mut self, name: &str, value: Option<PropValue>, status: StatusCode) {
        let all_props = self.is_all_props();
        match self.results.get_mut(name) {
            Some(entry) => {
                entry.status = status;
                entry.value = value;
            }
            None if all_props => {
                self.order.push(name.to_string());
                self.results.insert(name.to_string(), Entry { status, value });
            }
            None => {}
        }
    }

    /// Resolve `name` with `value` if it is still outstanding.
    pub fn handle(&mut self, name: &str, value: impl Into<PropValue>) {
        if self.accepts(name) {
            self.set(name, Some(value.into()));
        }
    }

    /// Resolve `name` from a provider that only runs when the property is
    /// outstanding. A provider answering `None` leaves the property at 404.
    pub fn handle_with<F>(&mut self, name: &str, provider: F)
    where
        F: FnOnce() -> Option<PropValue>,
    {
        if self.accepts(name)
            && let Some(value) = provider()
        {
            self.set(name, Some(value));
        }
    }

    /// Like [`handle_with`](Self::handle_with) for fallible providers.
    pub fn try_handle_with<F>(&mut self, name: &str, provider: F) -> DavResult<()>
    where
        F: FnOnce() -> DavResult<Option<PropValue>>,
    {
        if self.accepts(name)
            && let Some(value) = provider()?
        {
            self.set(name, Some(value));
        }
        Ok(())
    }

    /// Requested properties nobody resolved, in request order.
    pub fn get_404_properties(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|name| self.is_pending(name))
            .cloned()
            .collect()
    }

    /// Number of properties still waiting for a value.
    pub fn items_left(&self) -> usize {
        self.results
            .values()
            .filter(|e| e.status == StatusCode::NOT_FOUND)
            .count()
    }

    /// Group the results by status for serialization.
    ///
    /// `allprop`/`propname` requests never report missing properties, and
    /// `propname` requests carry names only.
    pub fn into_propstats(mut self) -> Vec<PropStat> {
        let mut propstats: Vec<PropStat> = Vec::new();
        for name in self.order {
            let Some(entry) = self.results.remove(&name) else {
                continue;
            };
            if self.kind != PropFindKind::Named && entry.status == StatusCode::NOT_FOUND {
                continue;
            }
            let value = match self.kind {
                PropFindKind::PropName => None,
                _ => entry.value,
            };
            match propstats.iter_mut().find(|p| p.status == entry.status) {
                Some(group) => group.properties.push((name, value)),
                None => propstats.push(PropStat {
                    status: entry.status,
                    properties: vec![(name, value)],
                }),
            }
        }
        propstats
    }

    /// First resolution wins: only 404 entries (or, for allprops, unknown
    /// names) accept a value.
    fn accepts(&self, name: &str) -> bool {
        match self.results.get(name) {
            Some(entry) => entry.status == StatusCode::NOT_FOUND,
            None => self.is_all_props(),
        }
    }
}
