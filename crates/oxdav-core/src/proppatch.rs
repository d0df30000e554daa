//! Property write coordinator.
//!
//! `propPatch` listeners claim the mutations they can apply with
//! [`PropPatch::handle`] and register a deferred handler; nothing is written
//! until the server calls [`PropPatch::commit`]. Commit runs the handlers in
//! registration order and stops calling them after the first failure; the
//! remaining claimed properties are then reported as 424 Failed Dependency.
//! Mutations nobody claimed are rejected with 403.

use std::collections::HashMap;

use http::StatusCode;
use tracing::debug;

use crate::error::{DavError, DavResult};
use crate::propfind::PropValue;

/// One requested change: `Some` sets the value, `None` removes the property.
pub type Mutation = (String, Option<PropValue>);

/// What a deferred handler reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    /// Every claimed property was updated (200).
    Success,
    /// Every claimed property was refused (403).
    Failure,
    /// Per-property status. Claimed properties missing from the map are
    /// reported as 500.
    Codes(HashMap<String, StatusCode>),
    /// One status for every claimed property.
    Code(StatusCode),
}

type PatchHandler = Box<dyn FnOnce(&[Mutation]) -> DavResult<PatchOutcome> + Send>;

/// Property write coordinator for one PROPPATCH (or MKCOL with properties).
pub struct PropPatch {
    mutations: Vec<Mutation>,
    handlers: Vec<(Vec<String>, PatchHandler)>,
    results: HashMap<String, StatusCode>,
    committed: bool,
}

impl std::fmt::Debug for PropPatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropPatch")
            .field("mutations", &self.mutations)
            .field("handlers", &self.handlers.len())
            .field("results", &self.results)
            .field("committed", &self.committed)
            .finish()
    }
}

impl PropPatch {
    pub fn new(mutations: Vec<Mutation>) -> Self {
        Self {
            mutations,
            handlers: Vec::new(),
            results: HashMap::new(),
            committed: false,
        }
    }

    /// All requested mutations in request order.
    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    /// Claim those of `names` that are requested and not yet claimed.
    ///
    /// `handler` runs at commit time with the claimed mutations. Nothing is
    /// registered when none of the names is available.
    pub fn handle<F>(&mut self, names: &[&str], handler: F)
    where
        F: FnOnce(&[Mutation]) -> DavResult<PatchOutcome> + Send + 'static,
    {
        let claimed: Vec<String> = names
            .iter()
            .filter(|name| self.is_unclaimed(name))
            .map(ToString::to_string)
            .collect();
        self.register(claimed, Box::new(handler));
    }

    /// Claim every mutation nobody has claimed yet.
    pub fn handle_remaining<F>(&mut self, handler: F)
    where
        F: FnOnce(&[Mutation]) -> DavResult<PatchOutcome> + Send + 'static,
    {
        let claimed = self.get_remaining_mutations();
        self.register(claimed, Box::new(handler));
    }

    /// Assign `status` directly to requested, unclaimed `names`.
    pub fn set_result_code(&mut self, names: &[&str], status: StatusCode) {
        for name in names {
            if self.is_unclaimed(name) {
                self.results.insert((*name).to_string(), status);
            }
        }
    }

    /// Assign `status` to every mutation nobody has claimed.
    pub fn set_remaining_result_code(&mut self, status: StatusCode) {
        for name in self.get_remaining_mutations() {
            self.results.insert(name, status);
        }
    }

    /// Requested property names without a handler or status.
    pub fn get_remaining_mutations(&self) -> Vec<String> {
        self.mutations
            .iter()
            .filter(|(name, _)| !self.results.contains_key(name))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Status per requested property, in request order.
    pub fn result(&self) -> Vec<(String, StatusCode)> {
        self.mutations
            .iter()
            .filter_map(|(name, _)| self.results.get(name).map(|s| (name.clone(), *s)))
            .collect()
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Apply the deferred handlers. Returns `true` when every mutation
    /// succeeded.
    ///
    /// May only be called once per coordinator.
    pub fn commit(&mut self) -> DavResult<bool> {
        if self.committed {
            return Err(DavError::Internal("PropPatch committed twice".into()));
        }
        self.committed = true;

        let mut failed = false;
        for name in self.get_remaining_mutations() {
            debug!(property = %name, "No handler claimed property");
            self.results.insert(name, StatusCode::FORBIDDEN);
            failed = true;
        }
        failed |= self.results.values().any(|s| s.as_u16() >= 400);

        for (names, handler) in std::mem::take(&mut self.handlers) {
            if failed {
                break;
            }
            let subset: Vec<Mutation> = self
                .mutations
                .iter()
                .filter(|(name, _)| names.contains(name))
                .cloned()
                .collect();

            let codes = match handler(&subset)? {
                PatchOutcome::Success => uniform(&names, StatusCode::OK),
                PatchOutcome::Failure => uniform(&names, StatusCode::FORBIDDEN),
                PatchOutcome::Code(status) => uniform(&names, status),
                PatchOutcome::Codes(mut codes) => names
                    .iter()
                    .map(|n| {
                        let status = codes.remove(n).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                        (n.clone(), status)
                    })
                    .collect(),
            };
            for (name, status) in codes {
                failed |= status.as_u16() >= 400;
                self.results.insert(name, status);
            }
        }

        if failed {
            for status in self.results.values_mut() {
                if *status == StatusCode::ACCEPTED {
                    *status = StatusCode::FAILED_DEPENDENCY;
                }
            }
        }
        Ok(!failed)
    }

    fn is_unclaimed(&self, name: &str) -> bool {
        !self.results.contains_key(name) && self.mutations.iter().any(|(n, _)| n == name)
    }

    fn register(&mut self, claimed: Vec<String>, handler: PatchHandler) {
        if claimed.is_empty() {
            return;
        }
        for name in &claimed {
            self.results.insert(name.clone(), StatusCode::ACCEPTED);
        }
        self.handlers.push((claimed, handler));
    }
}

fn uniform(names: &[String], status: StatusCode) -> Vec<(String, StatusCode)> {
    names.iter().map(|n| (n.clone(), status)).collect()
}
