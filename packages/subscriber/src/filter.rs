//! Transaction Filtering
//!
//! Named match predicates applied to candidate transactions. Several filters
//! may match the same transaction; a specific-method match names the method,
//! otherwise the catch-all filter classifies argument 0 through the resolver.

use tracing::{trace, warn};

use crate::decoder::CandidateTransaction;
use crate::selector::{KnownMethod, MethodResolver};
use crate::types::{TransactionQuery, TransactionType};

/// Name of the catch-all filter built by [`FilterSet::for_methods`]
pub const FALLBACK_FILTER: &str = "app-call";

/// A single named predicate over candidate transactions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionFilter {
    pub name: String,
    pub tx_type: TransactionType,
    pub application_id: Option<u64>,
    /// Exact method constraint; `None` makes this a catch-all filter
    pub method: Option<KnownMethod>,
}

impl TransactionFilter {
    /// Filter matching a single known method on one application
    pub fn method_call(application_id: u64, method: KnownMethod) -> Self {
        Self {
            name: method.name.clone(),
            tx_type: TransactionType::ApplicationCall,
            application_id: Some(application_id),
            method: Some(method),
        }
    }

    /// Filter matching every call to one application
    pub fn any_call(application_id: u64) -> Self {
        Self {
            name: FALLBACK_FILTER.to_string(),
            tx_type: TransactionType::ApplicationCall,
            application_id: Some(application_id),
            method: None,
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.method.is_none()
    }

    /// The server-side query that fetches candidates for this filter
    pub fn query(&self) -> TransactionQuery {
        TransactionQuery {
            tx_type: self.tx_type.clone(),
            application_id: self.application_id,
        }
    }

    pub fn matches(&self, tx: &CandidateTransaction) -> bool {
        if tx.tx_type != self.tx_type {
            return false;
        }
        if let Some(app_id) = self.application_id {
            if tx.application_id != Some(app_id) {
                return false;
            }
        }
        match &self.method {
            Some(method) => tx.first_arg().is_some_and(|arg| method.matches(arg)),
            None => true,
        }
    }
}

/// Result of running a candidate through a [`FilterSet`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOutcome {
    /// At least one filter matched; `method` is the resolved name
    Matched { filter: String, method: String },
    /// Only the catch-all matched and the call carries no arguments
    Malformed,
    NoMatch,
}

/// Ordered collection of filters for one subscription
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    filters: Vec<TransactionFilter>,
}

impl FilterSet {
    pub fn new(filters: Vec<TransactionFilter>) -> Self {
        Self { filters }
    }

    /// One specific filter per known method, followed by a catch-all
    pub fn for_methods(application_id: u64, resolver: &MethodResolver) -> Self {
        let mut filters: Vec<TransactionFilter> = resolver
            .methods()
            .iter()
            .cloned()
            .map(|method| TransactionFilter::method_call(application_id, method))
            .collect();
        filters.push(TransactionFilter::any_call(application_id));
        Self { filters }
    }

    pub fn filters(&self) -> &[TransactionFilter] {
        &self.filters
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Distinct queries in filter order, so each is fetched once per tick
    pub fn queries(&self) -> Vec<TransactionQuery> {
        let mut queries: Vec<TransactionQuery> = Vec::new();
        for filter in &self.filters {
            let query = filter.query();
            if !queries.contains(&query) {
                queries.push(query);
            }
        }
        queries
    }

    /// Match a candidate against every filter and resolve its method name
    pub fn resolve(&self, tx: &CandidateTransaction, resolver: &MethodResolver) -> FilterOutcome {
        let mut fallback_hit = false;
        for filter in &self.filters {
            if !filter.matches(tx) {
                continue;
            }
            match &filter.method {
                Some(method) => {
                    trace!(txid = %tx.id, filter = %filter.name, "Specific filter matched");
                    return FilterOutcome::Matched {
                        filter: filter.name.clone(),
                        method: method.name.clone(),
                    };
                }
                None => fallback_hit = true,
            }
        }

        if !fallback_hit {
            return FilterOutcome::NoMatch;
        }

        match tx.first_arg() {
            Some(arg) => FilterOutcome::Matched {
                filter: FALLBACK_FILTER.to_string(),
                method: resolver.classify(arg).to_string(),
            },
            None => {
                warn!(txid = %tx.id, "Application call without arguments, skipping");
                FilterOutcome::Malformed
            }
        }
    }
}
