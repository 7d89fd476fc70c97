//! Engine error types
//!
//! Every fault here is scoped to one record or one cluster call. Nothing in
//! this module aborts a whole sync run.

use std::time::Duration;
use thiserror::Error;

/// Errors returned by an IoR session
#[derive(Debug, Error)]
pub enum IorError {
    /// Connection refused, TLS failure, DNS failure and the like
    #[error("IoR unreachable: {0}")]
    Transport(String),

    /// The IoR answered with a non-success status
    #[error("IoR returned {status} for {endpoint}: {message}")]
    Status {
        /// Endpoint that was called
        endpoint: String,
        /// HTTP status code
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// More than one record matched a lookup that must be unique
    #[error("{count} {endpoint} records match {filter}")]
    Ambiguous {
        /// Endpoint that was searched
        endpoint: String,
        /// Rendered search filter
        filter: String,
        /// Number of matches reported
        count: usize,
    },

    /// Response body did not have the expected shape
    #[error("Failed to decode IoR response: {0}")]
    Decode(String),

    /// The call did not complete within the configured timeout
    #[error("IoR call timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors returned by a cluster session
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Connection refused, TLS failure, DNS failure and the like
    #[error("Cluster '{cluster}' unreachable: {message}")]
    Transport {
        /// Session name
        cluster: String,
        /// Underlying reason
        message: String,
    },

    /// The cluster API answered with a non-success status
    #[error("Cluster '{cluster}' returned {status} for {path}")]
    Status {
        /// Session name
        cluster: String,
        /// API path that was called
        path: String,
        /// HTTP status code
        status: u16,
    },

    /// Response body did not have the expected shape
    #[error("Failed to decode response from cluster '{cluster}': {message}")]
    Decode {
        /// Session name
        cluster: String,
        /// Underlying reason
        message: String,
    },

    /// The call did not complete within the configured timeout
    #[error("Cluster call timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors returned by the resolver for a single record
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Lookup or create failed at the transport or protocol level
    #[error("{display} '{name}': {source}")]
    Ior {
        /// Display name of the entity type
        display: &'static str,
        /// Name of the record being resolved
        name: String,
        /// Underlying IoR error
        #[source]
        source: IorError,
    },

    /// Lookup matched more than one record; nothing is created
    #[error("{display} '{name}' is ambiguous: {count} records match")]
    Ambiguous {
        /// Display name of the entity type
        display: &'static str,
        /// Name of the record being resolved
        name: String,
        /// Number of matches reported
        count: usize,
    },

    /// A required dependency could not be resolved; nothing is created
    #[error("{display} '{name}' not created: required {field} unresolved ({reason})")]
    MissingDependency {
        /// Display name of the entity type
        display: &'static str,
        /// Name of the record being resolved
        name: String,
        /// Dependency field that is missing
        field: &'static str,
        /// Why the dependency could not be resolved
        reason: String,
    },

    /// The provenance tag could not be ensured, so the record is not written
    #[error("{display} '{name}' not created: provenance tag unavailable ({reason})")]
    Tag {
        /// Display name of the entity type
        display: &'static str,
        /// Name of the record being resolved
        name: String,
        /// Why the tag is unavailable
        reason: String,
    },
}

impl ResolveError {
    /// Wrap an IoR error, lifting ambiguous lookups into their own variant
    pub fn from_ior(display: &'static str, name: impl Into<String>, source: IorError) -> Self {
        let name = name.into();
        match source {
            IorError::Ambiguous { count, .. } => ResolveError::Ambiguous {
                display,
                name,
                count,
            },
            source => ResolveError::Ior {
                display,
                name,
                source,
            },
        }
    }

    /// Missing dependencies are skips, not faults
    pub fn is_skip(&self) -> bool {
        matches!(self, ResolveError::MissingDependency { .. })
    }

    /// Check if the underlying cause was a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ResolveError::Ior {
                source: IorError::Timeout(_),
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambiguous_ior_error_becomes_ambiguous_resolve_error() {
        let err = ResolveError::from_ior(
            "Site",
            "Proxbox Basic Site",
            IorError::Ambiguous {
                endpoint: "sites".to_string(),
                filter: "slug=proxbox-basic-site".to_string(),
                count: 2,
            },
        );
        assert!(matches!(err, ResolveError::Ambiguous { count: 2, .. }));
        assert!(err.to_string().contains("ambiguous"));
    }

    #[test]
    fn transport_error_keeps_source() {
        let err = ResolveError::from_ior("Site", "x", IorError::Transport("refused".into()));
        assert!(matches!(err, ResolveError::Ior { .. }));
        assert!(std::error::Error::source(&err).is_some());
        assert!(!err.is_skip());
    }

    #[test]
    fn timeout_is_detected() {
        let err = ResolveError::from_ior("Site", "x", IorError::Timeout(Duration::from_secs(1)));
        assert!(err.is_timeout());
    }

    #[test]
    fn missing_dependency_is_a_skip() {
        let err = ResolveError::MissingDependency {
            display: "Virtual Machine",
            name: "web01".to_string(),
            field: "cluster",
            reason: "no cluster membership reported".to_string(),
        };
        assert!(err.is_skip());
        assert!(err.to_string().contains("web01"));
    }
}
