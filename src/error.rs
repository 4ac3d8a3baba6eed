use compact_str::CompactString;
use thiserror::Error;

use crate::{addrclass::ClassId, lifetime::Lifetimes};

/// Errors raised while loading configuration. Any of these halts startup for
/// the affected interface, or aborts a reload and keeps the running table.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid address class {class} on interface {iface}: {reason}")]
    InvalidClassConfiguration {
        iface: CompactString,
        class: ClassId,
        reason: String,
    },
    #[error("interface {0} is defined more than once")]
    DuplicateInterface(CompactString),
}

/// Request-time failures. All of them are recoverable: the caller answers the
/// client with a refusal and keeps serving.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("negotiated lifetimes {negotiated} violate {reason}")]
    InvalidLeaseParameters {
        negotiated: Lifetimes,
        reason: &'static str,
    },
    #[error("no address class accepts this client")]
    NoEligibleClass,
    #[error("every eligible address class has reached its lease quota")]
    PoolExhausted,
    #[error("unknown address class {0}")]
    UnknownClass(ClassId),
    #[error("no address classes configured for interface {0}")]
    UnknownInterface(CompactString),
    #[error("no free address in class {class} after {attempts} draws")]
    AddressUnavailable { class: ClassId, attempts: u32 },
}
