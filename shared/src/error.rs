use thiserror::Error;

use crate::value::RcType;

/// Errors that can occur while freezing a `DirectoryConfig` into a `Directory`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    /// Host ids become path segments and wire fields
    #[error("Invalid host id '{id}': ids must be non-empty and must not contain '/' or whitespace")]
    InvalidHostId {
        id: String,
    },

    /// Driver ids become path segments and LID prefixes
    #[error("Invalid driver id '{id}': ids must be non-empty and must not contain '/' or whitespace")]
    InvalidDriverId {
        id: String,
    },

    /// The same host id appears twice in the host table
    #[error("Host '{id}' is configured more than once")]
    DuplicateHost {
        id: String,
    },

    /// Alias keys must live below `/alias`
    #[error("Alias '{key}' does not lie below /alias")]
    InvalidAlias {
        key: String,
    },

    /// The default working directory must be an absolute path
    #[error("Working directory '{path}' is not absolute")]
    InvalidWorkDir {
        path: String,
    },
}

/// Errors that can occur when validating a `NetConfig`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A timing value that drives a timer is zero
    #[error("Network setting '{name}' must be greater than zero")]
    ZeroInterval {
        name: &'static str,
    },

    /// The retry ceiling lies below the first retry interval
    #[error("Maximum retry interval ({max_ms} ms) is smaller than the minimum ({min_ms} ms)")]
    RetryBounds {
        min_ms: u128,
        max_ms: u128,
    },
}

/// Errors that can occur when parsing values and value/state encodings
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    /// Type name not known
    #[error("Unknown resource type '{name}'")]
    UnknownType {
        name: String,
    },

    /// Text cannot be parsed as a value of the given type
    #[error("Cannot parse '{text}' as a value of type {rc_type}")]
    InvalidValue {
        rc_type: RcType,
        text: String,
    },

    /// Encoding does not start with a known state marker
    #[error("Invalid value/state encoding '{text}' (expected '?', '=<value>' or '!<value>')")]
    InvalidState {
        text: String,
    },
}

/// Errors that can occur while decoding a protocol line from a peer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// Empty line received
    #[error("Empty protocol line")]
    Empty,

    /// Line is not valid UTF-8
    #[error("Protocol line of {length} bytes is not valid UTF-8")]
    InvalidUtf8 {
        length: usize,
    },

    /// Peer kept sending without a line terminator
    #[error("Protocol line exceeds {limit} bytes without a terminator")]
    LineTooLong {
        limit: usize,
    },

    /// First word of the line is not a known command
    #[error("Unknown protocol command '{command}'")]
    UnknownCommand {
        command: String,
    },

    /// A mandatory field is missing
    #[error("Command '{command}' is missing field '{field}'")]
    MissingField {
        command: &'static str,
        field: &'static str,
    },

    /// A field cannot be parsed
    #[error("Command '{command}' has invalid field '{field}': '{text}'")]
    InvalidField {
        command: &'static str,
        field: &'static str,
        text: String,
    },

    /// Trailing text after a command that takes no more fields
    #[error("Command '{command}' has unexpected trailing data '{text}'")]
    TrailingData {
        command: &'static str,
        text: String,
    },

    /// Value or type field cannot be parsed
    #[error("Invalid value: {0}")]
    Value(#[from] ValueError),
}

/// Errors returned by operations on the resource core
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Driver not listed in the directory
    #[error("Driver '{driver}' is not registered in the directory")]
    UnknownDriver {
        driver: String,
    },

    /// Host not listed in the directory
    #[error("Host '{host}' is not registered in the directory")]
    UnknownHost {
        host: String,
    },

    /// Resource or subscriber name that cannot be used in paths or on the wire
    #[error("Invalid name '{name}': names must be non-empty, without whitespace or wildcards")]
    InvalidName {
        name: String,
    },

    /// A local resource with this URI already exists
    #[error("Resource '{uri}' is already registered")]
    DuplicateResource {
        uri: String,
    },

    /// URI does not denote a registered resource
    #[error("No resource found for '{uri}'")]
    UnknownResource {
        uri: String,
    },

    /// Subscriber key is stale
    #[error("Subscriber {key} does not exist")]
    UnknownSubscriber {
        key: u64,
    },

    /// A subscriber with this global id already exists
    #[error("Subscriber '{gid}' already exists")]
    DuplicateSubscriber {
        gid: String,
    },

    /// Value type does not fit the resource
    #[error("Resource '{uri}' has type {expected}, got a value of type {found}")]
    TypeMismatch {
        uri: String,
        expected: RcType,
        found: RcType,
    },
}
