//! # Reslink Shared
//! Common functionality shared between reslink-server & reslink-client crates:
//! directory tables, path resolution, the wire protocol and the resource
//! core with its subscriber fan-out.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

mod config;
mod directory;
mod error;
mod path;
mod protocol;
mod registry;
mod request;
mod time;
mod value;

pub use config::{DirectoryConfig, HostEntry, NetConfig};
pub use directory::{Directory, ROOTS};
pub use error::{ConfigError, CoreError, DirectoryError, ValueError, WireError};
pub use path::{
    has_wildcards, is_normalized, is_plain_segment, match_single, matches, normalize,
    split_pattern, PathDomain, PathInfo, Resolution, MAX_ALIAS_DEPTH,
};
pub use protocol::{InfoQuery, LineBuffer, WireMessage, MAX_LINE_LENGTH};
pub use registry::{
    DriveHandler, EventSink, RemoteGateway, ResourceCore, ResourceEvent, ResourceKey, Selection,
    SubscriberKey, SubscriberKind,
};
pub use request::{Request, DEFAULT_PRIORITY};
pub use time::{TimeError, Timestamp};
pub use value::{RcState, RcType, Value, ValueState};
