mod auth;
mod client;

pub use auth::AuthMode;
pub use client::{
    ApiErrorClass, CirrusClient, CirrusError, EntryKind, EntryPage, RemoteEntry, SpaceUsage,
    TransferLink, Workspace,
};
