//! # REST Remote Store
//!
//! Implements [`RemoteStore`](bridge_traits::RemoteStore) over a plain HTTP
//! API with version preconditions.
//!
//! ## Protocol
//!
//! Records live at `{base}/households/{household}/{entity_type}/{entity_id}`.
//!
//! | Call | Request | Outcome |
//! |---|---|---|
//! | read | `GET` | `200` record, `404` absent |
//! | create | `PUT` + `If-None-Match: *` | `200`/`201` applied |
//! | update | `PUT` + `If-Match: "<version>"` | `200` applied |
//! | delete | `DELETE` + `If-Match: "<version>"` | `200`/`204` applied |
//!
//! `412 Precondition Failed` and `409 Conflict` report a version mismatch;
//! the body carries the current record when one exists. Authentication and
//! validation refusals (`400`, `401`, `403`, `422`) are permanent; `429` and
//! `5xx` are transient.
//!
//! The API has no push channel, so the store offers no change feed.

pub mod error;
pub mod store;
pub mod types;

pub use error::{RestStoreError, Result};
pub use store::{RestRemoteStore, RestStoreConfig};
