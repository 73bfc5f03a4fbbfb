//! Subscription resolution.
//!
//! Clients submit an ordered set of named descriptors. Each descriptor
//! selects rows of one visor, optionally:
//! - restricted to rows linked to an earlier entry (`fromSub`)
//! - filtered by equality and ordered
//! - folded into a parent/children tree (`recursive`)
//!
//! All entries of one set share a single normalized [`ResponseData`]
//! document, keyed by table and primary key.
//!
//! # Example
//!
//! ```ignore
//! let set = SubscriptionSet::new()
//!     .with("suites", SubscriptionDescriptor::new("Suite"))
//!     .with("cases", SubscriptionDescriptor::new("Case").from_sub("suites"));
//!
//! let resolution = resolver.resolve(&user, &set)?;
//! for id in &resolution.sub["cases"].ids {
//!     println!("{:?}", resolution.data.get("cases", id));
//! }
//! ```

mod resolver;
mod types;

pub use resolver::Resolver;
pub use types::{
    Recursive, Resolution, ResponseData, SubscriptionDescriptor, SubscriptionEntry,
    SubscriptionResult, SubscriptionSet,
};
