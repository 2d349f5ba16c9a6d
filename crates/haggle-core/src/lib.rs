//! Haggle core value types
//!
//! The vocabulary of the opportunistic data sharing runtime: weighted
//! attributes, content-addressed data objects, nodes with interests and
//! bloom filters, tagged interfaces and the metadata document format that
//! carries everything on the wire.
//!
//! # Modules
//!
//! - [`attribute`]: weighted `(name, value)` attributes and sets
//! - [`dataobject`]: content-addressed data objects and the id rule
//! - [`node`]: nodes, interests, node descriptions
//! - [`interface`]: tagged interfaces and addresses
//! - [`bloomfilter`]: counting / plain bloom filters
//! - [`metadata`]: the XML-shaped document tree
//! - [`repository`]: opaque persistent entries
//! - [`time`]: millisecond wall-clock timestamps

pub mod attribute;
pub mod bloomfilter;
pub mod dataobject;
pub mod error;
pub mod interface;
pub mod metadata;
pub mod node;
pub mod repository;
pub mod time;

pub use attribute::{Attribute, AttributeSet, WEIGHT_DEFAULT, WEIGHT_NO_MATCH, WILDCARD_VALUE};
pub use bloomfilter::Bloomfilter;
pub use dataobject::{DataObject, DataObjectId, DataObjectRef, SignatureStatus, DATAOBJECT_ID_LEN};
pub use error::{Error, Result};
pub use interface::{Address, Interface, InterfaceKey, InterfaceKind, InterfaceRef, MAC_LEN};
pub use metadata::Metadata;
pub use node::{Node, NodeId, NodeRef, NodeType, NODE_DESCRIPTION_ATTR, NODE_ID_LEN};
pub use repository::{RepositoryEntry, RepositoryValue};
pub use time::Timestamp;
