//! Knowledge mesh protocol
//!
//! Every node keeps a store of immutable, content-addressed data objects and
//! can ask its peers for objects it does not hold. Each node is both a
//! client and a server.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────┐  resolve?id&skip  ┌──────┐  resolve?id&skip  ┌──────┐
//!  │Node A│──────────────────►│Node B│──────────────────►│Node C│
//!  │      │◄──────────────────│      │◄──────────────────│(has) │
//!  └──────┘     found url     └──────┘     found url     └──────┘
//!     │                                                     ▲
//!     └──────────────── GET /fetch/<file> ──────────────────┘
//! ```
//!
//! ## Identifiers
//! - An object's identifier is the SHA-256 of its content plus its kind
//! - Anyone holding the bytes can check them against the identifier
//!
//! ## Resolution
//! - Local store first, then peers one at a time in registration order
//! - Every query carries a skip list of node identities already asked
//! - A node on the skip list is never asked again, so cycles terminate
//! - Unreachable peers count as a miss for that peer only
//! - A holder whose file cannot be downloaded is skipped and the lookup goes on
//!
//! ## Transfer
//! - The node holding the object stages it as a container file
//! - The file is served exactly once, then deleted

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod node;
pub mod object;
pub mod peer;
pub mod persist;
pub mod resolve;
pub mod routes;
pub mod staging;
pub mod store;
pub mod types;

pub use codec::{ContainerCodec, JsonContainerCodec};
pub use config::NodeConfig;
pub use error::{MeshError, Result};
pub use node::KnowledgeNode;
pub use object::{DataObject, LeafObject, TableObject};
pub use peer::{Liveness, Peer, PeerRegistry};
pub use persist::{JsonFilePeerStore, MemoryPeerStore, PeerAddress, PeerStore};
pub use resolve::{Lookup, Resolver};
pub use store::{CachePolicy, ObjectStore};
pub use types::*;
