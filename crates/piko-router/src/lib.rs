//! Routing of proxied requests to tunnels
//!
//! The registry tracks which tunnel connections serve which endpoint and picks
//! one per request. Resolvers decide which endpoint a request is for.

pub mod registry;
pub mod resolve;

pub use registry::{RegistryError, TunnelRegistry};
pub use resolve::{
    default_resolver, ChainResolver, EndpointResolver, FixedResolver, HeaderResolver,
    HostResolver, PathPrefixResolver,
};
