pub mod domain;
pub mod grpc;
pub mod ip;
pub mod path;

pub use domain::{DomainPattern, DomainPatternError};
pub use grpc::{GrpcPolicy, GrpcRequest};
pub use ip::{IpMatcher, IpPatternError};
pub use path::{GlobError, PathGlob, PathMatcher};
