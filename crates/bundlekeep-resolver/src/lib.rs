mod resolve;
mod source;

pub use resolve::{resolve, ResolveError, ResolveRequest, Resolution};
pub use source::VersionSource;
