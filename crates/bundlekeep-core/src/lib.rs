mod package;
mod spec;
mod version;

pub use package::{normalize_plugin_names, normalized_name, InstalledPackage, PackageSource};
pub use spec::VersionSpec;
pub use version::{is_stable_version, is_update, sort_versions, PackageVersion};

pub const DEFAULT_CHANNEL: &str = "conda-forge";
pub const DEFAULT_CATALOG_URL: &str = "https://api.anaconda.org";
