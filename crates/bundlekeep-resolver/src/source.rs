use anyhow::Result;

/// Remote catalog of the versions a channel offers for a package.
pub trait VersionSource {
    fn package_versions(&self, package_name: &str, channel: &str) -> Result<Vec<String>>;
}

impl<T: VersionSource + ?Sized> VersionSource for &T {
    fn package_versions(&self, package_name: &str, channel: &str) -> Result<Vec<String>> {
        (**self).package_versions(package_name, channel)
    }
}
