use std::fmt;

pub const DEFAULT_ARCHIVE_TEMPLATE: &str = "DualBootPatcherAndroid-{version}.tar.xz";
pub const DEFAULT_DIR_TEMPLATE: &str = "DualBootPatcherAndroid-{version}";

/// Only the part of the app version before the first `-` is kept.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ToolchainVersion(String);

impl ToolchainVersion {
    pub fn from_app_version(app_version: &str) -> Self {
        let version = app_version.split('-').next().unwrap_or_default();
        Self(version.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn archive_file_name(&self, template: &str) -> String {
        render_template(template, &self.0)
    }

    pub fn dir_name(&self, template: &str) -> String {
        render_template(template, &self.0)
    }
}

impl fmt::Display for ToolchainVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn render_template(template: &str, version: &str) -> String {
    template.replace("{version}", version)
}
