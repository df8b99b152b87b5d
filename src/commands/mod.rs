mod build;
mod version;

pub use build::BuildCommand;
pub use version::VersionCommand;
