pub mod archive;
pub mod assets;
pub mod command;
pub mod config;
pub mod error;
pub mod fsops;
mod hashing;
pub mod info;
pub mod outcome;
pub mod protocol;
pub mod provenance;
pub mod runner;
pub mod runtime;
pub mod version;

pub use archive::{ArchiveCache, CachedInstallation};
pub use assets::{AssetSource, DirAssetSource};
pub use command::{
    BootImageSpec, CommandSpec, CommandSpecBuilder, InvocationRequest, PatchFileRequest,
    PatchSelection, SupportCheckRequest, UnsupportedOptions,
};
pub use config::PatcherConfig;
pub use error::{PatcherError, Result};
pub use fsops::{FileOps, LocalFileOps};
pub use info::PatcherInfo;
pub use outcome::{PatchResult, ProcessOutcome};
pub use protocol::{FullOutputCapture, MarkerParser};
pub use runner::{
    CommandListener, CommandResult, CommandRunner, NullListener, OutputStream, RunningCommand,
};
pub use runtime::PatcherRuntime;
pub use version::ToolchainVersion;
