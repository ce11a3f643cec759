mod command;
mod fetch;
mod fs_ops;
mod health;
mod install;
mod rollback;
mod supervisor;

pub use command::{run_command, run_handler};
pub use fetch::{ArtifactFetcher, HttpFetcher};
pub use fs_ops::{find_file_named, replace_file};
pub use health::{HealthChecker, HttpProbe, LivenessProbe};
pub use install::{AtomicInstaller, DownloadSpec, InstallReport, InstallerSettings, PreparedArtifact};
pub use rollback::{CleanupReport, RollbackManager};
pub use supervisor::{stop_gracefully, ServiceSupervisor, StopPolicy, SystemdSupervisor};
