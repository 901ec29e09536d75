pub mod protocol;
pub mod pty;
pub mod supervisor;

pub use protocol::{StreamDecoder, StreamSignal, ToolCorrelator};
pub use pty::{AgentLauncher, LaunchRequest, LaunchedProcess, PtyLauncher};
pub use supervisor::{AgentProcessSupervisor, SpawnOptions};
