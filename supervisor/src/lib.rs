//! Supervises interactive programs running on pseudo-terminals: spawning,
//! input, resizing, output fan-out and idle/active tracking.

mod backend;
mod config;
mod error;
mod event;
mod fanout;
mod instance;
mod process_id;
mod registry;
mod state;
mod supervisor;
mod timer;

pub use backend::ExitInfo;
pub use backend::PortablePtyBackend;
pub use backend::PtyBackend;
pub use backend::PtyProcess;
pub use backend::SpawnRequest;
pub use backend::SpawnedPty;
pub use config::DEFAULT_IDLE_THRESHOLD_MS;
pub use config::DEFAULT_REDRAW_SUPPRESSION_MS;
pub use config::DEFAULT_RESTART_SETTLE_MS;
pub use config::ProcessConfig;
pub use config::SupervisorConfig;
pub use config::TerminalSize;
pub use error::ConfigError;
pub use error::SupervisorError;
pub use event::EventMetadata;
pub use event::OutputChannel;
pub use event::OutputChunk;
pub use event::ProcessEvent;
pub use event::ProcessEventKind;
pub use fanout::Subscription;
pub use process_id::ProcessId;
pub use state::ProcessState;
pub use state::ProcessStatus;
pub use supervisor::Supervisor;
pub use timer::TimerCallback;
pub use timer::TimerHandle;
pub use timer::TimerService;
pub use timer::TokioTimer;

pub type Result<T> = std::result::Result<T, SupervisorError>;
