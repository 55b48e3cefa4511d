pub mod applier;
pub mod event_loop;
pub mod fan_in;
pub mod generated_config;
pub mod supervisor;
pub mod task;
pub mod watcher;

pub use applier::{ApplyError, ChangeApplier, MaterializedTemplates};
pub use event_loop::{EVENT_CHANNEL_CAPACITY, run};
pub use fan_in::fan_in;
pub use generated_config::{GENERATED_MARKER, regenerate, rendered_destination};
pub use supervisor::{
    ProcessSlot, ProcessSupervisor, ReloadOutcome, ReloadSignal, ReloadTarget, SupervisorSettings,
    SupervisorState, process_slot,
};
pub use task::{Outcome, Resumable, ResumableTask, Step, TaskError};
pub use watcher::{ChangeEvent, KvWatcher, WatchState, WatcherSettings};
