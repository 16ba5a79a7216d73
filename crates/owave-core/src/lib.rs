pub mod alarm;
pub mod channel;
pub mod clock;
pub mod config;
pub mod control;
pub mod layout;
pub mod print_lock;
pub mod pulse;
pub mod receiver;
pub mod render;
pub mod seqlock;
pub mod severity;
pub mod text;

pub use alarm::{AlarmChannel, AlarmRecord, AlarmState, AlarmTracker};
pub use channel::{
    region_name, unlink_region, AttachConfig, AttachError, AttachPolicy, ChannelError, Ownership,
    Region,
};
pub use clock::{ClockChannel, ClockRecord, ClockState, ClockUpdater, ZoneSpec};
pub use config::{ConfigError, DashboardConfig};
pub use control::{ControlChannel, ControlRecord, ControlSettings, Lifecycle};
pub use layout::DashboardLayout;
pub use print_lock::{LockError, PrintLock};
pub use pulse::{Generator, GeneratorError, PulseSchedule, SignalSink, TargetError, TargetPid};
pub use receiver::{PulseReceiver, PulseWorker, ReceiverError};
pub use render::{AlarmPanel, ClockPanel, RenderLoop, RenderReport, TerminalSurface};
pub use severity::{Classifier, DisplayCursor, Severity};
