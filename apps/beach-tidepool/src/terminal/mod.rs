pub mod launch;
pub mod mock;
pub mod output;
pub mod pty;
pub mod registry;
pub mod resize;
pub mod session;
pub mod shell;
pub mod termination;
pub mod timer;

pub use output::{OutputSettings, SessionEvent, SubscriberId};
pub use registry::{SessionError, SessionExit, SessionOptions, SessionRegistry};
pub use resize::{Dimensions, ResizeOutcome, ResizeSettings};
pub use session::{Attachment, Session, SessionId, SessionSettings, SessionSummary};
