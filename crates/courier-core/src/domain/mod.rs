//! Domain model: identifiers, envelopes, options, states, errors.

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod options;
pub mod state;
pub mod task_type;

pub use self::envelope::{DEFAULT_MAX_RETRY, DEFAULT_QUEUE, TaskEnvelope, UniqueLock};
pub use self::errors::{CourierError, CourierResult, ErrorKind};
pub use self::ids::{LeaseId, TaskId};
pub use self::options::{ProcessAt, TaskOptions};
pub use self::state::TaskState;
pub use self::task_type::TaskType;
