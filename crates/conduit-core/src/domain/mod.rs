//! Domain model (envelope, records, responses, errors, ids).

pub mod envelope;
pub mod errors;
pub mod feedback;
pub mod ids;
pub mod record;
pub mod response;

pub use self::envelope::{Action, CallerId, HandlerName, TaskEnvelope};
pub use self::errors::{BridgeErrorKind, ErrorKind, GatewayError, Rejection, RejectionCode};
pub use self::feedback::{FeedbackCommand, FeedbackSubmission, ValidFeedback};
pub use self::ids::{GenerationId, InteractionId};
pub use self::record::{FeedbackRecord, GenerationMapping, InteractionRecord, NonceRecord};
pub use self::response::{NormalizedResponse, ResponseStatus};
