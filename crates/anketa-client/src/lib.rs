//! Client runtime for one or more open consultation sessions.
//!
//! A [`SessionContext`] owns everything a session view needs: the
//! reconciled form model, the adaptive poller, the debounced save path and
//! the reconnect coordinator for the live media room. Contexts are
//! independent; several may be open at once.

mod api;
mod context;
mod debounce;
mod error;
mod loopback;
mod poller;
mod reconcile;
mod reconnect;

pub use api::{HttpSessionApi, HttpSessionApiConfig, SessionApi};
pub use context::{ContextConfig, SessionContext, SessionNotice, SessionTarget};
pub use debounce::{FlushOutcome, SaveDebounceConfig, SaveDebouncer};
pub use error::{ClientError, ClientResult};
pub use loopback::LoopbackMediaTransport;
pub use poller::{
    select_poll_interval, start_session_poller, PollObserver, PollerConfig, PollerHandle,
    PollerSignals,
};
pub use reconcile::{FieldEditRecord, FormModel, PendingSave, ReconcileOutcome};
pub use reconnect::{
    CaptureDecision, ConnectReason, MediaConnection, MediaEvent, MediaRoom, MediaTransport,
    PlaybackHandle, ReconnectCoordinator, ReconnectPolicy, ReconnectReport,
};
