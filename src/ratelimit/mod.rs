//! OTP admission control: window state, the local policy, external
//! decisioning and stale-entry eviction.

mod clock;
mod decision;
mod external;
mod identifier;
mod limiter;
mod policy;
mod reaper;
mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::{DenialReason, ExternalDecision, RateLimitDecision, ReasonKind, RequestContext};
pub use external::{AdapterError, AdapterSettings, ExternalDecisionAdapter};
pub use identifier::{Identifier, Purpose};
pub use limiter::OtpRateLimiter;
pub use policy::{CountMode, LocalPolicy, PolicyConfig, RateLimitStats};
pub use reaper::{sweep, Reaper, ReaperConfig, ReaperHandle};
pub use window::{WindowEntry, WindowStore};
