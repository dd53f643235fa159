//! Rate limiting logic and state management.

mod admission;
mod allowlist;
mod bans;
mod decision;
mod degradation;
mod identifier;
mod limiter;
mod profile;
mod window;

pub use admission::{AdmissionController, RequestContext, StatusSnapshot, Transport};
pub use allowlist::Allowlist;
pub(crate) use allowlist::parse_network;
pub use bans::{BanRecord, BanTracker};
pub use decision::{Decision, DenyReason, Quota, Verdict};
pub use degradation::{
    spawn_sampler, Admission, DegradationController, DegradationLevel, LoadProbe,
    StaticLoadProbe, SystemLoadProbe,
};
pub use identifier::{Identifier, IdentifierClass};
pub use limiter::RateLimiter;
pub use profile::{pattern_matches, EndpointProfile, LimitProfile, ProfileSet, ResolvedProfile};
pub use window::TimeWindow;
