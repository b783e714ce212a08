//! Custom Resource Definitions for cnat

mod at;

pub use at::{
    is_pod_terminal, new_pod_for_at, time_until_schedule, At, AtPhase, AtSpec, AtStatus,
    SCHEDULE_LAYOUT,
};
