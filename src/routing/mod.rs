pub mod acl;
pub mod affiliation;
pub mod call_events;
pub mod contention;
pub mod link_control;
pub mod rewriter;
pub mod router;
pub mod rules;
pub mod slot_status;
pub mod snapshot;
