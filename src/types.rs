pub mod job;
pub mod pipeline;
pub mod protocol;
pub mod serialisable;
pub mod stat;
pub mod states;
