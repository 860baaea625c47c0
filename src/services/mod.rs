pub mod approval;
pub mod events;
pub mod geocoding;
pub mod lifecycle;
pub mod matching;
pub mod notify;
pub mod payment;
pub mod workflow;
