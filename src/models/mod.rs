pub mod availability;
pub mod booking;
pub mod events;
pub mod geo;
pub mod ledger;
pub mod matching;
pub mod site;
pub mod therapist;
pub mod user;

pub use availability::{HoursRange, OpenWindow, TherapistAvailability, TransportConfig, TransportMode, TransportModes};
pub use booking::{Booking, BookingEvent, BookingMode, BookingStatus, LineItem, PaymentStatus};
pub use events::LifecycleEvent;
pub use geo::Coordinates;
pub use ledger::{Payout, ReconciliationItem, ReconciliationKind};
pub use matching::{MatchCandidate, MatchRequest};
pub use site::Site;
pub use therapist::Therapist;
pub use user::User;
