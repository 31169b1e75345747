//! Denial-appeal core: the case model, its lifecycle controller, reply
//! correlation and letter composition.

pub mod audit;
pub mod case;
pub mod composer;
pub mod controller;
pub mod correlator;
pub mod flight;
pub mod plans;
pub mod policy;

pub use self::controller::{CaseController, ControllerParts, MailIdentity};
pub use self::correlator::ThreadCorrelator;
pub use self::plans::PlanService;
