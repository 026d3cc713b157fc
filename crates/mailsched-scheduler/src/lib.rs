//! `mailsched-scheduler`: polls the event store and dispatches due events.
//!
//! # Overview
//!
//! The [`engine::Dispatcher`] scans for `pending` events whose `scheduled_at`
//! has passed, claims each one with a single conditional update and hands a
//! [`mailsched_core::DeliveryJob`] to the delivery worker pool.
//!
//! | Step     | Effect                                               |
//! |----------|------------------------------------------------------|
//! | scan     | `find_due(now, batch_size)`, earliest first          |
//! | reserve  | wait for room in the dispatch queue                  |
//! | claim    | `pending → claimed`; losers skip the event           |
//! | send     | enqueue the job on the reserved slot                 |

pub mod engine;
pub mod error;

pub use engine::{Dispatcher, DispatcherSettings, TickReport};
pub use error::{Result, SchedulerError};
