//! Renewal of issued certificates.
//!
//! Each valid order carries a [`RenewalInfo`] window, taken from the CA's
//! ARI endpoint when available and computed from the certificate's validity
//! otherwise. The [`RenewalScheduler`] periodically draws a time inside each
//! window and places a new order once that time is within one interval.

mod info;
mod scheduler;

pub use info::{
    RenewalInfo, REMAINING_FRACTION, SHORT_LIVED_REMAINING_FRACTION, SHORT_LIVED_THRESHOLD,
    SHORT_LIVED_WINDOW_SPAN, WINDOW_JITTER_SECS, WINDOW_SPAN,
};
pub use scheduler::{RenewalScheduler, RenewalSweep};
