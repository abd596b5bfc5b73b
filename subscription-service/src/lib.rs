//! Subscription Service - plan subscriptions, renewals and metered feature usage.

pub mod clock;
pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod startup;
