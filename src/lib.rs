pub mod clusters;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod helpers;
pub mod platform;
pub mod postgres;
pub mod quantity;
