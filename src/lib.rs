pub mod controller;
pub mod crd;
pub mod error;
pub mod helpers;
