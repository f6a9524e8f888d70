pub mod bids;
pub mod config;
pub mod derivatives;
pub mod domain;
pub mod eddy;
pub mod error;
pub mod layout;
pub mod nifti;
pub mod output;
pub mod overview;
pub mod tools;
pub mod topup;
pub mod workflow;
