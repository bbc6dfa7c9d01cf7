pub mod bot;
pub mod cache;
pub mod classification;
pub mod compliance;
pub mod handoff;
pub mod session;
pub mod threshold;
