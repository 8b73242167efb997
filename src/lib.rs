pub mod clock;
pub mod config;
pub mod conflict;
pub mod connectivity;
pub mod correction;
pub mod credential;
pub mod db;
pub mod device;
pub mod error;
pub mod kiosk;
pub mod model;
pub mod queue;
pub mod remote;
pub mod state_machine;
pub mod sync;
