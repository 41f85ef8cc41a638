pub mod bridge;
pub mod capture;
pub mod dispatch;
pub mod supervisor;
pub mod transport;
