pub mod frame;
pub mod gateway;
pub mod report;
