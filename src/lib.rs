pub mod backend;
pub mod dap;
pub mod log;
pub mod session;
