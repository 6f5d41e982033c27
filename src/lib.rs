pub mod debugger;
pub mod service;
pub mod version;
