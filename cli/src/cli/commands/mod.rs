pub mod providers;
pub mod select;
pub mod start;
pub mod status;
