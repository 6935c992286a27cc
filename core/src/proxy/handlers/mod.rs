// Handlers module - HTTP surface

pub mod control;
pub mod forward;
