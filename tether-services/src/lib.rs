pub mod httpraw;
pub mod offshore;
pub mod ship;
pub mod tunnel;
