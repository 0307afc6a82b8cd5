pub mod helpers;
pub mod workers;
