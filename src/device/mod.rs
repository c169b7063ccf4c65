pub mod protocol;
pub mod recognition;
