pub mod env;
pub mod frames;
